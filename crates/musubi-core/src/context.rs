//! Execution context handed to every action invocation.

use crate::action::ActionId;
use crate::error::{EngineError, Result};
use crate::share::ShareData;
use crate::state::FlowState;
use crate::store::Store;
use std::sync::Arc;
use uuid::Uuid;

/// Request-scoped handle an [`Action`](crate::Action) runs with.
///
/// Carries the correlation id used to trace downstream calls, the flow and
/// task being executed, and the flow's [`ShareData`].
#[derive(Debug, Clone)]
pub struct ExecuteContext {
    rid: String,
    async_originated: bool,
    action_id: ActionId,
    share_data: ShareData,
}

impl ExecuteContext {
    /// Creates a context for task `action_id` of `flow_id`.
    pub fn new(
        rid: impl Into<String>,
        flow_id: impl Into<String>,
        action_id: ActionId,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            rid: rid.into(),
            async_originated: false,
            action_id,
            share_data: ShareData::new(flow_id, store),
        }
    }

    /// Correlation id of the request this execution belongs to.
    pub fn rid(&self) -> &str {
        &self.rid
    }

    /// Returns `true` if this context was derived via [`Self::async_kit`].
    pub fn is_async_originated(&self) -> bool {
        self.async_originated
    }

    /// Same context, tagged as originating from asynchronous execution.
    pub fn async_kit(&self) -> Self {
        Self {
            async_originated: true,
            ..self.clone()
        }
    }

    /// Same context with a freshly generated correlation id.
    pub fn new_sub_kit(&self) -> Self {
        Self {
            rid: Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    /// Returns the id of the flow being executed.
    pub fn flow_id(&self) -> &str {
        self.share_data.flow_id()
    }

    /// Returns the id of the task being executed.
    pub fn action_id(&self) -> &ActionId {
        &self.action_id
    }

    /// The flow's ShareData.
    pub fn share_data(&self) -> &ShareData {
        &self.share_data
    }

    /// Fails with [`EngineError::Cancelled`] if the flow was cancelled.
    ///
    /// Actions call this right before an external side effect.
    pub async fn check_cancelled(&self) -> Result<()> {
        let flow = self.share_data.store().get_flow(self.flow_id()).await?;
        if flow.state == FlowState::Cancel {
            return Err(EngineError::Cancelled(format!("flow {} was cancelled", flow.id)));
        }
        Ok(())
    }
}
