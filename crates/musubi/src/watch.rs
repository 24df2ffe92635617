//! Bridges a flow's completion into lock release and relation status.

use crate::config::WatchConfig;
use crate::lock::{is_stale, ResourceLocker};
use async_trait::async_trait;
use chrono::Utc;
use musubi_core::{
    decode_params, Action, ActionName, EngineError, ExecuteContext, FlowState, FlowTemplate,
    RelStatus, ResourceKey, Result, Store, TaskTemplate,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name the watch action registers under.
pub const FLOW_WATCH: &str = "flow_watch";

/// Slack added on top of the watch deadline for the task timeout.
const WATCH_TIMEOUT_MARGIN_SECS: u64 = 60;

/// What to watch and what to release once it finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowWatchParams {
    /// The flow being watched.
    pub flow_id: String,
    /// The locked resource.
    pub res_id: String,
    pub res_type: String,
    /// Sub-resources bound to the flow without a lock.
    #[serde(default)]
    pub sub_res_ids: Vec<String>,
    #[serde(default)]
    pub sub_res_type: String,
    #[serde(default)]
    pub task_type: String,
}

impl FlowWatchParams {
    /// Watches `flow_id` and releases the lock on `key`.
    pub fn new(flow_id: impl Into<String>, key: &ResourceKey) -> Self {
        Self {
            flow_id: flow_id.into(),
            res_id: key.res_id.clone(),
            res_type: key.res_type.clone(),
            sub_res_ids: Vec::new(),
            sub_res_type: String::new(),
            task_type: String::new(),
        }
    }

    /// Returns the locked resource's key.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.res_id, &self.res_type)
    }

    fn sub_keys(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        self.sub_res_ids
            .iter()
            .map(|id| ResourceKey::new(id, &self.sub_res_type))
    }
}

/// How a watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchOutcome {
    /// Terminal state observed, or `None` if the flow no longer exists.
    pub flow_state: Option<FlowState>,
    pub status: RelStatus,
    /// `false` if the lock was already gone or owned by another flow.
    pub released: bool,
}

/// Action that polls a flow until it is terminal, then releases its lock.
///
/// A watch that reaches its deadline, or is cancelled, returns an error
/// without touching any row.
#[derive(Clone)]
pub struct FlowWatchAction {
    store: Arc<dyn Store>,
    locker: ResourceLocker,
    config: WatchConfig,
    shutdown: Option<CancellationToken>,
}

impl std::fmt::Debug for FlowWatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowWatchAction")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FlowWatchAction {
    /// Creates a watch action; fails if `config` is invalid.
    pub fn new(store: Arc<dyn Store>, locker: ResourceLocker, config: WatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            locker,
            config,
            shutdown: None,
        })
    }

    /// Stops every watch early once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Polls `params.flow_id` until it is terminal and releases its lock.
    pub async fn watch(&self, params: &FlowWatchParams) -> Result<WatchOutcome> {
        let deadline = Instant::now() + self.config.deadline();
        let key = params.key();

        loop {
            match self.store.get_flow(&params.flow_id).await {
                Ok(flow) if flow.state.is_terminal() => {
                    return self.release(params, &key, Some(flow.state)).await;
                }
                Ok(flow) => debug!(flow_id = %flow.id, state = %flow.state, "watched flow still active"),
                Err(e) if e.is_not_found() => {
                    let stale = self
                        .locker
                        .get(&key)
                        .await?
                        .map(|lock| is_stale(&lock, self.config.lock_stale_window(), Utc::now()))
                        .unwrap_or(false);
                    if stale {
                        warn!(flow_id = %params.flow_id, resource = %key, "watched flow is gone, force releasing stale lock");
                        return self.release(params, &key, None).await;
                    }
                    return Err(e);
                }
                Err(e) => warn!(flow_id = %params.flow_id, error = %e, "could not read watched flow"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::Timeout(format!(
                    "flow {} did not finish within {}ms",
                    params.flow_id, self.config.deadline_ms
                )));
            }
            let nap = self.config.poll_interval().min(deadline - now);
            match &self.shutdown {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(EngineError::Cancelled(format!("watch of flow {}", params.flow_id)));
                        }
                        _ = tokio::time::sleep(nap) => {}
                    }
                }
                None => tokio::time::sleep(nap).await,
            }
        }
    }

    async fn release(&self, params: &FlowWatchParams, key: &ResourceKey, state: Option<FlowState>) -> Result<WatchOutcome> {
        let status = match state {
            Some(FlowState::Failed) => match self.locker.get(key).await? {
                Some(lock) if is_stale(&lock, self.config.lock_stale_window(), Utc::now()) => RelStatus::Timeout,
                _ => RelStatus::Cancel,
            },
            Some(state) => RelStatus::for_flow_state(state).unwrap_or(RelStatus::Cancel),
            None => RelStatus::Timeout,
        };

        // Sub-relations first: the lock row goes last so an interrupted
        // release leaves the resource locked and the watch can be re-run.
        for sub in params.sub_keys() {
            match self
                .store
                .update_flow_rel_status(&sub, &params.flow_id, status)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(flow_id = %params.flow_id, resource = %sub, "no relation to update for sub-resource");
                }
                Err(e) => return Err(e),
            }
        }
        let released = self.locker.release(key, &params.flow_id, status).await?;

        info!(
            flow_id = %params.flow_id,
            resource = %key,
            %status,
            released,
            sub_resources = params.sub_res_ids.len(),
            "watch finished"
        );
        Ok(WatchOutcome {
            flow_state: state,
            status,
            released,
        })
    }
}

#[async_trait]
impl Action for FlowWatchAction {
    fn name(&self) -> ActionName {
        ActionName::new(FLOW_WATCH)
    }

    async fn run(&self, _ctx: &ExecuteContext, params: Value) -> Result<Value> {
        let params: FlowWatchParams = decode_params(params)?;
        let outcome = self.watch(&params).await?;
        Ok(json!(outcome))
    }

    fn new_params(&self, raw: Value) -> Result<Value> {
        let params: FlowWatchParams = decode_params(raw)?;
        if params.flow_id.is_empty() || params.res_id.is_empty() {
            return Err(EngineError::InvalidParameter(
                "flow_watch needs flow_id and res_id".to_string(),
            ));
        }
        Ok(serde_json::to_value(params)?)
    }
}

/// One-task template running [`FlowWatchAction`] configured with `config`.
///
/// The task times out a minute after [`WatchConfig::deadline_ms`], so the
/// watch ends on its own deadline rather than the engine's default task
/// timeout.
pub fn watch_template(config: &WatchConfig) -> FlowTemplate {
    let timeout_secs = config.deadline_ms.div_ceil(1000) + WATCH_TIMEOUT_MARGIN_SECS;
    FlowTemplate::new(FLOW_WATCH)
        .task(TaskTemplate::new("1", FLOW_WATCH).with_timeout_secs(timeout_secs))
}
