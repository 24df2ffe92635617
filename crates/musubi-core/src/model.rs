//! Persisted records and the update payloads the store applies to them.

use crate::action::{ActionId, ActionName};
use crate::retry::TaskRetry;
use crate::template::TaskTemplate;
use crate::state::{DetailState, FlowState, ManagementState, RelStatus, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Why a flow left the state it was in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowReason {
    /// State the flow was in when the reason was recorded.
    pub pre_state: Option<FlowState>,
    /// Human-readable message, already truncated.
    pub message: String,
}

/// One instantiated, stateful execution of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Unique flow id.
    pub id: String,
    /// Name of the template the flow was built from, or a free-form name.
    pub name: String,
    /// Current lifecycle state.
    pub state: FlowState,
    /// Caller-supplied note.
    pub memo: Option<String>,
    /// Why the flow last changed state, if recorded.
    pub reason: Option<FlowReason>,
    /// ShareData seed the flow was created with; kept for cloning.
    pub initial_share_data: BTreeMap<String, String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
}

/// One node of a flow's dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Flow the task belongs to.
    pub flow_id: String,
    /// Id of the task within its flow.
    pub action_id: ActionId,
    /// Registered action the task runs.
    pub action_name: ActionName,
    /// Tasks that must succeed before this one is dispatched.
    pub depend_on: Vec<ActionId>,
    /// Input handed to the action.
    pub params: Value,
    /// Per-task retry policy.
    pub retry: TaskRetry,
    /// Per-attempt timeout; the engine default applies when unset.
    pub timeout_secs: Option<u64>,
    /// Current lifecycle state.
    pub state: TaskState,
    /// How many times the task was reverted for a re-run.
    pub rollback_count: u32,
    /// Output of the last successful run.
    pub result: Option<Value>,
    /// Failure message of the last run, already truncated.
    pub reason: Option<String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// The blueprint this task was instantiated from, without its state.
    pub fn template(&self) -> TaskTemplate {
        TaskTemplate {
            action_id: self.action_id.clone(),
            action_name: self.action_name.clone(),
            depend_on: self.depend_on.clone(),
            params: Some(self.params.clone()),
            retry: self.retry,
            timeout_secs: self.timeout_secs,
        }
    }
}

/// Composite key a [`ResourceFlowLock`] is held on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub res_id: String,
    pub res_type: String,
}

impl ResourceKey {
    /// Creates a key.
    pub fn new(res_id: impl Into<String>, res_type: impl Into<String>) -> Self {
        Self {
            res_id: res_id.into(),
            res_type: res_type.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.res_type, self.res_id)
    }
}

/// Storage-backed mutex row: at most one exists per [`ResourceKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFlowLock {
    pub res_id: String,
    pub res_type: String,
    /// Id of the flow holding the lock.
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

impl ResourceFlowLock {
    /// Returns the key this lock is held on.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.res_id, &self.res_type)
    }
}

/// Audit row binding a resource to the flow that operated on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFlowRel {
    pub res_id: String,
    pub res_type: String,
    pub flow_id: String,
    pub task_type: String,
    pub status: RelStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceFlowRel {
    /// Creates an `Executing` relation for `key` owned by `flow_id`.
    pub fn executing(key: &ResourceKey, flow_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            res_id: key.res_id.clone(),
            res_type: key.res_type.clone(),
            flow_id: flow_id.into(),
            task_type: task_type.into(),
            status: RelStatus::Executing,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Progress of one item of a bulk operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetail {
    /// Unique detail id.
    pub id: String,
    /// The [`TaskManagement`] this item belongs to.
    pub management_id: String,
    /// Flow processing the item, once bound.
    pub flow_id: Option<String>,
    /// Task processing the item, once bound.
    pub action_id: Option<ActionId>,
    /// The item's own input, e.g. one instance id.
    pub param: Value,
    /// Current item state.
    pub state: DetailState,
    /// Output recorded for the item.
    pub result: Option<Value>,
    /// Failure message for the item, already truncated.
    pub reason: Option<String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
}

/// Aggregate over the details of one bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskManagement {
    pub id: String,
    pub state: ManagementState,
    pub flow_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Compare-and-swap transition of a flow's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowStateUpdate {
    pub flow_id: String,
    /// State the stored row must still be in.
    pub source: FlowState,
    pub target: FlowState,
    /// Replaces the stored reason when set.
    pub reason: Option<FlowReason>,
}

/// Compare-and-swap update of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub flow_id: String,
    pub action_id: ActionId,
    /// States the stored row may be in; empty accepts any state.
    pub expected: Vec<TaskState>,
    pub target: TaskState,
    pub result: Option<Value>,
    pub reason: Option<String>,
    pub rollback_count: Option<u32>,
}

impl TaskUpdate {
    /// Transition from one of `expected` to `target`, leaving other fields untouched.
    pub fn transition(
        flow_id: impl Into<String>,
        action_id: ActionId,
        expected: impl Into<Vec<TaskState>>,
        target: TaskState,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            action_id,
            expected: expected.into(),
            target,
            result: None,
            reason: None,
            rollback_count: None,
        }
    }

    /// Also stores `result`.
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Also stores `reason`.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Also sets the rollback counter.
    pub fn with_rollback_count(mut self, count: u32) -> Self {
        self.rollback_count = Some(count);
        self
    }
}

/// One tuple of a bulk detail update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetailUpdate {
    pub id: String,
    /// States the stored row may be in; empty accepts any state.
    #[serde(default)]
    pub expected: Vec<DetailState>,
    pub state: DetailState,
    pub result: Option<Value>,
    pub reason: Option<String>,
}

impl TaskDetailUpdate {
    /// Update that only moves the row to `state`, whatever it is in now.
    pub fn state(id: impl Into<String>, state: DetailState) -> Self {
        Self {
            id: id.into(),
            expected: Vec::new(),
            state,
            result: None,
            reason: None,
        }
    }

    /// Restricts the update to rows currently in one of `expected`.
    pub fn expecting(mut self, expected: impl Into<Vec<DetailState>>) -> Self {
        self.expected = expected.into();
        self
    }
}

/// Keeps at most `budget` characters of `text`.
///
/// Counts `char`s, not bytes, so multi-byte input is never split.
///
/// # Examples
///
/// ```
/// use musubi_core::truncate_runes;
///
/// assert_eq!(truncate_runes("負荷分散装置", 2), "負荷");
/// assert_eq!(truncate_runes("ok", 10), "ok");
/// ```
pub fn truncate_runes(text: &str, budget: usize) -> String {
    match text.char_indices().nth(budget) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}
