//! State machines for flows, tasks and bulk-operation rows.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a flow.
///
/// `Init → Pending → Running → {Success, Failed, Cancel}`. A failed flow may go
/// back to `Pending` when one of its tasks is retried, or be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Instantiated; preconditions such as locks not yet confirmed.
    Init,
    /// Preconditions held; waiting for a scheduler to claim it.
    Pending,
    /// Tasks are being dispatched.
    Running,
    /// Every task succeeded.
    Success,
    /// A task failed and nothing else can make progress.
    Failed,
    /// Cancelled externally.
    Cancel,
}

impl FlowState {
    /// Returns `true` for states a watcher treats as final.
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Success | FlowState::Failed | FlowState::Cancel)
    }

    /// Returns `true` if `self → target` is a legal flow transition.
    pub fn can_transition_to(self, target: FlowState) -> bool {
        use FlowState::*;
        matches!(
            (self, target),
            (Init, Pending)
                | (Init, Cancel)
                | (Pending, Running)
                | (Pending, Cancel)
                | (Running, Pending)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancel)
                | (Failed, Pending)
                | (Failed, Cancel)
        )
    }

    /// Stable lowercase name, as persisted.
    pub fn as_str(self) -> &'static str {
        match self {
            FlowState::Init => "init",
            FlowState::Pending => "pending",
            FlowState::Running => "running",
            FlowState::Success => "success",
            FlowState::Failed => "failed",
            FlowState::Cancel => "cancel",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one task inside a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created with its flow, never dispatched.
    Init,
    /// Executing its action.
    Running,
    /// Its action's rollback is in progress.
    Rollback,
    /// Reverted or reset, eligible for a (re-)attempt.
    Pending,
    /// The action succeeded.
    Success,
    /// The action failed and no attempts remain.
    Failed,
    /// Cancelled with its flow.
    Cancel,
}

impl TaskState {
    /// Task states that have not reached an outcome.
    pub const UNFINISHED: [TaskState; 4] = [
        TaskState::Init,
        TaskState::Pending,
        TaskState::Running,
        TaskState::Rollback,
    ];

    /// Returns `true` if a dispatcher may start this task once its
    /// dependencies succeeded.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, TaskState::Init | TaskState::Pending)
    }

    /// Returns `true` while an action or its rollback holds the task.
    pub fn is_executing(self) -> bool {
        matches!(self, TaskState::Running | TaskState::Rollback)
    }

    /// Returns `true` if the task has begun executing at least once.
    pub fn has_started(self) -> bool {
        matches!(
            self,
            TaskState::Running | TaskState::Rollback | TaskState::Success | TaskState::Failed
        )
    }

    /// Returns `true` if `self → target` is a legal task transition.
    pub fn can_transition_to(self, target: TaskState) -> bool {
        use TaskState::*;
        match (self, target) {
            (Cancel, _) => false,
            (_, Cancel) => true,
            (Init | Pending, Running) => true,
            (Running, Success | Failed | Rollback | Pending) => true,
            (Success | Failed, Rollback) => true,
            (Rollback, Pending | Failed) => true,
            (Failed, Pending) => true,
            _ => false,
        }
    }

    /// Stable lowercase name, as persisted.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Init => "init",
            TaskState::Running => "running",
            TaskState::Rollback => "rollback",
            TaskState::Pending => "pending",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::Cancel => "cancel",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one item of a bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailState {
    /// Registered, not yet picked up.
    Init,
    /// The external operation is in flight.
    Running,
    /// The item succeeded.
    Success,
    /// The item failed.
    Failed,
    /// The item was cancelled before it ran.
    Cancel,
}

impl DetailState {
    /// Returns `true` once the item has an outcome.
    pub fn is_terminal(self) -> bool {
        matches!(self, DetailState::Success | DetailState::Failed | DetailState::Cancel)
    }

    /// Stable lowercase name, as persisted.
    pub fn as_str(self) -> &'static str {
        match self {
            DetailState::Init => "init",
            DetailState::Running => "running",
            DetailState::Success => "success",
            DetailState::Failed => "failed",
            DetailState::Cancel => "cancel",
        }
    }
}

impl fmt::Display for DetailState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate state of a bulk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagementState {
    /// At least one item has no outcome yet.
    Running,
    /// Every item succeeded.
    Success,
    /// Every item finished and at least one failed.
    Failed,
    /// The request was cancelled.
    Cancel,
}

impl fmt::Display for ManagementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManagementState::Running => "running",
            ManagementState::Success => "success",
            ManagementState::Failed => "failed",
            ManagementState::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// Status of a resource/flow relation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelStatus {
    /// The flow holds the resource.
    Executing,
    /// Released after the flow succeeded.
    Success,
    /// Released after the flow was cancelled or failed.
    Cancel,
    /// Force-released after the staleness window.
    Timeout,
}

impl RelStatus {
    /// Release status for a flow that reached `state`, or `None` while it
    /// has not.
    pub fn for_flow_state(state: FlowState) -> Option<RelStatus> {
        match state {
            FlowState::Success => Some(RelStatus::Success),
            FlowState::Cancel | FlowState::Failed => Some(RelStatus::Cancel),
            _ => None,
        }
    }
}

impl fmt::Display for RelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelStatus::Executing => "executing",
            RelStatus::Success => "success",
            RelStatus::Cancel => "cancel",
            RelStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_transitions() {
        assert!(FlowState::Init.can_transition_to(FlowState::Pending));
        assert!(FlowState::Pending.can_transition_to(FlowState::Running));
        assert!(FlowState::Running.can_transition_to(FlowState::Failed));
        assert!(FlowState::Failed.can_transition_to(FlowState::Pending));
        assert!(FlowState::Running.can_transition_to(FlowState::Pending));
        assert!(!FlowState::Init.can_transition_to(FlowState::Running));
        assert!(!FlowState::Success.can_transition_to(FlowState::Pending));
        assert!(!FlowState::Cancel.can_transition_to(FlowState::Running));
    }

    #[test]
    fn test_task_transitions() {
        assert!(TaskState::Init.can_transition_to(TaskState::Running));
        assert!(TaskState::Running.can_transition_to(TaskState::Rollback));
        assert!(TaskState::Success.can_transition_to(TaskState::Rollback));
        assert!(TaskState::Rollback.can_transition_to(TaskState::Pending));
        assert!(TaskState::Running.can_transition_to(TaskState::Cancel));
        assert!(!TaskState::Cancel.can_transition_to(TaskState::Pending));
        assert!(!TaskState::Success.can_transition_to(TaskState::Running));
        assert!(!TaskState::Init.can_transition_to(TaskState::Success));
    }

    #[test]
    fn test_rel_status_for_flow_state() {
        assert_eq!(RelStatus::for_flow_state(FlowState::Success), Some(RelStatus::Success));
        assert_eq!(RelStatus::for_flow_state(FlowState::Failed), Some(RelStatus::Cancel));
        assert_eq!(RelStatus::for_flow_state(FlowState::Cancel), Some(RelStatus::Cancel));
        assert_eq!(RelStatus::for_flow_state(FlowState::Running), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&TaskState::Rollback).unwrap_or_default();
        assert_eq!(json, "\"rollback\"");
        assert_eq!(FlowState::Pending.to_string(), "pending");
    }
}
