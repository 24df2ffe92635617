//! Engine error types.

use crate::action::ActionName;
use thiserror::Error;

/// The kind of record a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A flow row.
    Flow,
    /// A task row.
    Task,
    /// A registered flow template.
    Template,
    /// A registered action.
    Action,
    /// A resource flow lock row.
    Lock,
    /// A resource/flow relation row.
    FlowRel,
    /// A batch task detail row.
    TaskDetail,
    /// A task management row.
    TaskManagement,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Flow => write!(f, "flow"),
            RecordKind::Task => write!(f, "task"),
            RecordKind::Template => write!(f, "template"),
            RecordKind::Action => write!(f, "action"),
            RecordKind::Lock => write!(f, "resource flow lock"),
            RecordKind::FlowRel => write!(f, "resource flow relation"),
            RecordKind::TaskDetail => write!(f, "task detail"),
            RecordKind::TaskManagement => write!(f, "task management"),
        }
    }
}

/// Errors produced by the engine, its storage layer and actions.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// Malformed or mismatched parameters, or an illegal state transition.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A referenced row does not exist.
    #[error("Record not found: {kind} {id}")]
    RecordNotFound {
        /// What was looked up.
        kind: RecordKind,
        /// The identifier that was looked up.
        id: String,
    },

    /// Some items of a bulk operation succeeded and some failed.
    #[error("Partially failed: {} succeeded, {} failed: {details}", succeeded.len(), failed.len())]
    PartialFailed {
        /// Identifiers of the items that succeeded.
        succeeded: Vec<String>,
        /// Identifiers of the items that failed.
        failed: Vec<String>,
        /// Summary of the failures.
        details: String,
    },

    /// Fatal condition requiring operator attention.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// A compare-and-swap precondition did not hold, or a lock is held.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transient storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An action returned an error.
    #[error("Action '{action}' failed: {details}")]
    ActionFailed {
        /// The action that failed.
        action: ActionName,
        /// Details about the failure.
        details: String,
    },

    /// An operation exceeded its deadline.
    #[error("Timeout occurred in {0}")]
    Timeout(String),

    /// The surrounding flow or detail was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The engine configuration is invalid.
    #[error("Invalid engine configuration: {0}")]
    Configuration(String),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Shorthand for [`EngineError::RecordNotFound`].
    pub fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
        EngineError::RecordNotFound {
            kind,
            id: id.into(),
        }
    }

    /// Returns `true` if the error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(_))
    }

    /// Returns `true` for a missing row.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::RecordNotFound { .. })
    }

    /// Returns `true` for a failed compare-and-swap or a held lock.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

/// Result alias used throughout musubi.
pub type Result<T> = std::result::Result<T, EngineError>;
