//! Core contracts for the musubi orchestration engine.
//!
//! This crate provides the types and traits shared by the engine and by
//! action authors, without runtime dependencies. Depend on it to implement
//! actions or a storage backend.
//!
//! # Core Types
//!
//! - [`Action`] / [`RollbackAction`] - Pluggable units of work
//! - [`ExecuteContext`] - Correlation id and [`ShareData`] for one invocation
//! - [`FlowTemplate`] / [`TaskTemplate`] - Declarative DAG blueprints
//! - [`Store`] - Persistence contract with compare-and-swap updates
//! - [`RetryPolicy`] - Bounded attempts with jittered sleeps
//! - [`EngineError`] - Error taxonomy

mod action;
mod context;
mod error;
mod filter;
mod model;
mod retry;
mod share;
mod state;
mod store;
mod template;

pub use action::{decode_params, Action, ActionId, ActionName, RollbackAction};
pub use context::ExecuteContext;
pub use error::{EngineError, RecordKind, Result};
pub use filter::{AtomRule, Expression, LogicOp, Operator, Rule};
pub use model::{
    truncate_runes, Flow, FlowReason, FlowStateUpdate, ResourceFlowLock, ResourceFlowRel,
    ResourceKey, Task, TaskDetail, TaskDetailUpdate, TaskManagement, TaskUpdate,
};
pub use retry::{RetryPolicy, RetryPolicyError, TaskRetry};
pub use share::ShareData;
pub use state::{DetailState, FlowState, ManagementState, RelStatus, TaskState};
pub use store::{merge_ids, split_ids, Store};
pub use template::{topological_order, FlowTemplate, TaskTemplate};
