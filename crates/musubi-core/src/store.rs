//! Storage contract consumed by the engine.
//!
//! All cross-task and cross-flow state goes through a [`Store`]; the engine
//! keeps nothing in memory that another worker would need.

use crate::action::ActionId;
use crate::error::Result;
use crate::filter::Expression;
use crate::model::{
    Flow, FlowStateUpdate, ResourceFlowLock, ResourceFlowRel, ResourceKey, Task, TaskDetail,
    TaskDetailUpdate, TaskManagement, TaskUpdate,
};
use crate::state::{ManagementState, RelStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Persistence for flows, tasks, ShareData, locks and bulk-operation rows.
///
/// Conditional writes report a precondition that no longer holds as
/// [`EngineError::Conflict`](crate::EngineError::Conflict); missing rows as
/// [`EngineError::RecordNotFound`](crate::EngineError::RecordNotFound);
/// transient backend failures as [`EngineError::Storage`](crate::EngineError::Storage).
#[async_trait]
pub trait Store: Send + Sync {
    /// Persists a flow together with its tasks.
    async fn create_flow(&self, flow: Flow, tasks: Vec<Task>) -> Result<()>;

    async fn get_flow(&self, flow_id: &str) -> Result<Flow>;

    async fn list_flows(&self, filter: &Expression) -> Result<Vec<Flow>>;

    /// Writes `update.target` only if the stored state is still `update.source`.
    async fn update_flow_state(&self, update: &FlowStateUpdate) -> Result<()>;

    async fn list_tasks(&self, flow_id: &str) -> Result<Vec<Task>>;

    async fn get_task(&self, flow_id: &str, action_id: &ActionId) -> Result<Task>;

    /// Applies `update` only if the stored task state is one of `update.expected`.
    async fn update_task(&self, update: &TaskUpdate) -> Result<()>;

    async fn get_share_data(&self, flow_id: &str) -> Result<BTreeMap<String, String>>;

    async fn set_share_data(&self, flow_id: &str, key: &str, value: &str) -> Result<()>;

    /// Merges `ids` into the comma-delimited value under `key`.
    ///
    /// Order of first appearance is kept and duplicates are dropped, so
    /// repeating a call with overlapping input leaves the same membership.
    async fn append_share_ids(&self, flow_id: &str, key: &str, ids: &[String]) -> Result<()>;

    /// Inserts `lock` if no lock exists for its key, and records `rel`, atomically.
    async fn lock_resource(&self, lock: ResourceFlowLock, rel: ResourceFlowRel) -> Result<()>;

    /// Deletes the lock on `key` if `owner` still holds it, and sets the
    /// status of the owner's relation row. Returns whether a lock was deleted.
    async fn unlock_resource(&self, key: &ResourceKey, owner: &str, status: RelStatus) -> Result<bool>;

    async fn get_lock(&self, key: &ResourceKey) -> Result<Option<ResourceFlowLock>>;

    async fn list_locks(&self, filter: &Expression) -> Result<Vec<ResourceFlowLock>>;

    async fn create_flow_rels(&self, rels: Vec<ResourceFlowRel>) -> Result<()>;

    /// Sets the status of the relation between `key` and `flow_id`.
    async fn update_flow_rel_status(&self, key: &ResourceKey, flow_id: &str, status: RelStatus) -> Result<()>;

    async fn list_flow_rels(&self, filter: &Expression) -> Result<Vec<ResourceFlowRel>>;

    async fn create_details(&self, details: Vec<TaskDetail>) -> Result<()>;

    async fn list_details(&self, filter: &Expression) -> Result<Vec<TaskDetail>>;

    /// Applies every update or none of them.
    ///
    /// Fails with [`EngineError::Conflict`](crate::EngineError::Conflict) when a
    /// row is not in one of its update's non-empty `expected` states.
    async fn update_details(&self, updates: &[TaskDetailUpdate]) -> Result<()>;

    /// Moves every still-`Init` detail of a management to `Cancel`.
    /// Returns how many rows changed.
    async fn cancel_init_details(&self, management_id: &str) -> Result<usize>;

    async fn create_management(&self, management: TaskManagement) -> Result<()>;

    async fn get_management(&self, id: &str) -> Result<TaskManagement>;

    async fn update_management_state(&self, id: &str, state: ManagementState) -> Result<()>;
}

/// Merges `ids` into a comma-delimited collection.
///
/// # Examples
///
/// ```
/// use musubi_core::merge_ids;
///
/// let once = merge_ids(None, &["a".into(), "b".into()]);
/// let twice = merge_ids(Some(&once), &["b".into(), "c".into()]);
/// assert_eq!(twice, "a,b,c");
/// ```
pub fn merge_ids(existing: Option<&str>, ids: &[String]) -> String {
    let mut merged: Vec<&str> = split_ids(existing.unwrap_or_default()).collect();
    for id in ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !merged.contains(&id) {
            merged.push(id);
        }
    }
    merged.join(",")
}

/// Splits a comma-delimited collection, skipping empty entries.
pub fn split_ids(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_idempotent() {
        let batch: Vec<String> = vec!["ins-1".into(), "ins-2".into()];
        let first = merge_ids(None, &batch);
        let again = merge_ids(Some(&first), &batch);
        assert_eq!(first, again);
    }

    #[test]
    fn test_merge_skips_blank_entries() {
        assert_eq!(merge_ids(Some(",a,,"), &[" ".into(), "b".into()]), "a,b");
        assert_eq!(split_ids("").count(), 0);
    }
}
