//! Per-item progress of bulk operations.

use crate::config::EngineConfig;
use crate::retry::Retrier;
use chrono::Utc;
use musubi_core::{
    truncate_runes, ActionId, DetailState, EngineError, Expression, ManagementState, RecordKind,
    Result, Rule, Store, TaskDetail, TaskDetailUpdate, TaskManagement,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// One item to register under a management.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailRequest {
    pub flow_id: Option<String>,
    pub action_id: Option<ActionId>,
    pub param: Value,
}

impl DetailRequest {
    /// An item not bound to any task.
    pub fn new(param: Value) -> Self {
        Self {
            flow_id: None,
            action_id: None,
            param,
        }
    }

    /// Binds the item to task `action_id` of `flow_id`.
    pub fn for_task(mut self, flow_id: impl Into<String>, action_id: impl Into<ActionId>) -> Self {
        self.flow_id = Some(flow_id.into());
        self.action_id = Some(action_id.into());
        self
    }
}

/// Result of processing one detail.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// The item was cancelled beforehand; nothing was called. Counts as success.
    Skipped,
    Succeeded(Value),
    /// The operation failed with this (truncated) reason.
    Failed(String),
}

impl ItemOutcome {
    /// Returns `true` unless the item failed.
    pub fn is_success(&self) -> bool {
        !matches!(self, ItemOutcome::Failed(_))
    }
}

/// Reads and writes [`TaskDetail`] and [`TaskManagement`] rows.
#[derive(Clone)]
pub struct TaskDetailTracker {
    store: Arc<dyn Store>,
    retrier: Retrier,
    batch_size: usize,
    reason_limit: usize,
}

impl std::fmt::Debug for TaskDetailTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDetailTracker")
            .field("batch_size", &self.batch_size)
            .field("reason_limit", &self.reason_limit)
            .finish_non_exhaustive()
    }
}

impl TaskDetailTracker {
    /// Creates a tracker using the retry and batch settings of `config`.
    pub fn new(store: Arc<dyn Store>, config: &EngineConfig) -> Self {
        Self {
            store,
            retrier: Retrier::new(config.storage_retry),
            batch_size: config.detail_batch_size,
            reason_limit: config.reason_rune_limit,
        }
    }

    /// Registers a management and one `Init` detail per item.
    pub async fn create_management(
        &self,
        flow_ids: Vec<String>,
        items: Vec<DetailRequest>,
    ) -> Result<(TaskManagement, Vec<TaskDetail>)> {
        let now = Utc::now();
        let management = TaskManagement {
            id: Uuid::new_v4().to_string(),
            state: ManagementState::Running,
            flow_ids,
            created_at: now,
            updated_at: now,
        };
        let details: Vec<TaskDetail> = items
            .into_iter()
            .map(|item| TaskDetail {
                id: Uuid::new_v4().to_string(),
                management_id: management.id.clone(),
                flow_id: item.flow_id,
                action_id: item.action_id,
                param: item.param,
                state: DetailState::Init,
                result: None,
                reason: None,
                created_at: now,
                updated_at: now,
            })
            .collect();

        self.retrier
            .run("create management", || self.store.create_management(management.clone()))
            .await?;
        let failed = self
            .retrier
            .run_chunked("create details", &details, self.batch_size, |chunk| {
                let store = self.store.clone();
                async move { store.create_details(chunk).await }
            })
            .await;
        if let Some((_, e)) = failed.into_iter().next() {
            return Err(e);
        }
        info!(management_id = %management.id, details = details.len(), "management created");
        Ok((management, details))
    }

    /// Returns one detail by id.
    pub async fn get_detail(&self, id: &str) -> Result<TaskDetail> {
        self.store
            .list_details(&Expression::and([Rule::equal("id", id)]))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::not_found(RecordKind::TaskDetail, id))
    }

    /// Returns every detail of a management.
    pub async fn list_details(&self, management_id: &str) -> Result<Vec<TaskDetail>> {
        self.store
            .list_details(&Expression::and([Rule::equal("management_id", management_id)]))
            .await
    }

    /// Applies `updates` in chunks of `detail_batch_size`, each chunk retried.
    ///
    /// Reasons are truncated first. Fails with [`EngineError::PartialFailed`]
    /// naming the ids of chunks that exhausted their attempts.
    pub async fn batch_update(&self, updates: Vec<TaskDetailUpdate>) -> Result<()> {
        let updates: Vec<TaskDetailUpdate> = updates
            .into_iter()
            .map(|mut u| {
                u.reason = u.reason.map(|r| truncate_runes(&r, self.reason_limit));
                u
            })
            .collect();

        let failed = self
            .retrier
            .run_chunked("update details", &updates, self.batch_size, |chunk| {
                let store = self.store.clone();
                async move { store.update_details(&chunk).await }
            })
            .await;
        if failed.is_empty() {
            return Ok(());
        }

        let failed_ids: Vec<String> = failed
            .iter()
            .flat_map(|(chunk, _)| chunk.iter().map(|u| u.id.clone()))
            .collect();
        let succeeded: Vec<String> = updates
            .iter()
            .map(|u| u.id.clone())
            .filter(|id| !failed_ids.contains(id))
            .collect();
        let details = failed
            .iter()
            .map(|(_, e)| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        warn!(failed = failed_ids.len(), succeeded = succeeded.len(), "detail update partially failed");
        Err(EngineError::PartialFailed {
            succeeded,
            failed: failed_ids,
            details: truncate_runes(&details, self.reason_limit),
        })
    }

    /// Runs `op` for one detail, honouring cancellation.
    ///
    /// The row is claimed by moving it `Init` to `Running` in one conditional
    /// write right before `op`. A cancelled detail is skipped without calling
    /// `op`; a detail in any other state is rejected. After `op` the row goes
    /// `Success` or `Failed`, written under the retry policy without calling
    /// `op` again.
    pub async fn process<F, Fut>(&self, detail_id: &str, op: F) -> Result<ItemOutcome>
    where
        F: FnOnce(TaskDetail) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let detail = self.get_detail(detail_id).await?;
        let claim =
            TaskDetailUpdate::state(detail_id, DetailState::Running).expecting([DetailState::Init]);
        match self.write_one(claim).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                let current = self.get_detail(detail_id).await?.state;
                if current == DetailState::Cancel {
                    info!(detail_id, "detail cancelled, skipping");
                    return Ok(ItemOutcome::Skipped);
                }
                return Err(EngineError::InvalidParameter(format!(
                    "detail {detail_id} is {current}, expected init"
                )));
            }
            Err(e) => return Err(e),
        }
        let (update, outcome) = match op(detail).await {
            Ok(result) => {
                let mut update = TaskDetailUpdate::state(detail_id, DetailState::Success);
                update.result = Some(result.clone());
                (update, ItemOutcome::Succeeded(result))
            }
            Err(e) => {
                let reason = truncate_runes(&e.to_string(), self.reason_limit);
                warn!(detail_id, error = %e, "detail failed");
                let mut update = TaskDetailUpdate::state(detail_id, DetailState::Failed);
                update.reason = Some(reason.clone());
                (update, ItemOutcome::Failed(reason))
            }
        };
        self.write_one(update).await?;
        Ok(outcome)
    }

    async fn write_one(&self, update: TaskDetailUpdate) -> Result<()> {
        let batch = [update];
        self.retrier
            .run("update detail", || self.store.update_details(&batch))
            .await
    }

    /// Cancels a management and every detail that has not started.
    ///
    /// Returns how many details were cancelled.
    pub async fn cancel_management(&self, management_id: &str) -> Result<usize> {
        let management = self.store.get_management(management_id).await?;
        if management.state != ManagementState::Running {
            return Err(EngineError::InvalidParameter(format!(
                "management {} is {}, it can not be cancelled",
                management_id, management.state
            )));
        }
        self.retrier
            .run("cancel management", || {
                self.store
                    .update_management_state(management_id, ManagementState::Cancel)
            })
            .await?;
        let cancelled = self
            .retrier
            .run("cancel details", || self.store.cancel_init_details(management_id))
            .await?;
        info!(management_id, details = cancelled, "management cancelled");
        Ok(cancelled)
    }

    /// Recomputes a running management's state from its details.
    pub async fn refresh_management_state(&self, management_id: &str) -> Result<ManagementState> {
        let management = self.store.get_management(management_id).await?;
        if management.state != ManagementState::Running {
            return Ok(management.state);
        }
        let details = self.list_details(management_id).await?;
        let state = aggregate(&details);
        if state != management.state {
            self.retrier
                .run("update management", || {
                    self.store.update_management_state(management_id, state)
                })
                .await?;
            info!(management_id, %state, "management state changed");
        }
        Ok(state)
    }

    /// Folds per-item outcomes into one result.
    ///
    /// Any failed item turns the whole into [`EngineError::PartialFailed`];
    /// skipped items count as succeeded.
    pub fn summarize(&self, outcomes: &[(String, ItemOutcome)]) -> Result<Vec<String>> {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut reasons = Vec::new();
        for (id, outcome) in outcomes {
            match outcome {
                ItemOutcome::Failed(reason) => {
                    failed.push(id.clone());
                    reasons.push(format!("{id}: {reason}"));
                }
                _ => succeeded.push(id.clone()),
            }
        }
        if failed.is_empty() {
            return Ok(succeeded);
        }
        Err(EngineError::PartialFailed {
            succeeded,
            failed,
            details: truncate_runes(&reasons.join("; "), self.reason_limit),
        })
    }
}

fn aggregate(details: &[TaskDetail]) -> ManagementState {
    if details.iter().any(|d| !d.state.is_terminal()) {
        ManagementState::Running
    } else if details.iter().any(|d| d.state == DetailState::Failed) {
        ManagementState::Failed
    } else {
        ManagementState::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use musubi_core::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tracker(batch_size: usize) -> (Arc<MemoryStore>, TaskDetailTracker) {
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig {
            storage_retry: RetryPolicy::new(2, 1, 3).expect("valid range"),
            detail_batch_size: batch_size,
            ..EngineConfig::default()
        };
        (store.clone(), TaskDetailTracker::new(store, &config))
    }

    fn items(n: usize) -> Vec<DetailRequest> {
        (0..n).map(|i| DetailRequest::new(json!({ "instance": format!("i-{i}") }))).collect()
    }

    #[tokio::test]
    async fn test_failure_reason_is_truncated_by_chars() {
        let (_store, tracker) = tracker(10);
        let (_, details) = tracker.create_management(vec![], items(1)).await.expect("created");
        let id = details[0].id.clone();

        let outcome = tracker
            .process(&id, |_| async { Err(EngineError::Aborted("障害".repeat(700))) })
            .await
            .expect("processed");
        let ItemOutcome::Failed(reason) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(reason.chars().count(), 1000);

        let stored = tracker.get_detail(&id).await.expect("stored");
        assert_eq!(stored.state, DetailState::Failed);
        assert_eq!(stored.reason.map(|r| r.chars().count()), Some(1000));
    }

    #[tokio::test]
    async fn test_cancelled_detail_is_skipped_without_call() {
        let (_store, tracker) = tracker(10);
        let (management, details) = tracker.create_management(vec![], items(2)).await.expect("created");
        assert_eq!(tracker.cancel_management(&management.id).await.expect("cancelled"), 2);

        let calls = AtomicU32::new(0);
        let outcome = tracker
            .process(&details[0].id, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({}))
            })
            .await
            .expect("processed");
        assert_eq!(outcome, ItemOutcome::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_between_read_and_claim_wins() {
        let (store, tracker) = tracker(10);
        let (management, details) = tracker.create_management(vec![], items(1)).await.expect("created");
        let calls = AtomicU32::new(0);

        // The first claim attempt fails transiently; the cancel lands while it backs off.
        store.fail_next_writes(1);
        let (outcome, cancelled) = tokio::join!(
            tracker.process(&details[0].id, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({}))
            }),
            async {
                tokio::task::yield_now().await;
                tracker.cancel_management(&management.id).await
            }
        );

        assert_eq!(cancelled.expect("cancelled"), 1);
        assert_eq!(outcome.expect("processed"), ItemOutcome::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let stored = tracker.get_detail(&details[0].id).await.expect("stored");
        assert_eq!(stored.state, DetailState::Cancel);
    }

    #[tokio::test]
    async fn test_concurrent_process_calls_op_once() {
        let (_store, tracker) = tracker(10);
        let (_, details) = tracker.create_management(vec![], items(1)).await.expect("created");
        let calls = AtomicU32::new(0);
        let op = |_: TaskDetail| async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(json!({}))
        };

        let (first, second) = tokio::join!(
            tracker.process(&details[0].id, op),
            tracker.process(&details[0].id, op)
        );
        let rejected = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(EngineError::InvalidParameter(_))))
            .count();
        assert_eq!(rejected, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_started_detail_is_rejected() {
        let (_store, tracker) = tracker(10);
        let (_, details) = tracker.create_management(vec![], items(1)).await.expect("created");
        tracker
            .batch_update(vec![TaskDetailUpdate::state(details[0].id.as_str(), DetailState::Running)])
            .await
            .expect("updated");

        let err = tracker
            .process(&details[0].id, |_| async { Ok(json!({})) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_outcome_write_is_retried_without_rerunning_op() {
        let (store, tracker) = tracker(10);
        let (_, details) = tracker.create_management(vec![], items(1)).await.expect("created");
        let calls = AtomicU32::new(0);
        let store_in_op = store.clone();

        let outcome = tracker
            .process(&details[0].id, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                store_in_op.fail_next_writes(2);
                Ok(json!({ "ok": true }))
            })
            .await
            .expect("third write succeeds");
        assert_eq!(outcome, ItemOutcome::Succeeded(json!({ "ok": true })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = tracker.get_detail(&details[0].id).await.expect("stored");
        assert_eq!(stored.state, DetailState::Success);
    }

    #[tokio::test]
    async fn test_batch_update_localizes_failed_chunk() {
        let (store, tracker) = tracker(2);
        let (_, details) = tracker.create_management(vec![], items(4)).await.expect("created");
        let mut updates: Vec<TaskDetailUpdate> = details
            .iter()
            .map(|d| TaskDetailUpdate::state(d.id.as_str(), DetailState::Success))
            .collect();
        updates[3].id = "missing".to_string();

        let err = tracker.batch_update(updates).await.unwrap_err();
        let EngineError::PartialFailed { succeeded, failed, .. } = err else {
            panic!("expected partial failure, got {err:?}");
        };
        assert_eq!(succeeded.len(), 2);
        assert_eq!(failed, vec![details[2].id.clone(), "missing".to_string()]);

        // Each update call is atomic, so the failing chunk left its rows alone.
        let stored = tracker.get_detail(&details[2].id).await.expect("stored");
        assert_eq!(stored.state, DetailState::Init);
        assert!(store.list_details(&Expression::all()).await.expect("listed").len() == 4);
    }

    #[tokio::test]
    async fn test_refresh_management_state() {
        let (_store, tracker) = tracker(10);
        let (management, details) = tracker.create_management(vec!["f1".into()], items(2)).await.expect("created");
        assert_eq!(
            tracker.refresh_management_state(&management.id).await.expect("refreshed"),
            ManagementState::Running
        );

        tracker
            .process(&details[0].id, |_| async { Ok(json!({})) })
            .await
            .expect("processed");
        tracker
            .process(&details[1].id, |_| async { Err(EngineError::Aborted("quota".into())) })
            .await
            .expect("processed");
        assert_eq!(
            tracker.refresh_management_state(&management.id).await.expect("refreshed"),
            ManagementState::Failed
        );
    }

    #[test]
    fn test_summarize_reports_partial_failure() {
        let (_store, tracker) = tracker(10);
        let outcomes = vec![
            ("a".to_string(), ItemOutcome::Succeeded(json!(1))),
            ("b".to_string(), ItemOutcome::Skipped),
        ];
        assert_eq!(tracker.summarize(&outcomes).expect("all ok"), vec!["a", "b"]);

        let outcomes = vec![
            ("a".to_string(), ItemOutcome::Succeeded(json!(1))),
            ("b".to_string(), ItemOutcome::Failed("quota".into())),
        ];
        match tracker.summarize(&outcomes) {
            Err(EngineError::PartialFailed { succeeded, failed, details }) => {
                assert_eq!(succeeded, vec!["a"]);
                assert_eq!(failed, vec!["b"]);
                assert!(details.contains("quota"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
