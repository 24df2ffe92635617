//! Optimistic, storage-backed mutual exclusion between flows.

use crate::retry::Retrier;
use chrono::{DateTime, Utc};
use musubi_core::{
    EngineError, Expression, RelStatus, ResourceFlowLock, ResourceFlowRel, ResourceKey, Result,
    Rule, Store,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A resource a flow needs exclusive access to before it may start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub key: ResourceKey,
    /// What the flow does to the resource; recorded on the relation row.
    pub task_type: String,
}

impl LockRequest {
    /// Requests the lock on `res_id`/`res_type` for work of `task_type`.
    pub fn new(res_id: impl Into<String>, res_type: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            key: ResourceKey::new(res_id, res_type),
            task_type: task_type.into(),
        }
    }
}

/// Outcome of a lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// The caller now owns the lock.
    Acquired,
    /// Another flow owns the lock.
    Held {
        /// Id of the owning flow.
        owner: String,
    },
}

/// Acquires and releases [`ResourceFlowLock`] rows.
///
/// Acquisition is insert-if-absent and never blocks; callers that want to
/// wait for a lock poll [`ResourceLocker::try_acquire`].
#[derive(Clone)]
pub struct ResourceLocker {
    store: Arc<dyn Store>,
    retrier: Retrier,
}

impl std::fmt::Debug for ResourceLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLocker").field("retrier", &self.retrier).finish()
    }
}

impl ResourceLocker {
    /// Creates a locker writing through `store`.
    pub fn new(store: Arc<dyn Store>, retrier: Retrier) -> Self {
        Self { store, retrier }
    }

    /// Attempts to lock `request.key` for `flow_id`.
    ///
    /// Re-acquiring a lock the flow already owns succeeds.
    pub async fn try_acquire(&self, request: &LockRequest, flow_id: &str) -> Result<Acquire> {
        let lock = ResourceFlowLock {
            res_id: request.key.res_id.clone(),
            res_type: request.key.res_type.clone(),
            owner: flow_id.to_string(),
            created_at: Utc::now(),
        };
        let rel = ResourceFlowRel::executing(&request.key, flow_id, &request.task_type);
        let attempt = self
            .retrier
            .run("lock resource", || {
                self.store.lock_resource(lock.clone(), rel.clone())
            })
            .await;

        match attempt {
            Ok(()) => {
                info!(resource = %request.key, flow_id, "resource locked");
                Ok(Acquire::Acquired)
            }
            Err(e) if e.is_conflict() => match self.store.get_lock(&request.key).await? {
                Some(held) if held.owner == flow_id => Ok(Acquire::Acquired),
                Some(held) => {
                    info!(resource = %request.key, flow_id, owner = %held.owner, "resource already locked");
                    Ok(Acquire::Held { owner: held.owner })
                }
                // Released between the insert and the read; report as held so
                // the caller simply tries again.
                None => Ok(Acquire::Held {
                    owner: String::new(),
                }),
            },
            Err(e) => Err(e),
        }
    }

    /// Locks `request.key` or fails with [`EngineError::Conflict`].
    pub async fn acquire(&self, request: &LockRequest, flow_id: &str) -> Result<()> {
        match self.try_acquire(request, flow_id).await? {
            Acquire::Acquired => Ok(()),
            Acquire::Held { owner } => Err(EngineError::Conflict(format!(
                "resource {} is locked by flow {}",
                request.key, owner
            ))),
        }
    }

    /// Releases the lock `owner` holds on `key` and records `status`.
    ///
    /// Returns `false` if `owner` did not hold the lock.
    pub async fn release(&self, key: &ResourceKey, owner: &str, status: RelStatus) -> Result<bool> {
        let released = self
            .retrier
            .run("unlock resource", || self.store.unlock_resource(key, owner, status))
            .await?;
        if released {
            info!(resource = %key, owner, %status, "resource unlocked");
        } else {
            warn!(resource = %key, owner, %status, "release requested by a flow that does not hold the lock");
        }
        Ok(released)
    }

    /// Records that `flow_id` operates on `keys` without locking them.
    ///
    /// A watch over the flow moves these relations to the flow's outcome.
    pub async fn bind(&self, flow_id: &str, keys: &[ResourceKey], task_type: &str) -> Result<()> {
        let rels: Vec<ResourceFlowRel> = keys
            .iter()
            .map(|key| ResourceFlowRel::executing(key, flow_id, task_type))
            .collect();
        self.retrier
            .run("bind resources", || self.store.create_flow_rels(rels.clone()))
            .await?;
        info!(flow_id, resources = keys.len(), task_type, "sub-resources bound");
        Ok(())
    }

    /// Returns the lock held on `key`, if any.
    pub async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceFlowLock>> {
        self.store.get_lock(key).await
    }

    /// Locks currently held by `flow_id`.
    pub async fn held_by(&self, flow_id: &str) -> Result<Vec<ResourceFlowLock>> {
        self.store
            .list_locks(&Expression::and([Rule::equal("owner", flow_id)]))
            .await
    }
}

/// Returns `true` if `lock` was created more than `window` before `now`.
pub fn is_stale(lock: &ResourceFlowLock, window: Duration, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(lock.created_at)
        .to_std()
        .map(|age| age > window)
        .unwrap_or(false)
}
