//! Periodic claiming of pending flows.

use crate::engine::FlowEngine;
use musubi_core::{Expression, FlowState, Result, Rule};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Picks up `Pending` flows and runs each on its own task.
///
/// At most `max_concurrent_flows` flows run at once. Several schedulers may
/// share a store: the `Pending → Running` claim lets exactly one of them run
/// a given flow and the others skip it.
pub struct Scheduler {
    engine: Arc<FlowEngine>,
    permits: Arc<Semaphore>,
    flows: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler for `engine`.
    pub fn new(engine: Arc<FlowEngine>) -> Self {
        let permits = Arc::new(Semaphore::new(engine.config().max_concurrent_flows));
        Self {
            engine,
            permits,
            flows: Mutex::new(JoinSet::new()),
        }
    }

    /// One scheduling pass: expires stuck tasks, recovers orphaned flows,
    /// then starts as many pending flows as there are free slots.
    ///
    /// Returns how many flows were started.
    pub async fn run_once(&self) -> Result<usize> {
        let expired = self.engine.fail_expired_tasks().await?;
        if expired > 0 {
            warn!(tasks = expired, "expired tasks failed");
        }
        let recovered = self.engine.recover_orphaned_flows().await?;
        if recovered > 0 {
            warn!(flows = recovered, "orphaned flows recovered");
        }

        let mut flows = self.flows.lock().await;
        while let Some(joined) = flows.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "flow task panicked");
            }
        }

        let pending = self
            .engine
            .store()
            .list_flows(&Expression::and([Rule::equal("state", FlowState::Pending.as_str())]))
            .await?;

        let mut started = 0;
        for flow in pending {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!(waiting = %flow.id, "all flow slots busy");
                break;
            };
            let engine = self.engine.clone();
            flows.spawn(async move {
                let _permit = permit;
                match engine.run_flow(&flow.id).await {
                    Ok(state) => info!(flow_id = %flow.id, %state, "flow run finished"),
                    Err(e) if e.is_conflict() => {
                        debug!(flow_id = %flow.id, "flow claimed elsewhere");
                    }
                    Err(e) => error!(flow_id = %flow.id, error = %e, "flow run failed"),
                }
            });
            started += 1;
        }
        Ok(started)
    }

    /// Waits until every flow started so far has returned.
    pub async fn wait_idle(&self) {
        let mut flows = self.flows.lock().await;
        while let Some(joined) = flows.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "flow task panicked");
            }
        }
    }

    /// Runs [`Self::run_once`] every `scheduler_interval` until cancelled.
    pub fn spawn(self) -> SchedulerHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        let interval = self.engine.config().scheduler_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!(interval_ms = interval.as_millis() as u64, "scheduler started");
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "scheduling pass failed");
                        }
                    }
                }
            }
            self.wait_idle().await;
            info!("scheduler stopped");
        });
        SchedulerHandle { token, handle }
    }
}

/// Controls a scheduler started with [`Scheduler::spawn`].
#[derive(Debug)]
pub struct SchedulerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Returns the token that stops the scheduler.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stops scheduling and waits for running flows to return.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "scheduler task panicked");
        }
    }
}
