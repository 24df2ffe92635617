//! Flow instantiation, DAG dispatch and the flow state machine.
//!
//! The engine keeps no cross-task state in memory: every dispatch decision
//! is taken from task rows re-read from the [`Store`], and every state change
//! is a compare-and-swap against the stored row.

use crate::config::EngineConfig;
use crate::lock::{Acquire, LockRequest, ResourceLocker};
use crate::registry::{RegisteredAction, Registry};
use crate::retry::Retrier;
use chrono::{DateTime, Utc};
use musubi_core::{
    topological_order, ActionId, EngineError, ExecuteContext, Expression, Flow, FlowReason,
    FlowState, FlowStateUpdate, RecordKind, RelStatus, ResourceKey, Result, RollbackAction, Rule,
    Store, Task, TaskState, TaskTemplate, TaskUpdate, truncate_runes,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Payload override for one task of a template.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskParams {
    pub action_id: ActionId,
    pub params: Value,
}

/// Request to instantiate a registered template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateFlowRequest {
    pub template: String,
    pub memo: Option<String>,
    /// Create the flow in `Init` so that it waits for [`FlowEngine::start_flow`].
    pub init_state: bool,
    /// Merged over the template's ShareData seed.
    pub share_data: BTreeMap<String, String>,
    pub tasks: Vec<TaskParams>,
}

impl TemplateFlowRequest {
    /// Request for the template named `template`, with its defaults.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ..Self::default()
        }
    }

    /// Sets the flow memo.
    pub fn memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Creates the flow in `Init` when `true`.
    pub fn init_state(mut self, init_state: bool) -> Self {
        self.init_state = init_state;
        self
    }

    /// Adds one ShareData entry.
    pub fn share(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.share_data.insert(key.into(), value.into());
        self
    }

    /// Overrides the payload of task `action_id`.
    pub fn params(mut self, action_id: impl Into<ActionId>, params: Value) -> Self {
        self.tasks.push(TaskParams {
            action_id: action_id.into(),
            params,
        });
        self
    }
}

/// Request to instantiate an ad-hoc task list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomFlowRequest {
    pub name: String,
    pub memo: Option<String>,
    pub init_state: bool,
    pub share_data: BTreeMap<String, String>,
    pub tasks: Vec<TaskTemplate>,
}

/// Outcome of [`FlowEngine::start_flow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowStart {
    /// Every lock was acquired and the flow is now `Pending`.
    Started,
    /// A lock is owned by another flow; this flow stays in `Init`.
    LockHeld {
        key: ResourceKey,
        owner: String,
    },
}

/// Drives flows through their state machine.
///
/// # Examples
///
/// ```rust,ignore
/// let engine = FlowEngine::new(registry, store, EngineConfig::default())?;
/// let flow_id = engine
///     .create_template_flow(TemplateFlowRequest::new("create_lb").params("1", json!({"zone": "ap-1"})))
///     .await?;
/// let state = engine.run_flow(&flow_id).await?;
/// ```
pub struct FlowEngine {
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    config: EngineConfig,
    retrier: Retrier,
    locker: ResourceLocker,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FlowEngine {
    /// Creates an engine after validating `config`.
    pub fn new(registry: Arc<Registry>, store: Arc<dyn Store>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let retrier = Retrier::new(config.storage_retry);
        let locker = ResourceLocker::new(store.clone(), retrier);
        Ok(Self {
            registry,
            store,
            config,
            retrier,
            locker,
        })
    }

    /// Returns the action and template registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the resource locker.
    pub fn locker(&self) -> &ResourceLocker {
        &self.locker
    }

    /// Instantiates a registered template and returns the new flow id.
    pub async fn create_template_flow(&self, request: TemplateFlowRequest) -> Result<String> {
        let template = self
            .registry
            .get_template(&request.template)
            .ok_or_else(|| EngineError::not_found(RecordKind::Template, &request.template))?;

        let mut overrides: HashMap<ActionId, Value> = HashMap::new();
        for task in request.tasks {
            if !template.tasks.iter().any(|t| t.action_id == task.action_id) {
                return Err(EngineError::InvalidParameter(format!(
                    "template {} has no task {}",
                    template.name, task.action_id
                )));
            }
            if overrides.insert(task.action_id.clone(), task.params).is_some() {
                return Err(EngineError::InvalidParameter(format!(
                    "params for task {} given twice",
                    task.action_id
                )));
            }
        }

        let tasks = template
            .tasks
            .into_iter()
            .map(|mut t| {
                if let Some(params) = overrides.remove(&t.action_id) {
                    t.params = Some(params);
                }
                t
            })
            .collect();
        let mut share_data = template.share_data;
        share_data.extend(request.share_data);

        self.instantiate(template.name, request.memo, request.init_state, share_data, tasks)
            .await
    }

    /// Instantiates an ad-hoc task list and returns the new flow id.
    pub async fn create_custom_flow(&self, request: CustomFlowRequest) -> Result<String> {
        if request.name.is_empty() {
            return Err(EngineError::InvalidParameter("flow name is required".to_string()));
        }
        self.instantiate(
            request.name,
            request.memo,
            request.init_state,
            request.share_data,
            request.tasks,
        )
        .await
    }

    /// Creates a new flow with the same tasks and ShareData seed as `flow_id`.
    pub async fn clone_flow(&self, flow_id: &str, init_state: bool) -> Result<String> {
        let flow = self.store.get_flow(flow_id).await?;
        let tasks = self.store.list_tasks(flow_id).await?;
        let templates = tasks.iter().map(Task::template).collect();
        self.instantiate(
            flow.name,
            Some(format!("cloned for {}", flow.id)),
            init_state,
            flow.initial_share_data,
            templates,
        )
        .await
    }

    async fn instantiate(
        &self,
        name: String,
        memo: Option<String>,
        init_state: bool,
        share_data: BTreeMap<String, String>,
        tasks: Vec<TaskTemplate>,
    ) -> Result<String> {
        topological_order(&tasks)?;
        if let Some(task) = tasks
            .iter()
            .find(|t| !self.registry.has_action(t.action_name.as_str()))
        {
            return Err(EngineError::InvalidParameter(format!(
                "task {} uses unregistered action {}",
                task.action_id, task.action_name
            )));
        }

        let now = Utc::now();
        let flow_id = Uuid::new_v4().to_string();
        let state = if init_state {
            FlowState::Init
        } else {
            FlowState::Pending
        };
        let rows: Vec<Task> = tasks
            .into_iter()
            .map(|t| Task {
                flow_id: flow_id.clone(),
                action_id: t.action_id,
                action_name: t.action_name,
                depend_on: t.depend_on,
                params: t.params.unwrap_or(Value::Null),
                retry: t.retry,
                timeout_secs: t.timeout_secs,
                state: TaskState::Init,
                rollback_count: 0,
                result: None,
                reason: None,
                created_at: now,
                updated_at: now,
            })
            .collect();
        let flow = Flow {
            id: flow_id.clone(),
            name,
            state,
            memo,
            reason: None,
            initial_share_data: share_data,
            created_at: now,
            updated_at: now,
        };

        self.retrier
            .run("create flow", || self.store.create_flow(flow.clone(), rows.clone()))
            .await?;
        info!(flow_id = %flow_id, flow_name = %flow.name, %state, tasks = rows.len(), "flow created");
        Ok(flow_id)
    }

    /// Acquires every lock in `locks` for an `Init` flow, then moves it to `Pending`.
    ///
    /// If any lock is held by another flow, the locks taken so far are
    /// released and the flow stays in `Init`.
    pub async fn start_flow(&self, flow_id: &str, locks: &[LockRequest]) -> Result<FlowStart> {
        let flow = self.store.get_flow(flow_id).await?;
        if flow.state != FlowState::Init {
            return Err(EngineError::InvalidParameter(format!(
                "flow {} is {}, only init flows can be started",
                flow_id, flow.state
            )));
        }

        let mut acquired: Vec<&ResourceKey> = Vec::with_capacity(locks.len());
        for request in locks {
            match self.locker.try_acquire(request, flow_id).await {
                Ok(Acquire::Acquired) => acquired.push(&request.key),
                Ok(Acquire::Held { owner }) => {
                    self.release_quietly(&acquired, flow_id).await;
                    info!(flow_id, resource = %request.key, %owner, "flow waits for resource lock");
                    return Ok(FlowStart::LockHeld {
                        key: request.key.clone(),
                        owner,
                    });
                }
                Err(e) => {
                    self.release_quietly(&acquired, flow_id).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self
            .transition_flow(flow_id, FlowState::Init, FlowState::Pending, None)
            .await
        {
            self.release_quietly(&acquired, flow_id).await;
            return Err(e);
        }
        Ok(FlowStart::Started)
    }

    async fn release_quietly(&self, keys: &[&ResourceKey], flow_id: &str) {
        for key in keys {
            if let Err(e) = self.locker.release(key, flow_id, RelStatus::Cancel).await {
                warn!(flow_id, resource = %key, error = %e, "failed to release lock");
            }
        }
    }

    /// Claims a `Pending` flow and runs it until no task can make progress.
    ///
    /// Returns the flow's state afterwards. Fails with
    /// [`EngineError::Conflict`] if the flow is not `Pending`, for example
    /// because another worker claimed it first.
    pub async fn run_flow(&self, flow_id: &str) -> Result<FlowState> {
        let span = info_span!("flow", flow_id = %flow_id);
        self.drive(flow_id).instrument(span).await
    }

    async fn drive(&self, flow_id: &str) -> Result<FlowState> {
        self.transition_flow(flow_id, FlowState::Pending, FlowState::Running, None)
            .await?;
        self.resume_interrupted(flow_id).await?;

        let runner = TaskRunner {
            store: self.store.clone(),
            retrier: self.retrier,
            default_timeout: self.config.default_task_timeout(),
            reason_limit: self.config.reason_rune_limit,
            rid: Uuid::new_v4().to_string(),
        };
        let permits = Arc::new(Semaphore::new(self.config.worker_pool_size));
        let mut running: JoinSet<(ActionId, Result<TaskState>)> = JoinSet::new();
        let mut in_flight: HashSet<ActionId> = HashSet::new();
        let mut interrupted: Option<EngineError> = None;

        loop {
            let tasks = if interrupted.is_some() {
                None
            } else {
                match self.load_running_tasks(flow_id).await {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        error!(error = %e, "could not load flow, draining in-flight tasks");
                        interrupted = Some(e);
                        None
                    }
                }
            };
            if let Some(tasks) = tasks {
                for task in ready_tasks(&tasks, &in_flight) {
                    in_flight.insert(task.action_id.clone());
                    let entry = self.registry.get_action(task.action_name.as_str());
                    let span = info_span!("task", action_id = %task.action_id, action = %task.action_name);
                    let runner = runner.clone();
                    let permits = permits.clone();
                    running.spawn(async move {
                        let action_id = task.action_id.clone();
                        // Run on its own task so a panicking action surfaces
                        // as a JoinError carrying a known action id.
                        let worker = tokio::spawn(
                            async move {
                                let _permit = permits.acquire_owned().await.map_err(|_| {
                                    EngineError::Aborted("worker pool closed".to_string())
                                })?;
                                runner.execute(task, entry).await
                            }
                            .instrument(span),
                        );
                        let outcome = match worker.await {
                            Ok(outcome) => outcome,
                            Err(e) => Err(EngineError::Aborted(format!("task {action_id} aborted: {e}"))),
                        };
                        (action_id, outcome)
                    });
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok((action_id, Ok(state))) => {
                    in_flight.remove(&action_id);
                    debug!(%action_id, %state, "task settled");
                }
                Ok((action_id, Err(e))) => {
                    in_flight.remove(&action_id);
                    error!(%action_id, error = %e, "task did not complete");
                    runner.fail(flow_id, &action_id, &e.to_string()).await;
                }
                Err(e) => error!(error = %e, "task supervisor failed"),
            }
        }

        if let Some(e) = interrupted {
            // Left running; the orphan sweep hands it back to the scheduler.
            return Err(e);
        }
        self.finish(flow_id, &runner).await
    }

    /// The flow's tasks while it is still `Running`, `None` once it left.
    async fn load_running_tasks(&self, flow_id: &str) -> Result<Option<Vec<Task>>> {
        let flow = self.load_flow(flow_id).await?;
        if flow.state != FlowState::Running {
            debug!(state = %flow.state, "flow left running, draining in-flight tasks");
            return Ok(None);
        }
        Ok(Some(self.load_tasks(flow_id).await?))
    }

    async fn load_flow(&self, flow_id: &str) -> Result<Flow> {
        self.retrier.run("load flow", || self.store.get_flow(flow_id)).await
    }

    async fn load_tasks(&self, flow_id: &str) -> Result<Vec<Task>> {
        self.retrier.run("load tasks", || self.store.list_tasks(flow_id)).await
    }

    async fn load_flows_in(&self, state: FlowState) -> Result<Vec<Flow>> {
        let filter = Expression::and([Rule::equal("state", state.as_str())]);
        self.retrier.run("list flows", || self.store.list_flows(&filter)).await
    }

    /// Resets tasks an interrupted worker left mid-execution.
    async fn resume_interrupted(&self, flow_id: &str) -> Result<()> {
        for task in self.load_tasks(flow_id).await? {
            if task.state.is_executing() {
                let update = TaskUpdate::transition(
                    flow_id,
                    task.action_id.clone(),
                    [task.state],
                    TaskState::Pending,
                );
                match self.retrier.run("reset task", || self.store.update_task(&update)).await {
                    Ok(()) => info!(action_id = %task.action_id, from = %task.state, "interrupted task reset to pending"),
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn finish(&self, flow_id: &str, runner: &TaskRunner) -> Result<FlowState> {
        let flow = self.load_flow(flow_id).await?;
        match flow.state {
            FlowState::Running => {}
            FlowState::Cancel => {
                self.cancel_unfinished_tasks(flow_id).await?;
                info!("flow cancelled");
                return Ok(FlowState::Cancel);
            }
            other => return Ok(other),
        }

        let tasks = self.load_tasks(flow_id).await?;
        if tasks.iter().all(|t| t.state == TaskState::Success) {
            return self.settle_flow(flow_id, FlowState::Success, None).await;
        }

        let failed: Vec<&str> = tasks
            .iter()
            .filter(|t| t.state == TaskState::Failed)
            .map(|t| t.action_id.as_str())
            .collect();
        let message = if failed.is_empty() {
            "no task can make progress".to_string()
        } else {
            format!("tasks [{}] failed", failed.join(", "))
        };
        warn!(%message, "flow failed, rolling back started tasks");
        self.rollback_flow(&tasks, runner).await;

        let reason = FlowReason {
            pre_state: Some(FlowState::Running),
            message: truncate_runes(&message, self.config.reason_rune_limit),
        };
        self.settle_flow(flow_id, FlowState::Failed, Some(reason)).await
    }

    /// Moves a running flow to a terminal state; a lost race reports the
    /// state the winner wrote.
    async fn settle_flow(&self, flow_id: &str, target: FlowState, reason: Option<FlowReason>) -> Result<FlowState> {
        match self
            .transition_flow(flow_id, FlowState::Running, target, reason)
            .await
        {
            Ok(()) => Ok(target),
            Err(e) if e.is_conflict() => Ok(self.load_flow(flow_id).await?.state),
            Err(e) => Err(e),
        }
    }

    /// Offers a rollback to every started task, dependents first.
    async fn rollback_flow(&self, tasks: &[Task], runner: &TaskRunner) {
        let templates: Vec<TaskTemplate> = tasks.iter().map(Task::template).collect();
        let mut order = match topological_order(&templates) {
            Ok(order) => order,
            Err(_) => tasks.iter().map(|t| t.action_id.clone()).collect(),
        };
        order.reverse();

        for action_id in order {
            let Some(task) = tasks.iter().find(|t| t.action_id == action_id) else {
                continue;
            };
            if !task.state.has_started() {
                continue;
            }
            let Some(entry) = self.registry.get_action(task.action_name.as_str()) else {
                continue;
            };
            if let Some(rollback) = entry.rollback() {
                runner.revert(task, rollback).await;
            }
        }
    }

    /// Cancels a flow that has not succeeded or been cancelled yet.
    ///
    /// Every unfinished task is marked `Cancel`. Tasks already executing are
    /// not interrupted; their results are discarded.
    pub async fn cancel_flow(&self, flow_id: &str) -> Result<()> {
        let flow = self.store.get_flow(flow_id).await?;
        if !flow.state.can_transition_to(FlowState::Cancel) {
            return Err(EngineError::InvalidParameter(format!(
                "flow {} is {}, it can not be cancelled",
                flow_id, flow.state
            )));
        }
        let reason = FlowReason {
            pre_state: Some(flow.state),
            message: "cancelled on request".to_string(),
        };
        self.transition_flow(flow_id, flow.state, FlowState::Cancel, Some(reason))
            .await?;
        let cancelled = self.cancel_unfinished_tasks(flow_id).await?;
        info!(flow_id, tasks = cancelled, "flow cancel requested");
        Ok(())
    }

    async fn cancel_unfinished_tasks(&self, flow_id: &str) -> Result<usize> {
        let mut cancelled = 0;
        for task in self.load_tasks(flow_id).await? {
            if !TaskState::UNFINISHED.contains(&task.state) {
                continue;
            }
            let update = TaskUpdate::transition(
                flow_id,
                task.action_id.clone(),
                TaskState::UNFINISHED,
                TaskState::Cancel,
            );
            match self.retrier.run("cancel task", || self.store.update_task(&update)).await {
                Ok(()) => cancelled += 1,
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(cancelled)
    }

    /// Resets one task of a failed flow and hands the flow back to the scheduler.
    ///
    /// Rejected if the flow already released every resource it had locked.
    pub async fn retry_task(&self, flow_id: &str, action_id: &ActionId) -> Result<()> {
        let flow = self.store.get_flow(flow_id).await?;
        if flow.state != FlowState::Failed {
            return Err(EngineError::InvalidParameter(format!(
                "flow {} is {}, only failed flows can be retried",
                flow_id, flow.state
            )));
        }

        let rels = self
            .store
            .list_flow_rels(&Expression::and([Rule::equal("flow_id", flow_id)]))
            .await?;
        if !rels.is_empty() && rels.iter().all(|r| r.status != RelStatus::Executing) {
            return Err(EngineError::InvalidParameter(format!(
                "flow {flow_id} already released its resources"
            )));
        }

        let task = self.store.get_task(flow_id, action_id).await?;
        match task.state {
            TaskState::Failed => {
                let update = TaskUpdate::transition(flow_id, action_id.clone(), [TaskState::Failed], TaskState::Pending)
                    .with_rollback_count(0);
                self.retrier
                    .run("reset task", || self.store.update_task(&update))
                    .await?;
            }
            TaskState::Pending => {}
            other => {
                return Err(EngineError::InvalidParameter(format!(
                    "task {action_id} is {other}, only failed or reverted tasks can be retried"
                )));
            }
        }

        self.transition_flow(flow_id, FlowState::Failed, FlowState::Pending, None)
            .await?;
        info!(flow_id, %action_id, "task retry requested");
        Ok(())
    }

    /// Fails tasks that stayed running longer than `task_expire`, and their flows.
    ///
    /// Returns how many tasks were failed.
    pub async fn fail_expired_tasks(&self) -> Result<usize> {
        let expire = self.config.task_expire();
        let now = Utc::now();
        let running = self.load_flows_in(FlowState::Running).await?;

        let mut expired_total = 0;
        for flow in running {
            let mut expired = Vec::new();
            for task in self.load_tasks(&flow.id).await? {
                if !task.state.is_executing() || !older_than(now, task.updated_at, expire) {
                    continue;
                }
                let update = TaskUpdate::transition(
                    flow.id.as_str(),
                    task.action_id.clone(),
                    [task.state],
                    TaskState::Failed,
                )
                .with_reason(format!("task expired after {}s", expire.as_secs()));
                match self.retrier.run("expire task", || self.store.update_task(&update)).await {
                    Ok(()) => expired.push(task.action_id.to_string()),
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e),
                }
            }
            if expired.is_empty() {
                continue;
            }
            warn!(flow_id = %flow.id, tasks = ?expired, "tasks expired, failing flow");
            let reason = FlowReason {
                pre_state: Some(FlowState::Running),
                message: truncate_runes(
                    &format!("tasks [{}] expired", expired.join(", ")),
                    self.config.reason_rune_limit,
                ),
            };
            match self
                .transition_flow(&flow.id, FlowState::Running, FlowState::Failed, Some(reason))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
            expired_total += expired.len();
        }
        Ok(expired_total)
    }

    /// Hands `Running` flows that nobody drives back to the scheduler.
    ///
    /// A flow is orphaned when none of its tasks is executing and neither
    /// the flow nor any task changed for `orphan_flow`. One whose tasks all
    /// succeeded is settled `Success`; any other goes back to `Pending`, so
    /// its next run dispatches what is left or settles it `Failed`.
    ///
    /// Returns how many flows were recovered.
    pub async fn recover_orphaned_flows(&self) -> Result<usize> {
        let quiet = self.config.orphan_flow();
        let now = Utc::now();
        let mut recovered = 0;
        for flow in self.load_flows_in(FlowState::Running).await? {
            let tasks = self.load_tasks(&flow.id).await?;
            if tasks.iter().any(|t| t.state.is_executing()) {
                continue;
            }
            let last_change = tasks
                .iter()
                .map(|t| t.updated_at)
                .fold(flow.updated_at, |latest, at| latest.max(at));
            if !older_than(now, last_change, quiet) {
                continue;
            }

            let target = if tasks.iter().all(|t| t.state == TaskState::Success) {
                FlowState::Success
            } else {
                FlowState::Pending
            };
            match self.transition_flow(&flow.id, FlowState::Running, target, None).await {
                Ok(()) => {
                    warn!(flow_id = %flow.id, to = %target, "orphaned flow recovered");
                    recovered += 1;
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    async fn transition_flow(
        &self,
        flow_id: &str,
        source: FlowState,
        target: FlowState,
        reason: Option<FlowReason>,
    ) -> Result<()> {
        if !source.can_transition_to(target) {
            return Err(EngineError::InvalidParameter(format!(
                "flow can not move from {source} to {target}"
            )));
        }
        let update = FlowStateUpdate {
            flow_id: flow_id.to_string(),
            source,
            target,
            reason,
        };
        self.retrier
            .run("update flow state", || self.store.update_flow_state(&update))
            .await?;
        info!(flow_id, from = %source, to = %target, "flow state changed");
        Ok(())
    }
}

fn older_than(now: DateTime<Utc>, at: DateTime<Utc>, age: Duration) -> bool {
    now.signed_duration_since(at)
        .to_std()
        .map(|elapsed| elapsed > age)
        .unwrap_or(false)
}

/// Tasks whose dependencies all succeeded and that are not already dispatched.
fn ready_tasks(tasks: &[Task], in_flight: &HashSet<ActionId>) -> Vec<Task> {
    let states: HashMap<&ActionId, TaskState> =
        tasks.iter().map(|t| (&t.action_id, t.state)).collect();
    tasks
        .iter()
        .filter(|t| t.state.is_dispatchable() && !in_flight.contains(&t.action_id))
        .filter(|t| {
            t.depend_on
                .iter()
                .all(|dep| states.get(dep) == Some(&TaskState::Success))
        })
        .cloned()
        .collect()
}

/// Executes one task's action and records the outcome.
#[derive(Clone)]
struct TaskRunner {
    store: Arc<dyn Store>,
    retrier: Retrier,
    default_timeout: Duration,
    reason_limit: usize,
    rid: String,
}

impl TaskRunner {
    fn context(&self, task: &Task) -> ExecuteContext {
        ExecuteContext::new(
            self.rid.as_str(),
            task.flow_id.as_str(),
            task.action_id.clone(),
            self.store.clone(),
        )
        .async_kit()
    }

    fn timeout(&self, task: &Task) -> Duration {
        task.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Applies `update`; `false` means the task had already moved on.
    async fn apply(&self, update: &TaskUpdate) -> Result<bool> {
        match self.retrier.run("update task", || self.store.update_task(update)).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn current_state(&self, task: &Task) -> Result<TaskState> {
        let stored = self
            .retrier
            .run("load task", || self.store.get_task(&task.flow_id, &task.action_id))
            .await?;
        Ok(stored.state)
    }

    fn transition(&self, task: &Task, expected: impl Into<Vec<TaskState>>, target: TaskState) -> TaskUpdate {
        TaskUpdate::transition(task.flow_id.as_str(), task.action_id.clone(), expected, target)
    }

    async fn execute(&self, task: Task, entry: Option<RegisteredAction>) -> Result<TaskState> {
        let Some(entry) = entry else {
            let reason = format!("action {} is not registered", task.action_name);
            let update = self
                .transition(&task, [TaskState::Init, TaskState::Pending], TaskState::Failed)
                .with_reason(reason);
            self.apply(&update).await?;
            return self.current_state(&task).await;
        };

        let claim = self.transition(&task, [TaskState::Init, TaskState::Pending], TaskState::Running);
        if !self.apply(&claim).await? {
            return self.current_state(&task).await;
        }
        info!("task running");

        let ctx = self.context(&task);
        let action = entry.action();
        let timeout = self.timeout(&task);
        let mut rollback_count = task.rollback_count;

        loop {
            let outcome = match action.new_params(task.params.clone()) {
                Ok(params) => match tokio::time::timeout(timeout, action.run(&ctx, params)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(EngineError::Timeout(format!("task {}", task.action_id))),
                },
                Err(e) => Err(e),
            };

            let error = match outcome {
                Ok(result) => {
                    let update = self
                        .transition(&task, [TaskState::Running], TaskState::Success)
                        .with_result(result);
                    if !self.apply(&update).await? {
                        return self.current_state(&task).await;
                    }
                    info!("task succeeded");
                    return Ok(TaskState::Success);
                }
                Err(e) => e,
            };

            let reason = truncate_runes(&error.to_string(), self.reason_limit);
            if !task.retry.allows(rollback_count) || matches!(error, EngineError::Cancelled(_)) {
                let update = self
                    .transition(&task, [TaskState::Running], TaskState::Failed)
                    .with_reason(reason);
                if !self.apply(&update).await? {
                    return self.current_state(&task).await;
                }
                warn!(error = %error, "task failed");
                return Ok(TaskState::Failed);
            }

            warn!(
                error = %error,
                "task failed, retrying ({}/{})",
                rollback_count + 1,
                task.retry.policy.max_retries()
            );
            let to_rollback = self.transition(&task, [TaskState::Running], TaskState::Rollback);
            if !self.apply(&to_rollback).await? {
                return self.current_state(&task).await;
            }
            if let Some(rollback) = entry.rollback() {
                if let Err(e) = self.call_rollback(&ctx, &task, rollback).await {
                    let update = self
                        .transition(&task, [TaskState::Rollback], TaskState::Failed)
                        .with_reason(truncate_runes(&format!("rollback failed: {e}"), self.reason_limit));
                    self.apply(&update).await?;
                    warn!(error = %e, "rollback before retry failed");
                    return self.current_state(&task).await;
                }
            }
            rollback_count += 1;
            let to_pending = self
                .transition(&task, [TaskState::Rollback], TaskState::Pending)
                .with_reason(reason)
                .with_rollback_count(rollback_count);
            if !self.apply(&to_pending).await? {
                return self.current_state(&task).await;
            }

            tokio::time::sleep(task.retry.policy.next_delay()).await;
            let reclaim = self.transition(&task, [TaskState::Pending], TaskState::Running);
            if !self.apply(&reclaim).await? {
                return self.current_state(&task).await;
            }
        }
    }

    async fn call_rollback(&self, ctx: &ExecuteContext, task: &Task, rollback: &Arc<dyn RollbackAction>) -> Result<()> {
        let params = rollback.new_params(task.params.clone())?;
        match tokio::time::timeout(self.timeout(task), rollback.rollback(ctx, params)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::Timeout(format!("rollback of task {}", task.action_id))),
        }
    }

    /// Best-effort `Rollback → Pending` of a task that ran in a failed flow.
    async fn revert(&self, task: &Task, rollback: &Arc<dyn RollbackAction>) {
        let result = async {
            let start = self.transition(task, [TaskState::Success, TaskState::Failed], TaskState::Rollback);
            if !self.apply(&start).await? {
                return Ok(());
            }
            let ctx = self.context(task);
            match self.call_rollback(&ctx, task, rollback).await {
                Ok(()) => {
                    let done = self.transition(task, [TaskState::Rollback], TaskState::Pending);
                    self.apply(&done).await?;
                    info!(action_id = %task.action_id, "task rolled back");
                }
                Err(e) => {
                    warn!(action_id = %task.action_id, error = %e, "rollback failed");
                    let failed = self
                        .transition(task, [TaskState::Rollback], TaskState::Failed)
                        .with_reason(truncate_runes(&format!("rollback failed: {e}"), self.reason_limit));
                    self.apply(&failed).await?;
                }
            }
            Ok::<(), EngineError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(action_id = %task.action_id, error = %e, "could not record rollback");
        }
    }

    /// Marks a task failed after its runner errored out.
    async fn fail(&self, flow_id: &str, action_id: &ActionId, reason: &str) {
        let update = TaskUpdate::transition(flow_id, action_id.clone(), TaskState::UNFINISHED, TaskState::Failed)
            .with_reason(truncate_runes(reason, self.reason_limit));
        if let Err(e) = self.apply(&update).await {
            error!(%action_id, error = %e, "could not mark task failed");
        }
    }
}
