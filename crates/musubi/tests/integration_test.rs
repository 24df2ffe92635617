use async_trait::async_trait;
use chrono::Utc;
use musubi::prelude::*;
use musubi::{
    decode_params, watch_template, CustomFlowRequest, DetailRequest, DetailState, Expression, Flow,
    FlowStart, FlowWatchAction, FlowWatchParams, ItemOutcome, ManagementState, RelStatus,
    ResourceKey, RetryPolicy, Rule, Task, TaskDetailTracker, TaskDetailUpdate, WatchConfig,
    FLOW_WATCH,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config() -> EngineConfig {
    EngineConfig {
        storage_retry: RetryPolicy::new(2, 1, 5).unwrap(),
        default_task_timeout_secs: 5,
        scheduler_interval_ms: 10,
        ..EngineConfig::default()
    }
}

fn engine_with(registry: Registry) -> (Arc<MemoryStore>, FlowEngine) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = FlowEngine::new(Arc::new(registry), store.clone(), test_config()).unwrap();
    (store, engine)
}

/// Appends `start:<id>` and `end:<id>` around a short sleep.
#[derive(Debug, Clone)]
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn position(&self, event: &str) -> usize {
        self.events().iter().position(|e| e == event).unwrap()
    }
}

#[async_trait]
impl Action for Recorder {
    fn name(&self) -> ActionName {
        ActionName::new("record")
    }

    async fn run(&self, ctx: &ExecuteContext, _params: Value) -> Result<Value> {
        let id = ctx.action_id().to_string();
        self.log.lock().unwrap().push(format!("start:{id}"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.log.lock().unwrap().push(format!("end:{id}"));
        Ok(json!({ "task": id }))
    }
}

#[async_trait]
impl RollbackAction for Recorder {
    async fn rollback(&self, ctx: &ExecuteContext, _params: Value) -> Result<()> {
        self.log.lock().unwrap().push(format!("rollback:{}", ctx.action_id()));
        Ok(())
    }
}

/// Fails while `failing` is set.
#[derive(Debug, Clone)]
struct Flaky {
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Action for Flaky {
    fn name(&self) -> ActionName {
        ActionName::new("flaky")
    }

    async fn run(&self, _ctx: &ExecuteContext, _params: Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::ActionFailed {
                action: self.name(),
                details: "quota exceeded".to_string(),
            });
        }
        Ok(json!({ "ok": true }))
    }
}

fn diamond() -> FlowTemplate {
    FlowTemplate::new("diamond")
        .task(TaskTemplate::new("1", "record"))
        .task(TaskTemplate::new("2", "record").depends_on(["1"]))
        .task(TaskTemplate::new("3", "record").depends_on(["1"]))
        .task(TaskTemplate::new("4", "record").depends_on(["2", "3"]))
}

#[tokio::test]
async fn test_diamond_respects_dependencies() {
    let recorder = Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    };
    let registry = Registry::new();
    registry.register(recorder.clone());
    registry.register_template(diamond()).unwrap();
    let (store, engine) = engine_with(registry);

    let flow_id = engine
        .create_template_flow(TemplateFlowRequest::new("diamond"))
        .await
        .unwrap();
    assert_eq!(engine.run_flow(&flow_id).await.unwrap(), FlowState::Success);

    let events = recorder.events();
    assert_eq!(events.iter().filter(|e| *e == "start:1").count(), 1);
    assert!(recorder.position("end:1") < recorder.position("start:2"));
    assert!(recorder.position("end:1") < recorder.position("start:3"));
    assert!(recorder.position("end:2") < recorder.position("start:4"));
    assert!(recorder.position("end:3") < recorder.position("start:4"));

    let tasks = store.list_tasks(&flow_id).await.unwrap();
    assert!(tasks.iter().all(|t| t.state == TaskState::Success));
    let four = tasks.iter().find(|t| t.action_id.as_str() == "4").unwrap();
    assert_eq!(four.result, Some(json!({ "task": "4" })));
}

#[tokio::test]
async fn test_template_params_are_validated() {
    let registry = Registry::new();
    registry.register(Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    });
    registry.register_template(diamond()).unwrap();
    let (store, engine) = engine_with(registry);

    let err = engine
        .create_template_flow(TemplateFlowRequest::new("diamond").params("9", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidParameter(_)));

    let err = engine
        .create_template_flow(TemplateFlowRequest::new("missing"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let flow_id = engine
        .create_template_flow(
            TemplateFlowRequest::new("diamond")
                .params("2", json!({ "zone": "ap-1" }))
                .memo("bulk move"),
        )
        .await
        .unwrap();
    let flow = store.get_flow(&flow_id).await.unwrap();
    assert_eq!(flow.state, FlowState::Pending);
    assert_eq!(flow.memo.as_deref(), Some("bulk move"));
    let two = store.get_task(&flow_id, &ActionId::new("2")).await.unwrap();
    assert_eq!(two.params, json!({ "zone": "ap-1" }));
    assert_eq!(two.state, TaskState::Init);
}

#[tokio::test]
async fn test_custom_flow_rejects_cycles_and_unknown_actions() {
    let registry = Registry::new();
    registry.register(Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    });
    let (_store, engine) = engine_with(registry);

    let cyclic = CustomFlowRequest {
        name: "loop".into(),
        tasks: vec![
            TaskTemplate::new("1", "record").depends_on(["2"]),
            TaskTemplate::new("2", "record").depends_on(["1"]),
        ],
        ..CustomFlowRequest::default()
    };
    assert!(engine.create_custom_flow(cyclic).await.is_err());

    let unknown = CustomFlowRequest {
        name: "unknown".into(),
        tasks: vec![TaskTemplate::new("1", "delete_everything")],
        ..CustomFlowRequest::default()
    };
    assert!(matches!(
        engine.create_custom_flow(unknown).await,
        Err(EngineError::InvalidParameter(_))
    ));
}

#[derive(Debug, Deserialize)]
struct ListenerParams {
    lb_id: String,
}

/// Creates a listener on a load balancer and binds it to the flow.
#[derive(Debug)]
struct CreateListener {
    locker: musubi::ResourceLocker,
}

#[async_trait]
impl Action for CreateListener {
    fn name(&self) -> ActionName {
        ActionName::new("create_listener")
    }

    async fn run(&self, ctx: &ExecuteContext, params: Value) -> Result<Value> {
        let params: ListenerParams = decode_params(params)?;
        ctx.check_cancelled().await?;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let listener = ResourceKey::new(format!("{}-ls", params.lb_id), "listener");
        self.locker
            .bind(ctx.flow_id(), std::slice::from_ref(&listener), "create_listener")
            .await?;
        Ok(json!({ "listener_id": listener.res_id }))
    }
}

#[tokio::test]
async fn test_lock_blocks_second_flow_until_watch_releases() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new();
    let config = test_config();
    let locker = musubi::ResourceLocker::new(store.clone(), musubi::Retrier::new(config.storage_retry));
    registry.register(CreateListener {
        locker: locker.clone(),
    });
    let watch_config = WatchConfig {
        poll_interval_ms: 5,
        deadline_ms: 3000,
        ..WatchConfig::default()
    };
    registry.register_template(watch_template(&watch_config)).unwrap();
    registry.register(FlowWatchAction::new(store.clone(), locker.clone(), watch_config).unwrap());
    registry
        .register_template(
            FlowTemplate::new("create_listener").task(
                TaskTemplate::new("1", "create_listener").with_params(json!({ "lb_id": "lb-1" })),
            ),
        )
        .unwrap();
    let engine = FlowEngine::new(Arc::new(registry), store.clone(), config).unwrap();

    let lock = LockRequest::new("lb-1", "load_balancer", "create_listener");
    let f1 = engine
        .create_template_flow(TemplateFlowRequest::new("create_listener").init_state(true))
        .await
        .unwrap();
    let f2 = engine
        .create_template_flow(TemplateFlowRequest::new("create_listener").init_state(true))
        .await
        .unwrap();

    assert_eq!(
        engine.start_flow(&f1, std::slice::from_ref(&lock)).await.unwrap(),
        FlowStart::Started
    );
    assert_eq!(
        engine.start_flow(&f2, std::slice::from_ref(&lock)).await.unwrap(),
        FlowStart::LockHeld {
            key: lock.key.clone(),
            owner: f1.clone(),
        }
    );
    assert_eq!(store.get_flow(&f2).await.unwrap().state, FlowState::Init);

    let mut params = FlowWatchParams::new(f1.as_str(), &lock.key);
    params.sub_res_ids = vec!["lb-1-ls".into()];
    params.sub_res_type = "listener".into();
    let watch_flow = engine
        .create_template_flow(
            TemplateFlowRequest::new(FLOW_WATCH).params("1", serde_json::to_value(&params).unwrap()),
        )
        .await
        .unwrap();

    let (watched, work) = tokio::join!(engine.run_flow(&watch_flow), engine.run_flow(&f1));
    assert_eq!(work.unwrap(), FlowState::Success);
    assert_eq!(watched.unwrap(), FlowState::Success);

    let watch_task = store.get_task(&watch_flow, &ActionId::new("1")).await.unwrap();
    assert_eq!(watch_task.result.unwrap()["status"], json!("success"));
    let rels = store
        .list_flow_rels(&Expression::and([Rule::equal("flow_id", f1.as_str())]))
        .await
        .unwrap();
    assert_eq!(rels.len(), 2);
    assert!(rels.iter().all(|r| r.status == RelStatus::Success));

    assert_eq!(
        engine.start_flow(&f2, std::slice::from_ref(&lock)).await.unwrap(),
        FlowStart::Started
    );
    assert_eq!(store.get_lock(&lock.key).await.unwrap().unwrap().owner, f2);
}

/// Sleeps for `millis` from its params.
#[derive(Debug)]
struct Sleeper;

#[async_trait]
impl Action for Sleeper {
    fn name(&self) -> ActionName {
        ActionName::new("sleep")
    }

    async fn run(&self, _ctx: &ExecuteContext, params: Value) -> Result<Value> {
        let millis = params["millis"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(json!({ "slept": millis }))
    }
}

#[tokio::test]
async fn test_watch_outlives_default_task_timeout() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        default_task_timeout_secs: 1,
        ..test_config()
    };
    let locker = musubi::ResourceLocker::new(store.clone(), musubi::Retrier::new(config.storage_retry));
    let watch_config = WatchConfig {
        poll_interval_ms: 20,
        deadline_ms: 5000,
        ..WatchConfig::default()
    };
    let registry = Registry::new();
    registry.register(Sleeper);
    registry.register_template(watch_template(&watch_config)).unwrap();
    registry.register(FlowWatchAction::new(store.clone(), locker, watch_config).unwrap());
    let engine = FlowEngine::new(Arc::new(registry), store.clone(), config).unwrap();

    let work = engine
        .create_custom_flow(CustomFlowRequest {
            name: "long_create".into(),
            init_state: true,
            tasks: vec![TaskTemplate::new("1", "sleep")
                .with_params(json!({ "millis": 1500 }))
                .with_timeout_secs(5)],
            ..CustomFlowRequest::default()
        })
        .await
        .unwrap();
    let lock = LockRequest::new("lb-1", "load_balancer", "long_create");
    assert_eq!(
        engine.start_flow(&work, std::slice::from_ref(&lock)).await.unwrap(),
        FlowStart::Started
    );
    let params = FlowWatchParams::new(work.as_str(), &lock.key);
    let watch_flow = engine
        .create_template_flow(
            TemplateFlowRequest::new(FLOW_WATCH).params("1", serde_json::to_value(&params).unwrap()),
        )
        .await
        .unwrap();

    let (watched, worked) = tokio::join!(engine.run_flow(&watch_flow), engine.run_flow(&work));
    assert_eq!(worked.unwrap(), FlowState::Success);
    assert_eq!(watched.unwrap(), FlowState::Success);
    let watch_task = store.get_task(&watch_flow, &ActionId::new("1")).await.unwrap();
    assert_eq!(watch_task.state, TaskState::Success);
    assert!(store.get_lock(&lock.key).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_have_one_lock_winner() {
    let registry = Registry::new();
    registry.register(Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    });
    registry.register_template(diamond()).unwrap();
    let (store, engine) = engine_with(registry);
    let engine = Arc::new(engine);

    let mut flows = Vec::new();
    for _ in 0..8 {
        flows.push(
            engine
                .create_template_flow(TemplateFlowRequest::new("diamond").init_state(true))
                .await
                .unwrap(),
        );
    }

    let lock = LockRequest::new("vpc-1", "vpc", "diamond");
    let mut starts = tokio::task::JoinSet::new();
    for flow_id in flows.clone() {
        let engine = engine.clone();
        let lock = lock.clone();
        starts.spawn(async move {
            let outcome = engine.start_flow(&flow_id, std::slice::from_ref(&lock)).await;
            (flow_id, outcome)
        });
    }
    let mut winners = Vec::new();
    while let Some(joined) = starts.join_next().await {
        let (flow_id, outcome) = joined.unwrap();
        match outcome.unwrap() {
            FlowStart::Started => winners.push(flow_id),
            FlowStart::LockHeld { .. } => {}
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(store.get_lock(&lock.key).await.unwrap().unwrap().owner, winners[0]);
    for flow_id in &flows {
        let expected = if flow_id == &winners[0] {
            FlowState::Pending
        } else {
            FlowState::Init
        };
        assert_eq!(store.get_flow(flow_id).await.unwrap().state, expected);
    }
}

/// Tracks how many runs overlap.
#[derive(Debug, Clone, Default)]
struct Gauge {
    current: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
}

#[async_trait]
impl Action for Gauge {
    fn name(&self) -> ActionName {
        ActionName::new("gauge")
    }

    async fn run(&self, _ctx: &ExecuteContext, _params: Value) -> Result<Value> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({}))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_bounds_in_flight_tasks() {
    init_tracing();
    let gauge = Gauge::default();
    let registry = Registry::new();
    registry.register(gauge.clone());
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        worker_pool_size: 2,
        ..test_config()
    };
    let engine = FlowEngine::new(Arc::new(registry), store.clone(), config).unwrap();

    let flow_id = engine
        .create_custom_flow(CustomFlowRequest {
            name: "fan_out".into(),
            tasks: (1..=6).map(|i| TaskTemplate::new(i.to_string(), "gauge")).collect(),
            ..CustomFlowRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(engine.run_flow(&flow_id).await.unwrap(), FlowState::Success);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_start_flow_takes_all_locks_or_none() {
    let registry = Registry::new();
    registry.register(Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    });
    registry.register_template(diamond()).unwrap();
    let (store, engine) = engine_with(registry);

    let shared = LockRequest::new("sg-1", "security_group", "update_rules");
    engine
        .locker()
        .acquire(&shared, "someone-else")
        .await
        .unwrap();

    let flow_id = engine
        .create_template_flow(TemplateFlowRequest::new("diamond").init_state(true))
        .await
        .unwrap();
    let first = LockRequest::new("lb-1", "load_balancer", "update_rules");
    let outcome = engine
        .start_flow(&flow_id, &[first.clone(), shared.clone()])
        .await
        .unwrap();
    assert!(matches!(outcome, FlowStart::LockHeld { .. }));
    assert!(store.get_lock(&first.key).await.unwrap().is_none());
    assert_eq!(store.get_flow(&flow_id).await.unwrap().state, FlowState::Init);
}

/// Bulk action attaching every instance of a management to a business.
#[derive(Debug)]
struct AttachInstances {
    tracker: TaskDetailTracker,
    cloud_calls: Arc<AtomicU32>,
}

#[derive(Debug, Deserialize)]
struct AttachParams {
    management_id: String,
}

#[async_trait]
impl Action for AttachInstances {
    fn name(&self) -> ActionName {
        ActionName::new("attach_instances")
    }

    async fn run(&self, _ctx: &ExecuteContext, params: Value) -> Result<Value> {
        let params: AttachParams = decode_params(params)?;
        let mut outcomes = Vec::new();
        for detail in self.tracker.list_details(&params.management_id).await? {
            let calls = self.cloud_calls.clone();
            let outcome = self
                .tracker
                .process(&detail.id, |d| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({ "attached": d.param["instance"] }))
                })
                .await?;
            outcomes.push((detail.id, outcome));
        }
        let done = self.tracker.summarize(&outcomes)?;
        Ok(json!({ "attached": done.len() }))
    }
}

#[tokio::test]
async fn test_cancelled_detail_succeeds_without_cloud_call() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let config = test_config();
    let tracker = TaskDetailTracker::new(store.clone(), &config);
    let cloud_calls = Arc::new(AtomicU32::new(0));
    let registry = Registry::new();
    registry.register(AttachInstances {
        tracker: tracker.clone(),
        cloud_calls: cloud_calls.clone(),
    });
    let engine = FlowEngine::new(Arc::new(registry), store.clone(), config).unwrap();

    let items = ["i-1", "i-2", "i-3"]
        .into_iter()
        .map(|id| DetailRequest::new(json!({ "instance": id })))
        .collect();
    let (management, details) = tracker.create_management(vec![], items).await.unwrap();
    tracker
        .batch_update(vec![TaskDetailUpdate::state(details[1].id.as_str(), DetailState::Cancel)])
        .await
        .unwrap();

    let flow_id = engine
        .create_custom_flow(CustomFlowRequest {
            name: "attach".into(),
            tasks: vec![TaskTemplate::new("1", "attach_instances")
                .with_params(json!({ "management_id": management.id }))],
            ..CustomFlowRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(engine.run_flow(&flow_id).await.unwrap(), FlowState::Success);

    assert_eq!(cloud_calls.load(Ordering::SeqCst), 2);
    let task = store.get_task(&flow_id, &ActionId::new("1")).await.unwrap();
    assert_eq!(task.result, Some(json!({ "attached": 3 })));
    let skipped = tracker.get_detail(&details[1].id).await.unwrap();
    assert_eq!(skipped.state, DetailState::Cancel);
    assert_eq!(
        tracker.refresh_management_state(&management.id).await.unwrap(),
        ManagementState::Success
    );
    assert_eq!(
        tracker.process(&details[1].id, |_| async { Ok(json!({})) }).await.unwrap(),
        ItemOutcome::Skipped
    );
}

#[tokio::test]
async fn test_failure_rolls_back_and_retry_task_recovers() {
    let recorder = Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    };
    let flaky = Flaky {
        failing: Arc::new(AtomicBool::new(true)),
        calls: Arc::new(AtomicU32::new(0)),
    };
    let registry = Registry::new();
    registry.register_with_rollback(recorder.clone());
    registry.register(flaky.clone());
    registry
        .register_template(
            FlowTemplate::new("create_vm")
                .task(TaskTemplate::new("1", "record"))
                .task(TaskTemplate::new("2", "flaky").depends_on(["1"]))
                .task(TaskTemplate::new("3", "record").depends_on(["2"])),
        )
        .unwrap();
    let (store, engine) = engine_with(registry);

    let flow_id = engine
        .create_template_flow(TemplateFlowRequest::new("create_vm"))
        .await
        .unwrap();
    assert_eq!(engine.run_flow(&flow_id).await.unwrap(), FlowState::Failed);

    let flow = store.get_flow(&flow_id).await.unwrap();
    let reason = flow.reason.unwrap();
    assert_eq!(reason.pre_state, Some(FlowState::Running));
    assert!(reason.message.contains('2'));
    assert!(recorder.events().contains(&"rollback:1".to_string()));
    assert!(!recorder.events().contains(&"start:3".to_string()));

    let one = store.get_task(&flow_id, &ActionId::new("1")).await.unwrap();
    assert_eq!(one.state, TaskState::Pending);
    let two = store.get_task(&flow_id, &ActionId::new("2")).await.unwrap();
    assert_eq!(two.state, TaskState::Failed);
    assert!(two.reason.unwrap().contains("quota exceeded"));
    let three = store.get_task(&flow_id, &ActionId::new("3")).await.unwrap();
    assert_eq!(three.state, TaskState::Init);

    flaky.failing.store(false, Ordering::SeqCst);
    engine.retry_task(&flow_id, &ActionId::new("2")).await.unwrap();
    assert_eq!(store.get_flow(&flow_id).await.unwrap().state, FlowState::Pending);
    assert_eq!(engine.run_flow(&flow_id).await.unwrap(), FlowState::Success);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        recorder.events().iter().filter(|e| *e == "start:1").count(),
        2
    );
}

#[tokio::test]
async fn test_opt_in_task_retry() {
    #[derive(Debug)]
    struct FailTwice {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Action for FailTwice {
        fn name(&self) -> ActionName {
            ActionName::new("fail_twice")
        }

        async fn run(&self, _ctx: &ExecuteContext, _params: Value) -> Result<Value> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(EngineError::Aborted("not yet".into()));
            }
            Ok(json!("done"))
        }
    }

    let calls = Arc::new(AtomicU32::new(0));
    let registry = Registry::new();
    registry.register(FailTwice {
        calls: calls.clone(),
    });
    let (store, engine) = engine_with(registry);
    let retry = TaskRetry::enabled(RetryPolicy::new(2, 1, 5).unwrap());

    let flow_id = engine
        .create_custom_flow(CustomFlowRequest {
            name: "retrying".into(),
            tasks: vec![TaskTemplate::new("1", "fail_twice").with_retry(retry)],
            ..CustomFlowRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(engine.run_flow(&flow_id).await.unwrap(), FlowState::Success);
    let task = store.get_task(&flow_id, &ActionId::new("1")).await.unwrap();
    assert_eq!(task.rollback_count, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Without opt-in the first failure is final.
    calls.store(0, Ordering::SeqCst);
    let flow_id = engine
        .create_custom_flow(CustomFlowRequest {
            name: "single".into(),
            tasks: vec![TaskTemplate::new("1", "fail_twice")],
            ..CustomFlowRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(engine.run_flow(&flow_id).await.unwrap(), FlowState::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_task_timeout_fails_flow() {
    #[derive(Debug)]
    struct Hang;

    #[async_trait]
    impl Action for Hang {
        fn name(&self) -> ActionName {
            ActionName::new("hang")
        }

        async fn run(&self, _ctx: &ExecuteContext, _params: Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    let registry = Registry::new();
    registry.register(Hang);
    let (store, engine) = engine_with(registry);
    let flow_id = engine
        .create_custom_flow(CustomFlowRequest {
            name: "hang".into(),
            tasks: vec![TaskTemplate::new("1", "hang").with_timeout_secs(1)],
            ..CustomFlowRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(engine.run_flow(&flow_id).await.unwrap(), FlowState::Failed);
    let task = store.get_task(&flow_id, &ActionId::new("1")).await.unwrap();
    assert!(task.reason.unwrap().starts_with("Timeout"));
}

#[tokio::test]
async fn test_panicking_action_fails_its_task() {
    #[derive(Debug)]
    struct Explode;

    #[async_trait]
    impl Action for Explode {
        fn name(&self) -> ActionName {
            ActionName::new("explode")
        }

        async fn run(&self, _ctx: &ExecuteContext, _params: Value) -> Result<Value> {
            panic!("boom");
        }
    }

    let registry = Registry::new();
    registry.register(Explode);
    let (store, engine) = engine_with(registry);
    let flow_id = engine
        .create_custom_flow(CustomFlowRequest {
            name: "explode".into(),
            tasks: vec![TaskTemplate::new("1", "explode")],
            ..CustomFlowRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(engine.run_flow(&flow_id).await.unwrap(), FlowState::Failed);
    let task = store.get_task(&flow_id, &ActionId::new("1")).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
}

#[tokio::test]
async fn test_cancel_during_run_stops_dispatch() {
    let recorder = Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    };
    let registry = Registry::new();
    registry.register(recorder.clone());
    registry.register_template(diamond()).unwrap();
    let (store, engine) = engine_with(registry);
    let engine = Arc::new(engine);

    let flow_id = engine
        .create_template_flow(TemplateFlowRequest::new("diamond"))
        .await
        .unwrap();
    let runner = {
        let engine = engine.clone();
        let flow_id = flow_id.clone();
        tokio::spawn(async move { engine.run_flow(&flow_id).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    engine.cancel_flow(&flow_id).await.unwrap();

    assert_eq!(runner.await.unwrap().unwrap(), FlowState::Cancel);
    let tasks = store.list_tasks(&flow_id).await.unwrap();
    assert!(tasks.iter().all(|t| t.state == TaskState::Cancel));
    assert!(!recorder.events().contains(&"start:2".to_string()));
    assert!(engine.cancel_flow(&flow_id).await.is_err());
}

#[tokio::test]
async fn test_share_data_flows_to_dependents() {
    #[derive(Debug)]
    struct Produce;

    #[async_trait]
    impl Action for Produce {
        fn name(&self) -> ActionName {
            ActionName::new("produce")
        }

        async fn run(&self, ctx: &ExecuteContext, _params: Value) -> Result<Value> {
            // Twice, as an interrupted producer would on re-run.
            ctx.share_data().append_ids("instance_ids", ["i-1", "i-2"]).await?;
            ctx.share_data().append_ids("instance_ids", ["i-2", "i-3"]).await?;
            Ok(Value::Null)
        }
    }

    #[derive(Debug)]
    struct Consume;

    #[async_trait]
    impl Action for Consume {
        fn name(&self) -> ActionName {
            ActionName::new("consume")
        }

        async fn run(&self, ctx: &ExecuteContext, _params: Value) -> Result<Value> {
            let ids = ctx.share_data().ids("instance_ids").await?;
            let business = ctx.share_data().get("business").await?;
            Ok(json!({ "ids": ids, "business": business }))
        }
    }

    let registry = Registry::new();
    registry.register(Produce);
    registry.register(Consume);
    let (store, engine) = engine_with(registry);
    let mut share_data = BTreeMap::new();
    share_data.insert("business".to_string(), "b-42".to_string());
    let flow_id = engine
        .create_custom_flow(CustomFlowRequest {
            name: "assign".into(),
            share_data,
            tasks: vec![
                TaskTemplate::new("1", "produce"),
                TaskTemplate::new("2", "consume").depends_on(["1"]),
            ],
            ..CustomFlowRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(engine.run_flow(&flow_id).await.unwrap(), FlowState::Success);
    let task = store.get_task(&flow_id, &ActionId::new("2")).await.unwrap();
    assert_eq!(
        task.result,
        Some(json!({ "ids": ["i-1", "i-2", "i-3"], "business": "b-42" }))
    );
}

#[tokio::test]
async fn test_clone_flow_copies_tasks_without_state() {
    let registry = Registry::new();
    registry.register(Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    });
    registry.register_template(diamond().share("region", "ap-1")).unwrap();
    let (store, engine) = engine_with(registry);

    let source = engine
        .create_template_flow(TemplateFlowRequest::new("diamond"))
        .await
        .unwrap();
    engine.run_flow(&source).await.unwrap();

    let copy = engine.clone_flow(&source, true).await.unwrap();
    let flow = store.get_flow(&copy).await.unwrap();
    assert_eq!(flow.state, FlowState::Init);
    assert_eq!(flow.memo, Some(format!("cloned for {source}")));
    assert_eq!(
        store.get_share_data(&copy).await.unwrap().get("region").map(String::as_str),
        Some("ap-1")
    );
    let tasks = store.list_tasks(&copy).await.unwrap();
    assert_eq!(tasks.len(), 4);
    assert!(tasks.iter().all(|t| t.state == TaskState::Init && t.result.is_none()));
}

#[tokio::test]
async fn test_scheduler_runs_pending_flows() {
    let recorder = Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    };
    let registry = Registry::new();
    registry.register(recorder.clone());
    registry.register_template(diamond()).unwrap();
    let (store, engine) = engine_with(registry);
    let engine = Arc::new(engine);

    let first = engine
        .create_template_flow(TemplateFlowRequest::new("diamond"))
        .await
        .unwrap();
    let second = engine
        .create_template_flow(TemplateFlowRequest::new("diamond"))
        .await
        .unwrap();
    let parked = engine
        .create_template_flow(TemplateFlowRequest::new("diamond").init_state(true))
        .await
        .unwrap();

    let scheduler = Scheduler::new(engine.clone());
    assert_eq!(scheduler.run_once().await.unwrap(), 2);
    scheduler.wait_idle().await;

    assert_eq!(store.get_flow(&first).await.unwrap().state, FlowState::Success);
    assert_eq!(store.get_flow(&second).await.unwrap().state, FlowState::Success);
    assert_eq!(store.get_flow(&parked).await.unwrap().state, FlowState::Init);

    engine.start_flow(&parked, &[]).await.unwrap();
    let handle = Scheduler::new(engine.clone()).spawn();
    for _ in 0..200 {
        if store.get_flow(&parked).await.unwrap().state == FlowState::Success {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.shutdown().await;
    assert_eq!(store.get_flow(&parked).await.unwrap().state, FlowState::Success);
}

fn seeded_flow(id: &str, state: FlowState, age: chrono::Duration) -> Flow {
    let at = Utc::now() - age;
    Flow {
        id: id.into(),
        name: "diamond".into(),
        state,
        memo: None,
        reason: None,
        initial_share_data: BTreeMap::new(),
        created_at: at,
        updated_at: at,
    }
}

fn seeded_task(flow_id: &str, id: &str, deps: &[&str], state: TaskState, age: chrono::Duration) -> Task {
    let at = Utc::now() - age;
    Task {
        flow_id: flow_id.into(),
        action_id: ActionId::new(id),
        action_name: ActionName::new("record"),
        depend_on: deps.iter().map(|d| ActionId::new(*d)).collect(),
        params: Value::Null,
        retry: TaskRetry::default(),
        timeout_secs: None,
        state,
        rollback_count: 0,
        result: None,
        reason: None,
        created_at: at,
        updated_at: at,
    }
}

#[tokio::test]
async fn test_watchdog_fails_expired_tasks() {
    let registry = Registry::new();
    registry.register(Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    });
    let (store, engine) = engine_with(registry);

    let long_ago = chrono::Duration::hours(2);
    store
        .create_flow(
            seeded_flow("stuck", FlowState::Running, long_ago),
            vec![seeded_task("stuck", "1", &[], TaskState::Running, long_ago)],
        )
        .await
        .unwrap();

    assert_eq!(engine.fail_expired_tasks().await.unwrap(), 1);
    let flow = store.get_flow("stuck").await.unwrap();
    assert_eq!(flow.state, FlowState::Failed);
    let task = store.get_task("stuck", &ActionId::new("1")).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(engine.fail_expired_tasks().await.unwrap(), 0);
}

#[tokio::test]
async fn test_interrupted_tasks_resume_on_next_run() {
    let recorder = Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    };
    let registry = Registry::new();
    registry.register(recorder.clone());
    let (store, engine) = engine_with(registry);

    let age = chrono::Duration::minutes(1);
    store
        .create_flow(
            seeded_flow("resumed", FlowState::Pending, age),
            vec![
                seeded_task("resumed", "1", &[], TaskState::Running, age),
                seeded_task("resumed", "2", &[], TaskState::Rollback, age),
                seeded_task("resumed", "3", &["1", "2"], TaskState::Init, age),
            ],
        )
        .await
        .unwrap();

    assert_eq!(engine.run_flow("resumed").await.unwrap(), FlowState::Success);
    assert!(recorder.position("end:1") < recorder.position("start:3"));
    assert!(recorder.position("end:2") < recorder.position("start:3"));
    let tasks = store.list_tasks("resumed").await.unwrap();
    assert!(tasks.iter().all(|t| t.state == TaskState::Success));
}

#[tokio::test]
async fn test_transient_read_failures_are_retried() {
    let registry = Registry::new();
    registry.register(Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    });
    registry.register_template(diamond()).unwrap();
    let (store, engine) = engine_with(registry);

    let flow_id = engine
        .create_template_flow(TemplateFlowRequest::new("diamond"))
        .await
        .unwrap();
    store.fail_next_reads(2);
    assert_eq!(engine.run_flow(&flow_id).await.unwrap(), FlowState::Success);
}

#[tokio::test]
async fn test_orphaned_flow_is_driven_again() {
    init_tracing();
    let registry = Registry::new();
    registry.register(Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    });
    registry.register_template(diamond()).unwrap();
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        orphan_flow_ms: 50,
        ..test_config()
    };
    let engine = Arc::new(FlowEngine::new(Arc::new(registry), store.clone(), config).unwrap());

    let flow_id = engine
        .create_template_flow(TemplateFlowRequest::new("diamond"))
        .await
        .unwrap();
    // Outlasts the storage retry budget right after the flow is claimed.
    store.fail_next_reads(3);
    assert!(matches!(engine.run_flow(&flow_id).await, Err(EngineError::Storage(_))));
    assert_eq!(store.get_flow(&flow_id).await.unwrap().state, FlowState::Running);

    let scheduler = Scheduler::new(engine.clone());
    assert_eq!(engine.recover_orphaned_flows().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.run_once().await.unwrap(), 1);
    scheduler.wait_idle().await;
    assert_eq!(store.get_flow(&flow_id).await.unwrap().state, FlowState::Success);
}

#[tokio::test]
async fn test_orphan_sweep_settles_or_skips() {
    let registry = Registry::new();
    registry.register(Recorder {
        log: Arc::new(Mutex::new(Vec::new())),
    });
    let (store, engine) = engine_with(registry);

    let long_ago = chrono::Duration::hours(1);
    store
        .create_flow(
            seeded_flow("done", FlowState::Running, long_ago),
            vec![seeded_task("done", "1", &[], TaskState::Success, long_ago)],
        )
        .await
        .unwrap();
    store
        .create_flow(
            seeded_flow("halfway", FlowState::Running, long_ago),
            vec![
                seeded_task("halfway", "1", &[], TaskState::Success, long_ago),
                seeded_task("halfway", "2", &["1"], TaskState::Init, long_ago),
            ],
        )
        .await
        .unwrap();
    store
        .create_flow(
            seeded_flow("busy", FlowState::Running, long_ago),
            vec![seeded_task("busy", "1", &[], TaskState::Running, chrono::Duration::zero())],
        )
        .await
        .unwrap();
    store
        .create_flow(
            seeded_flow("recent", FlowState::Running, long_ago),
            vec![seeded_task("recent", "1", &[], TaskState::Success, chrono::Duration::zero())],
        )
        .await
        .unwrap();

    assert_eq!(engine.recover_orphaned_flows().await.unwrap(), 2);
    assert_eq!(store.get_flow("done").await.unwrap().state, FlowState::Success);
    assert_eq!(store.get_flow("halfway").await.unwrap().state, FlowState::Pending);
    assert_eq!(store.get_flow("busy").await.unwrap().state, FlowState::Running);
    assert_eq!(store.get_flow("recent").await.unwrap().state, FlowState::Running);

    assert_eq!(engine.run_flow("halfway").await.unwrap(), FlowState::Success);
}
