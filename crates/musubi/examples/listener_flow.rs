use async_trait::async_trait;
use musubi::prelude::*;
use musubi::{
    decode_params, watch_template, FlowStart, FlowWatchAction, FlowWatchParams, ResourceLocker,
    Retrier, WatchConfig, FLOW_WATCH,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct ListenerParams {
    lb_id: String,
    port: u16,
}

#[derive(Debug)]
struct CreateListener;

#[async_trait]
impl Action for CreateListener {
    fn name(&self) -> ActionName {
        ActionName::new("create_listener")
    }

    async fn run(&self, ctx: &ExecuteContext, params: Value) -> Result<Value> {
        let params: ListenerParams = decode_params(params)?;
        ctx.check_cancelled().await?;
        println!("creating listener on {}:{}", params.lb_id, params.port);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let listener_id = format!("{}-ls-{}", params.lb_id, params.port);
        ctx.share_data().set("listener_id", &listener_id).await?;
        Ok(json!({ "listener_id": listener_id }))
    }
}

#[derive(Debug)]
struct AttachBackends;

#[async_trait]
impl Action for AttachBackends {
    fn name(&self) -> ActionName {
        ActionName::new("attach_backends")
    }

    async fn run(&self, ctx: &ExecuteContext, _params: Value) -> Result<Value> {
        let listener = ctx.share_data().get("listener_id").await?.unwrap_or_default();
        let backends = ctx.share_data().ids("backend_ids").await?;
        println!("attaching {} backends to {}", backends.len(), listener);
        Ok(json!({ "attached": backends }))
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        scheduler_interval_ms: 100,
        ..EngineConfig::default()
    };
    let locker = ResourceLocker::new(store.clone(), Retrier::new(config.storage_retry));
    let watch_config = WatchConfig {
        poll_interval_ms: 100,
        ..WatchConfig::default()
    };

    let registry = Arc::new(Registry::new());
    registry.register(CreateListener);
    registry.register(AttachBackends);
    registry.register_template(watch_template(&watch_config))?;
    registry.register(FlowWatchAction::new(store.clone(), locker, watch_config)?);
    registry.register_template(
        FlowTemplate::new("create_listener")
            .share("backend_ids", "i-1,i-2")
            .task(TaskTemplate::new("1", "create_listener"))
            .task(TaskTemplate::new("2", "attach_backends").depends_on(["1"])),
    )?;

    let engine = Arc::new(FlowEngine::new(registry, store.clone(), config)?);
    let lock = LockRequest::new("lb-1", "load_balancer", "create_listener");

    let mut flows = Vec::new();
    for port in [80, 443] {
        let flow_id = engine
            .create_template_flow(
                TemplateFlowRequest::new("create_listener")
                    .init_state(true)
                    .params("1", json!({ "lb_id": "lb-1", "port": port })),
            )
            .await?;
        flows.push(flow_id);
    }

    let handle = Scheduler::new(engine.clone()).spawn();
    let mut waiting = flows.clone();
    while !waiting.is_empty() {
        let flow_id = waiting[0].clone();
        match engine.start_flow(&flow_id, std::slice::from_ref(&lock)).await? {
            FlowStart::Started => {
                println!("flow {flow_id} started");
                let params = FlowWatchParams::new(flow_id.as_str(), &lock.key);
                engine
                    .create_template_flow(
                        TemplateFlowRequest::new(FLOW_WATCH).params("1", serde_json::to_value(params)?),
                    )
                    .await?;
                waiting.remove(0);
            }
            FlowStart::LockHeld { owner, .. } => {
                println!("flow {flow_id} waits for {owner}");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }

    loop {
        let mut done = true;
        for flow_id in &flows {
            done &= store.get_flow(flow_id).await?.state.is_terminal();
        }
        if done && store.get_lock(&lock.key).await?.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    handle.shutdown().await;

    for flow_id in &flows {
        println!("{flow_id}: {}", store.get_flow(flow_id).await?.state);
    }
    Ok(())
}
