//! Durable action/flow orchestration with resource locking.
//!
//! Flows are DAGs of tasks, each bound to a registered [`Action`]. All state
//! lives behind the [`Store`] trait, so any number of engines and schedulers
//! can drive the same flows.
//!
//! # Example
//!
//! ```rust,ignore
//! use musubi::prelude::*;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct CreateSubnet;
//!
//! #[async_trait]
//! impl Action for CreateSubnet {
//!     fn name(&self) -> ActionName {
//!         ActionName::new("create_subnet")
//!     }
//!
//!     async fn run(&self, ctx: &ExecuteContext, params: Value) -> Result<Value> {
//!         ctx.share_data().append_ids("subnet_ids", ["subnet-1"]).await?;
//!         Ok(json!({ "subnet_id": "subnet-1" }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let registry = Arc::new(Registry::new());
//!     registry.register(CreateSubnet);
//!     registry.register_template(
//!         FlowTemplate::new("network").task(TaskTemplate::new("1", "create_subnet")),
//!     )?;
//!
//!     let engine = FlowEngine::new(registry, Arc::new(MemoryStore::new()), EngineConfig::default())?;
//!     let flow_id = engine.create_template_flow(TemplateFlowRequest::new("network")).await?;
//!     assert_eq!(engine.run_flow(&flow_id).await?, FlowState::Success);
//!     Ok(())
//! }
//! ```

mod config;
mod detail;
mod engine;
mod lock;
mod memory;
mod registry;
mod retry;
mod scheduler;
mod watch;

// Re-export core types
pub use musubi_core::*;

pub use config::{EngineConfig, WatchConfig};
pub use detail::{DetailRequest, ItemOutcome, TaskDetailTracker};
pub use engine::{CustomFlowRequest, FlowEngine, FlowStart, TaskParams, TemplateFlowRequest};
pub use lock::{is_stale, Acquire, LockRequest, ResourceLocker};
pub use memory::MemoryStore;
pub use registry::{RegisteredAction, Registry};
pub use retry::Retrier;
pub use scheduler::{Scheduler, SchedulerHandle};
pub use watch::{watch_template, FlowWatchAction, FlowWatchParams, WatchOutcome, FLOW_WATCH};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        Action, ActionId, ActionName, EngineConfig, EngineError, ExecuteContext, FlowEngine,
        FlowState, FlowTemplate, LockRequest, MemoryStore, Registry, Result, RollbackAction,
        Scheduler, Store, TaskRetry, TaskState, TaskTemplate, TemplateFlowRequest,
    };
}
