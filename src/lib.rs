//! # stepflow
//!
//! A durable, resumable workflow engine that executes a named sequence of
//! typed steps on behalf of a long-running business process.
//!
//! ## Features
//!
//! - **Positional execution** - Steps run strictly in definition order, one at a time
//! - **Retries with backoff** - Failing handlers are retried with linear backoff
//! - **Human in the loop** - A handler returning `requiresAction: true` pauses the run
//! - **Resumable** - Runs live in a pluggable store and can be re-driven after a restart
//! - **Notifications** - Webhooks and typed observers on every visible state change
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stepflow::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder()
//!         .handlers(HandlerRegistry::with_builtin_handlers())
//!         .build()
//!         .await?;
//!
//!     let input = json!({ "revisionType": "color_grade" });
//!     let run = engine
//!         .start_run("revision", "proj-1", input.as_object().cloned().unwrap_or_default(), None)
//!         .await?;
//!     engine.join(&run.id).await;
//!
//!     // The built-in review step pauses for a human decision
//!     let run = engine.resume_run(&run.id, Payload::new()).await?;
//!     engine.join(&run.id).await;
//!
//!     println!("{:?}", engine.get_run(&run.id).await?.map(|r| r.status));
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod workflow;

// Re-export main types
pub use engine::{
    handler_fn, ChannelObserver, Clock, Engine, EngineBuilder, EngineError, FileRunStore,
    HandlerError, HandlerRegistry, InMemoryRunStore, MockClock, Notifier, RunEvent, RunObserver,
    RunStore, StepHandler, StoreError, SystemClock, WebhookNotifier, WebhookPayload,
};
pub use workflow::{
    CatalogBuilder, CatalogError, DefinitionLoader, EngineConfig, LoadError, LogLevel, Payload,
    RunStatus, StepBlueprint, StepStatus, WorkflowCatalog, WorkflowDefinition, WorkflowLog,
    WorkflowRun, WorkflowStep,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::{
        handler_fn, Engine, EngineBuilder, EngineError, HandlerError, HandlerRegistry,
        InMemoryRunStore, RunEvent, RunObserver, RunStore, StepHandler,
    };
    pub use crate::workflow::{
        EngineConfig, Payload, RunStatus, StepBlueprint, StepStatus, WorkflowCatalog,
        WorkflowDefinition, WorkflowRun,
    };
}
