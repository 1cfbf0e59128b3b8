//! Workflow execution engine module
//!
//! This module contains:
//! - `executor` - The execution driver and its public operations
//! - `error` - Engine and handler error types
//! - `handler` - Step handler trait and registry
//! - `builtin` - Stub handlers for the built-in step types
//! - `store` - Run State Store trait and implementations
//! - `notifier` - Webhook notifier, run events and observers
//! - `clock` - Time source, with a mock clock for controlling virtual time

pub mod builtin;
pub mod clock;
pub mod error;
pub mod executor;
pub mod handler;
pub mod notifier;
pub mod store;

pub use clock::{Clock, ClockError, MockClock, SystemClock};
pub use error::{EngineError, HandlerError};
pub use executor::{Engine, EngineBuilder};
pub use handler::{handler_fn, FnHandler, HandlerNotFound, HandlerRegistry, StepHandler};
pub use notifier::{
    ChannelObserver, Notifier, NotifyError, RunEvent, RunObserver, WebhookNotifier,
    WebhookPayload,
};
pub use store::{FileRunStore, InMemoryRunStore, RunStore, StoreError};
