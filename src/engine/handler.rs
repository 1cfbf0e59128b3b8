//! Step handlers and the handler registry
//!
//! A handler is the pluggable unit of work behind a step. The engine treats
//! it as opaque: it receives the step's input and the blueprint config, and
//! returns an output map or an error. A truthy `requiresAction` key in the
//! output pauses the run after the step.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::engine::error::HandlerError;
use crate::workflow::Payload;

/// Trait implemented by every step handler
///
/// Handlers may be invoked more than once with the same input (retries,
/// recovery after a crash), so side effects should be safe to repeat.
///
/// ## Example
///
/// ```ignore
/// use stepflow::engine::{HandlerError, StepHandler};
/// use stepflow::workflow::Payload;
///
/// struct Transcode;
///
/// #[async_trait::async_trait]
/// impl StepHandler for Transcode {
///     async fn execute(&self, input: &Payload, _config: Option<&Payload>) -> Result<Payload, HandlerError> {
///         let source = input.get("source").ok_or(HandlerError::InvalidInput("source".into()))?;
///         let mut out = Payload::new();
///         out.insert("transcoded".into(), source.clone());
///         Ok(out)
///     }
/// }
/// ```
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Perform the step's work
    async fn execute(
        &self,
        input: &Payload,
        config: Option<&Payload>,
    ) -> Result<Payload, HandlerError>;

    /// Whether `rollback` does anything for this handler
    fn supports_rollback(&self) -> bool {
        false
    }

    /// Compensating action for a previously completed execution
    async fn rollback(&self, _input: &Payload) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Adapter turning an async closure into a [`StepHandler`]
pub struct FnHandler<F> {
    func: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Payload, Option<Payload>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(Payload, Option<Payload>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send,
{
    async fn execute(
        &self,
        input: &Payload,
        config: Option<&Payload>,
    ) -> Result<Payload, HandlerError> {
        (self.func)(input.clone(), config.cloned()).await
    }
}

/// Shorthand for `FnHandler::new`
pub fn handler_fn<F, Fut>(func: F) -> FnHandler<F>
where
    F: Fn(Payload, Option<Payload>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send,
{
    FnHandler::new(func)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Handler not found: {0}")]
pub struct HandlerNotFound(pub String);

/// Name -> handler lookup table
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, handler: impl StepHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn StepHandler>, HandlerNotFound> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| HandlerNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
