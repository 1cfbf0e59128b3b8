//! Engine error types

use crate::engine::store::StoreError;
use crate::workflow::{RunStatus, StepStatus};

/// Errors reported synchronously by engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Step {step_id} not found in run {run_id}")]
    StepNotFound { run_id: String, step_id: String },

    #[error("No step waiting for human action in run {0}")]
    NoWaitingStep(String),

    #[error("Run {run_id} is {status}: {message}")]
    InvalidRunState {
        run_id: String,
        status: RunStatus,
        message: String,
    },

    #[error("Step {step_id} is {status}, only failed steps can be retried")]
    InvalidStepState { step_id: String, status: StepStatus },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure reported by a step handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{:#}", err))
    }
}
