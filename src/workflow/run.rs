//! Runtime state of a workflow execution
//!
//! A `WorkflowRun` is the single record the engine persists per execution. It
//! carries the materialized steps and the append-only log inline, so a store
//! only ever needs to get/put one document keyed by run id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::definition::StepBlueprint;

/// Opaque key/value map passed into and returned from step handlers
pub type Payload = serde_json::Map<String, Value>;

/// Status of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    WaitingHuman,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Completed, failed and cancelled runs never advance again on their own
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingHuman => "waiting_human",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    WaitingHuman,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Steps the driver walks past without invoking a handler
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// The step currently occupying the run's single active slot
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::WaitingHuman)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingHuman => "waiting_human",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One entry of a run's append-only log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

/// A materialized step blueprint carrying runtime state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub step_type: String,
    pub status: StepStatus,
    #[serde(default)]
    pub input: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Payload>,
    pub retries: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl WorkflowStep {
    /// Create a fresh pending step from its blueprint
    pub fn from_blueprint(blueprint: &StepBlueprint, max_retries: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: blueprint.name.clone(),
            step_type: blueprint.step_type.clone(),
            status: StepStatus::Pending,
            input: Payload::new(),
            output: None,
            retries: 0,
            max_retries,
            error: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Whether the handler output asks for an external actor before continuing
    pub fn requires_action(output: &Payload) -> bool {
        output.get("requiresAction").map(is_truthy).unwrap_or(false)
    }
}

/// Loose truthiness for handler-provided flags
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Shallow merge: keys of `from` overwrite keys of `into`
pub fn merge_payload(into: &mut Payload, from: &Payload) {
    for (key, value) in from {
        into.insert(key.clone(), value.clone());
    }
}

/// One execution of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub project_id: String,
    pub workflow_type: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    pub current_state: String,
    pub status: RunStatus,
    #[serde(default)]
    pub logs: Vec<WorkflowLog>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Index of the step paused for external input, if any
    pub fn waiting_step_index(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status == StepStatus::WaitingHuman)
    }

    /// Index of the first step the driver still has to deal with
    pub fn next_open_step(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.status.is_done())
    }

    /// Merge a step's output into the input of the step after it
    pub fn pass_output_forward(&mut self, index: usize) {
        let Some(output) = self.steps.get(index).and_then(|s| s.output.clone()) else {
            return;
        };
        if let Some(next) = self.steps.get_mut(index + 1) {
            merge_payload(&mut next.input, &output);
        }
    }

    /// Append a log entry attributed to the current step
    pub fn log(
        &mut self,
        timestamp: DateTime<Utc>,
        level: LogLevel,
        message: impl Into<String>,
        data: Option<Payload>,
    ) {
        self.logs.push(WorkflowLog {
            timestamp,
            level,
            step_id: self.current_step_id.clone(),
            message: message.into(),
            data,
        });
    }
}
