//! Outbound notifications
//!
//! Two channels leave the engine when a run changes externally visible state:
//! - a [`Notifier`] delivering `{runId, status, currentState}` to the run's
//!   webhook URL (best effort, at most once)
//! - [`RunObserver`]s registered on the engine, receiving typed [`RunEvent`]s

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::workflow::{RunStatus, WebhookConfig, WorkflowRun};

/// Body of a webhook notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub run_id: String,
    pub status: RunStatus,
    pub current_state: String,
}

impl From<&WorkflowRun> for WebhookPayload {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.id.clone(),
            status: run.status,
            current_state: run.current_state.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Webhook responded with HTTP {0}")]
    Status(u16),
}

/// Fire-and-forget delivery of run status changes
///
/// Implementations must not propagate failures: the run's state never
/// depends on whether a notification arrived.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, run: &WorkflowRun);
}

/// Posts [`WebhookPayload`] as JSON to `run.webhook_url`
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    headers: HashMap<String, String>,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            headers: config.headers.clone(),
        })
    }

    /// Deliver one payload, reporting the outcome
    pub async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<(), NotifyError> {
        let mut request = self.client.post(url).json(payload);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, run: &WorkflowRun) {
        let Some(url) = run.webhook_url.as_deref() else {
            return;
        };

        let payload = WebhookPayload::from(run);
        match self.deliver(url, &payload).await {
            Ok(()) => debug!(run_id = %run.id, status = %run.status, "Webhook delivered"),
            Err(e) => warn!(run_id = %run.id, url, error = %e, "Webhook delivery failed"),
        }
    }
}

/// Typed run lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    WaitingHuman(WorkflowRun),
    Completed(WorkflowRun),
    Failed(WorkflowRun),
    Cancelled(WorkflowRun),
}

impl RunEvent {
    pub fn run(&self) -> &WorkflowRun {
        match self {
            Self::WaitingHuman(run)
            | Self::Completed(run)
            | Self::Failed(run)
            | Self::Cancelled(run) => run,
        }
    }

    /// Event name as used on the wire (`run:completed`, ...)
    pub fn name(&self) -> &'static str {
        match self {
            Self::WaitingHuman(_) => "run:waiting_human",
            Self::Completed(_) => "run:completed",
            Self::Failed(_) => "run:failed",
            Self::Cancelled(_) => "run:cancelled",
        }
    }
}

/// Receives run events synchronously from the driver; keep it cheap
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: async_channel::Sender<RunEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, async_channel::Receiver<RunEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl RunObserver for ChannelObserver {
    fn on_event(&self, event: &RunEvent) {
        // closed receiver just means nobody is listening any more
        let _ = self.tx.try_send(event.clone());
    }
}
