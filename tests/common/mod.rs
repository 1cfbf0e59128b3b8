#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use stepflow::engine::{ChannelObserver, MockClock, Notifier, RunEvent, WebhookPayload};
use stepflow::prelude::*;
use tokio::sync::Notify;

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().expect("payload must be a JSON object")
}

/// Returns a fixed output
pub struct StaticHandler(pub Payload);

#[async_trait]
impl StepHandler for StaticHandler {
    async fn execute(&self, _input: &Payload, _config: Option<&Payload>) -> Result<Payload, HandlerError> {
        Ok(self.0.clone())
    }
}

pub fn ok() -> StaticHandler {
    StaticHandler(Payload::new())
}

pub fn returning(value: Value) -> StaticHandler {
    StaticHandler(payload(value))
}

pub fn pausing() -> StaticHandler {
    returning(json!({ "requiresAction": true, "reviewStatus": "pending_human" }))
}

/// Fails the first `failures` calls, then succeeds
pub struct FlakyHandler {
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                failures,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl StepHandler for FlakyHandler {
    async fn execute(&self, _input: &Payload, _config: Option<&Payload>) -> Result<Payload, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(HandlerError::failed(format!("transient failure #{}", call)))
        } else {
            Ok(payload(json!({ "attempt": call })))
        }
    }
}

pub fn always_failing() -> (FlakyHandler, Arc<AtomicU32>) {
    FlakyHandler::new(u32::MAX)
}

/// Blocks until released, so tests can act while a step is in flight
pub struct GateHandler {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl GateHandler {
    pub fn new() -> Self {
        Self {
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl StepHandler for GateHandler {
    async fn execute(&self, _input: &Payload, _config: Option<&Payload>) -> Result<Payload, HandlerError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(payload(json!({ "gated": true })))
    }
}

/// Succeeds and records rollbacks under its name
pub struct CompensatingHandler {
    pub name: String,
    pub rollbacks: Arc<Mutex<Vec<String>>>,
    pub output: Payload,
}

#[async_trait]
impl StepHandler for CompensatingHandler {
    async fn execute(&self, _input: &Payload, _config: Option<&Payload>) -> Result<Payload, HandlerError> {
        Ok(self.output.clone())
    }

    fn supports_rollback(&self) -> bool {
        true
    }

    async fn rollback(&self, _input: &Payload) -> Result<(), HandlerError> {
        self.rollbacks.lock().unwrap().push(self.name.clone());
        Ok(())
    }
}

/// Captures webhook payloads instead of sending them
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, WebhookPayload)>>,
}

impl RecordingNotifier {
    pub fn statuses(&self) -> Vec<RunStatus> {
        self.sent.lock().unwrap().iter().map(|(_, p)| p.status).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, run: &WorkflowRun) {
        if let Some(url) = &run.webhook_url {
            self.sent
                .lock()
                .unwrap()
                .push((url.clone(), WebhookPayload::from(run)));
        }
    }
}

/// Holds every delivery until the test drops `gate`'s guard
pub struct StalledNotifier {
    pub gate: Arc<tokio::sync::Mutex<()>>,
    pub delivered: Mutex<Vec<RunStatus>>,
}

impl StalledNotifier {
    pub fn new() -> (Self, tokio::sync::OwnedMutexGuard<()>) {
        let gate = Arc::new(tokio::sync::Mutex::new(()));
        let guard = Arc::clone(&gate)
            .try_lock_owned()
            .expect("fresh gate is unlocked");
        (
            Self {
                gate,
                delivered: Mutex::new(Vec::new()),
            },
            guard,
        )
    }
}

#[async_trait]
impl Notifier for StalledNotifier {
    async fn notify(&self, run: &WorkflowRun) {
        let _open = self.gate.lock().await;
        self.delivered.lock().unwrap().push(run.status);
    }
}

pub struct Harness {
    pub engine: Engine,
    pub clock: MockClock,
    pub notifier: Arc<RecordingNotifier>,
    pub events: async_channel::Receiver<RunEvent>,
}

impl Harness {
    pub fn drain_events(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            names.push(event.name());
        }
        names
    }
}

pub async fn harness_with(builder: EngineBuilder) -> Harness {
    let clock = MockClock::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let (observer, events) = ChannelObserver::new();

    let engine = builder
        .clock(Arc::new(clock.clone()))
        .notifier(notifier.clone())
        .observer(Arc::new(observer))
        .build()
        .await
        .expect("engine should build");

    Harness {
        engine,
        clock,
        notifier,
        events,
    }
}

pub async fn harness(handlers: HandlerRegistry) -> Harness {
    harness_with(Engine::builder().handlers(handlers)).await
}

/// Registry for the three-step revision workflow
pub fn revision_handlers(
    revision: impl StepHandler + 'static,
    generation: impl StepHandler + 'static,
    review: impl StepHandler + 'static,
) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register("revision", revision);
    handlers.register("generation", generation);
    handlers.register("human_review", review);
    handlers
}

pub async fn start_and_settle(engine: &Engine, workflow_type: &str, input: Value) -> WorkflowRun {
    let run = engine
        .start_run(workflow_type, "proj-1", payload(input), Some("http://hooks.test/run".into()))
        .await
        .expect("run should start");
    settle(engine, &run.id).await
}

pub async fn settle(engine: &Engine, run_id: &str) -> WorkflowRun {
    engine.join(run_id).await;
    engine.flush_notifications().await;
    engine
        .get_run(run_id)
        .await
        .expect("store readable")
        .expect("run exists")
}

/// Exactly one active step, everything before it done, everything after pending
pub fn assert_single_active_step(run: &WorkflowRun) {
    let active: Vec<usize> = run
        .steps
        .iter()
        .enumerate()
        .filter(|(_, s)| s.status.is_active())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(active.len(), 1, "expected one active step: {:?}", run.steps);

    let idx = active[0];
    assert!(run.steps[..idx].iter().all(|s| s.status.is_done()));
    assert!(run.steps[idx + 1..]
        .iter()
        .all(|s| s.status == StepStatus::Pending));
}

pub fn statuses(run: &WorkflowRun) -> Vec<StepStatus> {
    run.steps.iter().map(|s| s.status).collect()
}

pub fn create_test_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

pub fn write_definition(dir: &std::path::Path, filename: &str, content: &str) {
    std::fs::write(dir.join(filename), content).expect("Failed to write definition");
}

/// Two-step definition: `render` then `review`
pub fn simple_definition(workflow_type: &str) -> String {
    format!(
        r#"
workflowType: {}
steps:
  - name: Render
    stepType: generation
    handler: generation
  - name: Review
    stepType: human_review
    handler: human_review
    dependsOn: [generation]
"#,
        workflow_type
    )
}
