//! Execution Driver - runs workflow steps and owns all run state transitions
//!
//! The engine:
//! 1. Materializes runs from catalog definitions
//! 2. Walks steps strictly in definition order, one at a time
//! 3. Retries failing handlers with linear backoff
//! 4. Pauses when a handler asks for human input, resumes on request
//! 5. Notifies webhooks and observers when a run changes visible state
//!
//! Every mutation is a read-modify-write of the whole run against the
//! [`RunStore`], done under a per-run lock that is never held across a
//! handler call or a backoff sleep. The driver re-reads the run after each
//! of those, which is what lets `cancel_run` take effect between steps.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::clock::{Clock, SystemClock};
use crate::engine::error::{EngineError, HandlerError};
use crate::engine::handler::{HandlerRegistry, StepHandler};
use crate::engine::notifier::{Notifier, RunEvent, RunObserver, WebhookNotifier};
use crate::engine::store::{FileRunStore, InMemoryRunStore, RunStore};
use crate::workflow::run::merge_payload;
use crate::workflow::*;

const STATE_STARTED: &str = "started";
const STATE_WAITING_HUMAN: &str = "waiting_human";
const STATE_RESUMED: &str = "resumed";
const STATE_RETRYING: &str = "retrying";
const STATE_RECOVERED: &str = "recovered";
const STATE_COMPLETED: &str = "completed";
const STATE_FAILED: &str = "failed";
const STATE_CANCELLED: &str = "cancelled";

fn data(value: Value) -> Option<Payload> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Append to the run log and mirror the entry to tracing
fn record(
    run: &mut WorkflowRun,
    now: DateTime<Utc>,
    level: LogLevel,
    message: impl Into<String>,
    extra: Option<Payload>,
) {
    let message = message.into();
    let step_id = run.current_step_id.as_deref().unwrap_or("-");
    match level {
        LogLevel::Debug => debug!(run_id = %run.id, step_id, "{}", message),
        LogLevel::Info => info!(run_id = %run.id, step_id, "{}", message),
        LogLevel::Warn => warn!(run_id = %run.id, step_id, "{}", message),
        LogLevel::Error => error!(run_id = %run.id, step_id, "{}", message),
    }
    run.log(now, level, message, extra);
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A step claimed for execution, captured before the run lock is released
struct Claim {
    index: usize,
    step_id: String,
    name: String,
    input: Payload,
    config: Option<Payload>,
    handler: Arc<dyn StepHandler>,
}

/// What the driver does after applying a step result
enum Next {
    Continue,
    Retry(std::time::Duration),
    Stop,
    Finish(RunEvent),
}

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// Exclusive access to one run; the map entry is dropped with its last user
struct RunLock {
    run_id: String,
    mutex: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(self.guard.take());

        // only the map and this handle left: nobody holds or waits for it
        if Arc::strong_count(&self.mutex) == 2
            && locks
                .get(&self.run_id)
                .is_some_and(|m| Arc::ptr_eq(m, &self.mutex))
        {
            locks.remove(&self.run_id);
        }
    }
}

struct EngineInner {
    catalog: WorkflowCatalog,
    handlers: HandlerRegistry,
    store: Arc<dyn RunStore>,
    notifier: Option<Arc<dyn Notifier>>,
    observers: Vec<Arc<dyn RunObserver>>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    locks: Arc<Mutex<LockMap>>,
    /// Live driver per run, tagged with a generation so a finished task
    /// never removes the handle of a driver spawned after it
    tasks: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
    next_task: AtomicU64,
    notifications: Mutex<Vec<JoinHandle<()>>>,
}

/// The workflow engine; cheap to clone, clones share all state
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Assembles an [`Engine`] from its collaborators
pub struct EngineBuilder {
    catalog: WorkflowCatalog,
    handlers: HandlerRegistry,
    store: Option<Arc<dyn RunStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    webhooks: bool,
    observers: Vec<Arc<dyn RunObserver>>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Built-in catalog, no handlers, in-memory store, real clock
    pub fn new() -> Self {
        Self {
            catalog: WorkflowCatalog::builtin(),
            handlers: HandlerRegistry::new(),
            store: None,
            notifier: None,
            webhooks: true,
            observers: Vec::new(),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn catalog(mut self, catalog: WorkflowCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn handler(mut self, name: impl Into<String>, handler: impl StepHandler + 'static) -> Self {
        self.handlers.register(name, handler);
        self
    }

    pub fn store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the default webhook notifier
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self.webhooks = true;
        self
    }

    /// Disable webhook delivery entirely
    pub fn without_notifier(mut self) -> Self {
        self.notifier = None;
        self.webhooks = false;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn build(self) -> Result<Engine, EngineError> {
        if self.config.max_retries == 0 {
            return Err(EngineError::Config("max_retries must be at least 1".into()));
        }

        let store: Arc<dyn RunStore> = match self.store {
            Some(store) => store,
            None => match &self.config.store {
                StoreConfig::Memory => Arc::new(InMemoryRunStore::new()),
                StoreConfig::File { dir } => Arc::new(FileRunStore::open(dir.clone()).await?),
            },
        };

        let notifier: Option<Arc<dyn Notifier>> = match (self.notifier, self.webhooks) {
            (Some(n), _) => Some(n),
            (None, true) => Some(Arc::new(
                WebhookNotifier::new(&self.config.webhook)
                    .map_err(|e| EngineError::Config(e.to_string()))?,
            )),
            (None, false) => None,
        };

        Ok(Engine {
            inner: Arc::new(EngineInner {
                catalog: self.catalog,
                handlers: self.handlers,
                store,
                notifier,
                observers: self.observers,
                clock: self.clock,
                config: self.config,
                locks: Arc::new(Mutex::new(HashMap::new())),
                tasks: Mutex::new(HashMap::new()),
                next_task: AtomicU64::new(0),
                notifications: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.inner.catalog
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.handlers
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn RunStore> {
        Arc::clone(&self.inner.store)
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    async fn lock_run(&self, run_id: &str) -> RunLock {
        let mutex = {
            let mut locks = self.inner.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(run_id.to_string()).or_default())
        };
        let guard = Arc::clone(&mutex).lock_owned().await;
        RunLock {
            run_id: run_id.to_string(),
            mutex,
            guard: Some(guard),
            locks: Arc::clone(&self.inner.locks),
        }
    }

    async fn load(&self, run_id: &str) -> Result<WorkflowRun, EngineError> {
        self.inner
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    async fn save(&self, run: &WorkflowRun) -> Result<(), EngineError> {
        self.inner.store.put(run).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Create a run and start driving it in the background
    ///
    /// Returns as soon as the run is persisted; poll `get_run`, use `join`,
    /// or rely on the webhook to learn how it ends.
    #[instrument(skip(self, initial_input, webhook_url))]
    pub async fn start_run(
        &self,
        workflow_type: &str,
        project_id: &str,
        initial_input: Payload,
        webhook_url: Option<String>,
    ) -> Result<WorkflowRun, EngineError> {
        let definition = self
            .inner
            .catalog
            .lookup(workflow_type)
            .map_err(|_| EngineError::UnknownWorkflowType(workflow_type.to_string()))?;

        let mut steps: Vec<WorkflowStep> = definition
            .steps
            .iter()
            .map(|bp| WorkflowStep::from_blueprint(bp, self.inner.config.max_retries))
            .collect();
        if let Some(first) = steps.first_mut() {
            first.input = initial_input;
        }

        let mut run = WorkflowRun {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            workflow_type: workflow_type.to_string(),
            current_step_id: steps.first().map(|s| s.id.clone()),
            steps,
            current_state: STATE_STARTED.to_string(),
            status: RunStatus::Running,
            logs: Vec::new(),
            webhook_url,
            started_at: self.now(),
            completed_at: None,
        };

        record(
            &mut run,
            self.now(),
            LogLevel::Info,
            "Workflow started",
            data(json!({ "workflowType": workflow_type, "projectId": project_id })),
        );
        self.save(&run).await?;

        self.spawn_driver(&run.id);
        Ok(run)
    }

    /// Complete the paused step with `step_output` and continue the run
    #[instrument(skip(self, step_output))]
    pub async fn resume_run(
        &self,
        run_id: &str,
        step_output: Payload,
    ) -> Result<WorkflowRun, EngineError> {
        let run = {
            let _guard = self.lock_run(run_id).await;
            let mut run = self.load(run_id).await?;

            if run.is_terminal() {
                return Err(EngineError::InvalidRunState {
                    run_id: run.id.clone(),
                    status: run.status,
                    message: "cannot resume a finished run".into(),
                });
            }
            let index = run
                .waiting_step_index()
                .ok_or_else(|| EngineError::NoWaitingStep(run_id.to_string()))?;

            let now = self.now();
            let step = &mut run.steps[index];
            let mut output = step.output.take().unwrap_or_default();
            merge_payload(&mut output, &step_output);
            step.output = Some(output);
            step.status = StepStatus::Completed;
            step.completed_at = Some(now);
            let step_id = step.id.clone();

            run.pass_output_forward(index);
            run.status = RunStatus::Running;
            run.current_step_id = Some(step_id.clone());
            run.current_state = STATE_RESUMED.to_string();
            record(
                &mut run,
                now,
                LogLevel::Info,
                "Workflow resumed",
                data(json!({ "stepId": step_id })),
            );
            self.save(&run).await?;
            run
        };

        self.spawn_driver(run_id);
        Ok(run)
    }

    /// Re-queue a failed step and continue the run from it
    #[instrument(skip(self))]
    pub async fn retry_step(&self, run_id: &str, step_id: &str) -> Result<WorkflowRun, EngineError> {
        let run = {
            let _guard = self.lock_run(run_id).await;
            let mut run = self.load(run_id).await?;

            let index = run.step_index(step_id).ok_or_else(|| EngineError::StepNotFound {
                run_id: run_id.to_string(),
                step_id: step_id.to_string(),
            })?;
            let status = run.steps[index].status;
            if status != StepStatus::Failed {
                return Err(EngineError::InvalidStepState {
                    step_id: step_id.to_string(),
                    status,
                });
            }
            if run.status == RunStatus::Cancelled {
                return Err(EngineError::InvalidRunState {
                    run_id: run.id.clone(),
                    status: run.status,
                    message: "cannot retry a step of a cancelled run".into(),
                });
            }

            let step = &mut run.steps[index];
            step.status = StepStatus::Pending;
            step.error = None;
            if self.inner.config.reset_retries_on_manual_retry {
                step.retries = 0;
            }

            run.status = RunStatus::Running;
            run.completed_at = None;
            run.current_step_id = Some(step_id.to_string());
            run.current_state = STATE_RETRYING.to_string();
            record(
                &mut run,
                self.now(),
                LogLevel::Info,
                "Retrying step",
                data(json!({ "stepId": step_id })),
            );
            self.save(&run).await?;
            run
        };

        self.spawn_driver(run_id);
        Ok(run)
    }

    /// Stop a run; a handler already executing is left to finish
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: &str) -> Result<WorkflowRun, EngineError> {
        let run = {
            let _guard = self.lock_run(run_id).await;
            let mut run = self.load(run_id).await?;

            if run.is_terminal() {
                return Err(EngineError::InvalidRunState {
                    run_id: run.id.clone(),
                    status: run.status,
                    message: "only running or paused runs can be cancelled".into(),
                });
            }

            let now = self.now();
            run.status = RunStatus::Cancelled;
            run.completed_at = Some(now);
            run.current_state = STATE_CANCELLED.to_string();
            record(&mut run, now, LogLevel::Info, "Workflow cancelled", None);
            self.save(&run).await?;
            run
        };

        self.finish(RunEvent::Cancelled(run));

        if self.inner.config.compensation.on_cancel {
            self.compensate(run_id).await?;
        }
        self.load(run_id).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, EngineError> {
        Ok(self.inner.store.get(run_id).await?)
    }

    pub async fn list_runs(&self, project_id: &str) -> Result<Vec<WorkflowRun>, EngineError> {
        Ok(self.inner.store.list_by_project(project_id).await?)
    }

    pub async fn run_logs(&self, run_id: &str) -> Result<Vec<WorkflowLog>, EngineError> {
        Ok(self.load(run_id).await?.logs)
    }

    /// Wait for this process's driver task for `run_id`, if any
    pub async fn join(&self, run_id: &str) {
        loop {
            let handle = {
                let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
                tasks.remove(run_id).map(|(_, handle)| handle)
            };
            let Some(handle) = handle else { break };
            if let Err(e) = handle.await {
                error!(run_id, error = %e, "Driver task aborted");
            }
        }
    }

    /// Wait for webhook deliveries dispatched so far
    ///
    /// Notifications are sent in the background; call this before the
    /// process exits if they should not be lost.
    pub async fn flush_notifications(&self) {
        loop {
            let pending = {
                let mut pending = self
                    .inner
                    .notifications
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *pending)
            };
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Notification task aborted");
                }
            }
        }
    }

    fn has_live_driver(&self, run_id: &str) -> bool {
        let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .get(run_id)
            .map(|(_, h)| !h.is_finished())
            .unwrap_or(false)
    }

    /// Re-drive runs persisted as `running` that no task in this process owns
    ///
    /// A step left `running` by a crashed driver is put back to `pending`,
    /// so its handler will be invoked again.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<String>, EngineError> {
        let mut recovered = Vec::new();

        for candidate in self.inner.store.list_by_status(RunStatus::Running).await? {
            if self.has_live_driver(&candidate.id) {
                continue;
            }

            {
                let _guard = self.lock_run(&candidate.id).await;
                let mut run = self.load(&candidate.id).await?;
                if run.status != RunStatus::Running {
                    continue;
                }

                let now = self.now();
                let interrupted = run
                    .steps
                    .iter()
                    .position(|s| s.status == StepStatus::Running);
                if let Some(index) = interrupted {
                    run.steps[index].status = StepStatus::Pending;
                    run.current_step_id = Some(run.steps[index].id.clone());
                    let name = run.steps[index].name.clone();
                    record(
                        &mut run,
                        now,
                        LogLevel::Warn,
                        format!("Step interrupted, re-queued: {}", name),
                        None,
                    );
                }
                run.current_state = STATE_RECOVERED.to_string();
                record(&mut run, now, LogLevel::Info, "Workflow recovered", None);
                self.save(&run).await?;
            }

            self.spawn_driver(&candidate.id);
            recovered.push(candidate.id);
        }

        Ok(recovered)
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    fn spawn_driver(&self, run_id: &str) {
        let generation = self.inner.next_task.fetch_add(1, Ordering::Relaxed);
        let engine = self.clone();
        let id = run_id.to_string();

        // held across the spawn so the task cannot deregister before it is registered
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            engine.advance(&id).await;
            engine.release_driver(&id, generation);
        });
        tasks.insert(run_id.to_string(), (generation, handle));
    }

    fn release_driver(&self, run_id: &str, generation: u64) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.get(run_id).is_some_and(|(g, _)| *g == generation) {
            tasks.remove(run_id);
        }
    }

    /// Drive a run until it completes, fails, pauses or is cancelled
    ///
    /// Reads everything it needs from the store, so it can be called again
    /// for any persisted run. Errors never escape: store failures are logged.
    #[instrument(skip(self))]
    pub async fn advance(&self, run_id: &str) {
        if let Err(e) = self.drive(run_id).await {
            error!(run_id, error = %e, "Driver stopped");
        }
    }

    async fn drive(&self, run_id: &str) -> Result<(), EngineError> {
        loop {
            let claim = match self.claim_next_step(run_id).await? {
                Ok(claim) => claim,
                Err(Next::Finish(event)) => {
                    self.finish(event);
                    return Ok(());
                }
                Err(_) => return Ok(()),
            };

            let result = AssertUnwindSafe(claim.handler.execute(&claim.input, claim.config.as_ref()))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic))));

            match self.apply_result(run_id, &claim, result).await? {
                Next::Continue => {}
                Next::Retry(delay) => self.inner.clock.sleep(delay).await,
                Next::Stop => return Ok(()),
                Next::Finish(event) => {
                    let failed = matches!(event, RunEvent::Failed(_));
                    self.finish(event);
                    if failed && self.inner.config.compensation.on_failure {
                        self.compensate(run_id).await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Pick the next step and mark it running, or decide the run is done
    async fn claim_next_step(&self, run_id: &str) -> Result<Result<Claim, Next>, EngineError> {
        let _guard = self.lock_run(run_id).await;
        let mut run = self.load(run_id).await?;

        if run.status != RunStatus::Running {
            debug!(run_id, status = %run.status, "Run not running, driver stops");
            return Ok(Err(Next::Stop));
        }

        let now = self.now();

        let Some(index) = run.next_open_step() else {
            run.status = RunStatus::Completed;
            run.completed_at = Some(now);
            run.current_state = STATE_COMPLETED.to_string();
            record(&mut run, now, LogLevel::Info, "Workflow completed", None);
            self.save(&run).await?;
            return Ok(Err(Next::Finish(RunEvent::Completed(run))));
        };

        match run.steps[index].status {
            StepStatus::WaitingHuman => {
                run.status = RunStatus::WaitingHuman;
                run.current_state = STATE_WAITING_HUMAN.to_string();
                self.save(&run).await?;
                return Ok(Err(Next::Finish(RunEvent::WaitingHuman(run))));
            }
            StepStatus::Running => {
                // another driver owns this step
                debug!(run_id, step = %run.steps[index].name, "Step already running");
                return Ok(Err(Next::Stop));
            }
            StepStatus::Failed => {
                run.status = RunStatus::Failed;
                run.current_state = STATE_FAILED.to_string();
                self.save(&run).await?;
                return Ok(Err(Next::Finish(RunEvent::Failed(run))));
            }
            StepStatus::Pending | StepStatus::Completed | StepStatus::Skipped => {}
        }

        run.current_step_id = Some(run.steps[index].id.clone());

        let blueprint = self
            .inner
            .catalog
            .lookup(&run.workflow_type)
            .ok()
            .and_then(|def| def.steps.get(index).cloned());
        let resolved = match &blueprint {
            Some(bp) => self
                .inner
                .handlers
                .resolve(&bp.handler_name)
                .map_err(|e| e.to_string()),
            None => Err(format!(
                "No definition for step {} of workflow type {}",
                index, run.workflow_type
            )),
        };

        let handler = match resolved {
            Ok(handler) => handler,
            Err(message) => {
                let step = &mut run.steps[index];
                step.status = StepStatus::Failed;
                step.error = Some(message.clone());
                let step_id = step.id.clone();
                run.status = RunStatus::Failed;
                run.current_state = STATE_FAILED.to_string();
                record(
                    &mut run,
                    now,
                    LogLevel::Error,
                    message,
                    data(json!({ "stepId": step_id })),
                );
                self.save(&run).await?;
                return Ok(Err(Next::Finish(RunEvent::Failed(run))));
            }
        };
        let config = blueprint.and_then(|bp| bp.config);

        let step = &mut run.steps[index];
        step.status = StepStatus::Running;
        step.started_at = Some(now);
        let claim = Claim {
            index,
            step_id: step.id.clone(),
            name: step.name.clone(),
            input: step.input.clone(),
            config,
            handler,
        };
        run.current_state = step.step_type.clone();
        record(
            &mut run,
            now,
            LogLevel::Info,
            format!("Starting step: {}", claim.name),
            data(json!({ "stepId": claim.step_id })),
        );
        self.save(&run).await?;

        Ok(Ok(claim))
    }

    /// Record a handler outcome on the claimed step and pick what comes next
    async fn apply_result(
        &self,
        run_id: &str,
        claim: &Claim,
        result: Result<Payload, HandlerError>,
    ) -> Result<Next, EngineError> {
        let _guard = self.lock_run(run_id).await;
        let mut run = self.load(run_id).await?;
        let now = self.now();

        let index = match run.step_index(&claim.step_id) {
            Some(index) if index == claim.index => index,
            _ => {
                warn!(run_id, step_id = %claim.step_id, "Claimed step vanished from run");
                return Ok(Next::Stop);
            }
        };
        run.current_step_id = Some(claim.step_id.clone());
        let cancelled = run.status == RunStatus::Cancelled;

        match result {
            Ok(output) => {
                let pause = WorkflowStep::requires_action(&output);
                let step = &mut run.steps[index];
                step.output = Some(output);
                step.status = if pause {
                    StepStatus::WaitingHuman
                } else {
                    StepStatus::Completed
                };
                step.completed_at = Some(now);
                step.duration_ms = step
                    .started_at
                    .map(|s| (now - s).num_milliseconds().max(0) as u64);
                let duration_ms = step.duration_ms;

                record(
                    &mut run,
                    now,
                    LogLevel::Info,
                    format!("Completed step: {}", claim.name),
                    data(json!({ "stepId": claim.step_id, "durationMs": duration_ms })),
                );
                run.pass_output_forward(index);

                if cancelled {
                    self.save(&run).await?;
                    return Ok(Next::Stop);
                }
                if pause {
                    run.status = RunStatus::WaitingHuman;
                    run.current_state = STATE_WAITING_HUMAN.to_string();
                    self.save(&run).await?;
                    return Ok(Next::Finish(RunEvent::WaitingHuman(run)));
                }
                self.save(&run).await?;
                Ok(Next::Continue)
            }
            Err(err) => {
                let step = &mut run.steps[index];
                step.retries = step.retries.saturating_add(1).min(step.max_retries);
                step.error = Some(err.to_string());
                let retries = step.retries;
                let exhausted = retries >= step.max_retries;
                step.status = if exhausted {
                    StepStatus::Failed
                } else {
                    StepStatus::Pending
                };

                record(
                    &mut run,
                    now,
                    LogLevel::Error,
                    format!("Step failed: {}", claim.name),
                    data(json!({
                        "stepId": claim.step_id,
                        "error": err.to_string(),
                        "retries": retries,
                    })),
                );

                if cancelled {
                    self.save(&run).await?;
                    return Ok(Next::Stop);
                }
                if exhausted {
                    run.status = RunStatus::Failed;
                    run.current_state = STATE_FAILED.to_string();
                    self.save(&run).await?;
                    return Ok(Next::Finish(RunEvent::Failed(run)));
                }
                self.save(&run).await?;
                Ok(Next::Retry(self.inner.config.backoff_for(retries)))
            }
        }
    }

    /// Tell observers and the webhook about a visible state change
    ///
    /// Webhook delivery runs on its own task; callers never wait for it.
    fn finish(&self, event: RunEvent) {
        info!(run_id = %event.run().id, event = event.name(), "Run event");
        for observer in &self.inner.observers {
            observer.on_event(&event);
        }

        let run = event.run();
        if run.webhook_url.is_none() {
            return;
        }
        let Some(notifier) = self.inner.notifier.clone() else {
            return;
        };
        let run = run.clone();
        let handle = tokio::spawn(async move { notifier.notify(&run).await });

        let mut pending = self
            .inner
            .notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Roll back completed steps in reverse order
    ///
    /// Rollback failures are logged on the run and otherwise ignored.
    #[instrument(skip(self))]
    async fn compensate(&self, run_id: &str) -> Result<(), EngineError> {
        let snapshot = self.load(run_id).await?;
        let definition = match self.inner.catalog.lookup(&snapshot.workflow_type) {
            Ok(def) => def,
            Err(_) => return Ok(()),
        };

        let mut entries = Vec::new();
        for (index, step) in snapshot.steps.iter().enumerate().rev() {
            if step.status != StepStatus::Completed {
                continue;
            }
            let Some(handler) = definition
                .steps
                .get(index)
                .and_then(|bp| self.inner.handlers.resolve(&bp.handler_name).ok())
            else {
                continue;
            };
            if !handler.supports_rollback() {
                continue;
            }

            let outcome = AssertUnwindSafe(handler.rollback(&step.input))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic))));
            let entry = match outcome {
                Ok(()) => (
                    LogLevel::Info,
                    format!("Rolled back step: {}", step.name),
                    None,
                ),
                Err(e) => (
                    LogLevel::Warn,
                    format!("Rollback failed: {}", step.name),
                    data(json!({ "error": e.to_string() })),
                ),
            };
            entries.push((step.id.clone(), entry));
        }

        if entries.is_empty() {
            return Ok(());
        }

        let _guard = self.lock_run(run_id).await;
        let mut run = self.load(run_id).await?;
        for (step_id, (level, message, extra)) in entries {
            run.current_step_id = Some(step_id);
            record(&mut run, self.now(), level, message, extra);
        }
        self.save(&run).await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workflow_types", &self.inner.catalog.workflow_types())
            .field("handlers", &self.inner.handlers)
            .field("config", &self.inner.config)
            .finish()
    }
}
