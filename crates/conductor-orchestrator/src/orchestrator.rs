use conductor_core::{ConductorError, ConductorResult};
use conductor_store::{CheckpointLog, SnapshotStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::delegation::{Delegator, SubtaskSpec};
use crate::dispatcher::{Dispatcher, DispatcherStats, QueueSnapshot};
use crate::events::{EventBus, OrchestratorEvent};
use crate::journal::EventJournal;
use crate::monitor::WorkerState;
use crate::registry::WorkerRegistry;
use crate::state::TaskStatus;
use crate::step::{
    StepExecutionContext, StepExecutor, StepExecutorConfig, StepHook, StepResult, WorkflowStep,
};
use crate::types::{Priority, Task, TaskId, TaskResult};
use crate::worker::Worker;

/// Facade lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Stopped,
    Running,
    Paused,
    /// A startup dependency failed. Call `start` again once it is fixed.
    Error,
}

/// Caller-facing description of a task. The worker type is resolved through
/// the registry when it is not given explicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub id: Option<TaskId>,
    #[serde(default)]
    pub worker_type: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default, rename = "timeout_ms", with = "crate::types::option_duration_ms")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl TaskRequest {
    /// Request for an explicit worker type.
    pub fn new(worker_type: impl Into<String>, payload: Value) -> Self {
        Self {
            worker_type: Some(worker_type.into()),
            payload,
            ..Self::default()
        }
    }

    /// A request routed to whichever worker type covers `capabilities`.
    pub fn for_capabilities(capabilities: Vec<String>, payload: Value) -> Self {
        Self {
            required_capabilities: capabilities,
            payload,
            ..Self::default()
        }
    }

    /// Use a caller-chosen id instead of a fresh one.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    /// Defaults to `Normal`.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Per-attempt timeout; defaults to the dispatcher's.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the retry policy's attempt limit for this task.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Propagated to delegated children.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    fn into_task(self, worker_type: String) -> Task {
        let mut task = Task::new(worker_type, self.payload)
            .with_priority(self.priority)
            .with_capabilities(self.required_capabilities);
        if let Some(id) = self.id {
            task = task.with_id(id);
        }
        task.metadata.timeout = self.timeout;
        task.metadata.max_attempts = self.max_attempts;
        task.metadata.correlation_id = self.correlation_id;
        task
    }
}

/// Options for [`Orchestrator::submit_goal`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoalOptions {
    #[serde(default)]
    pub priority: Priority,
    /// Passed to the worker alongside the goal.
    #[serde(default)]
    pub context: Value,
    /// Target for direct execution when decomposition is disabled.
    #[serde(default)]
    pub worker_type: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Facade-level statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub dispatcher: DispatcherStats,
    pub worker_count: usize,
    pub status: OrchestratorStatus,
    pub last_error: Option<String>,
}

struct Lifecycle {
    status: OrchestratorStatus,
    last_error: Option<String>,
}

#[derive(Default)]
struct Background {
    journal: Option<EventJournal>,
    checkpointer: Option<JoinHandle<()>>,
}

/// Entry point: owns the dispatcher, the worker registry, the step executor
/// and the event bus, plus the optional checkpoint log and snapshot store.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    steps: StepExecutor,
    events: EventBus,
    delegator: Delegator,
    checkpoint_log: Option<Arc<dyn CheckpointLog>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    lifecycle: parking_lot::Mutex<Lifecycle>,
    /// Serializes start/stop and owns their background tasks.
    background: tokio::sync::Mutex<Background>,
}

impl Orchestrator {
    /// Validate `config` and build a stopped orchestrator.
    pub fn new(config: OrchestratorConfig) -> ConductorResult<Self> {
        config.validate()?;
        let events = EventBus::new(config.dispatcher.event_capacity);
        let registry = Arc::new(WorkerRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatcher.clone(),
            config.retry.clone(),
            Arc::clone(&registry),
            events.clone(),
        ));
        let steps = StepExecutor::new(
            StepExecutorConfig::from_config(
                &config.steps,
                &config.retry,
                config.dispatcher.routing_strategy,
            ),
            Arc::clone(&registry),
            events.clone(),
        );
        Ok(Self {
            delegator: Delegator::from_config(&config.delegation),
            config,
            registry,
            dispatcher,
            steps,
            events,
            checkpoint_log: None,
            snapshots: None,
            lifecycle: parking_lot::Mutex::new(Lifecycle {
                status: OrchestratorStatus::Stopped,
                last_error: None,
            }),
            background: tokio::sync::Mutex::new(Background::default()),
        })
    }

    /// Journal every event to `log` while started.
    pub fn with_checkpoint_log(mut self, log: Arc<dyn CheckpointLog>) -> Self {
        self.checkpoint_log = Some(log);
        self
    }

    /// Store used by `checkpoint`, `restore_checkpoint` and the auto-checkpoint timer.
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Run `hook` around every step.
    pub fn with_step_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        self.steps.add_hook(hook);
        self
    }

    /// Validated configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Registered workers.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    /// Register a worker. While started, the worker is initialized first and
    /// rejected if that fails.
    pub async fn register_worker(&self, worker: Arc<dyn Worker>) -> ConductorResult<()> {
        if self.is_active() {
            let id = worker.profile().id.clone();
            worker.initialize().await.map_err(|e| {
                ConductorError::Lifecycle(format!("worker '{id}' failed to initialize: {e}"))
            })?;
        }
        self.registry.register(worker)?;
        self.dispatcher.notify();
        Ok(())
    }

    /// Remove a worker. Attempts already running on it finish normally.
    pub async fn unregister_worker(&self, worker_id: &str) -> bool {
        let Some(worker) = self.registry.unregister(worker_id) else {
            return false;
        };
        if self.is_active() {
            if let Err(e) = worker.shutdown().await {
                warn!(worker = %worker_id, error = %e, "Worker shutdown failed");
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start journaling, initialize workers and start dispatching.
    ///
    /// A failing startup dependency moves the orchestrator to
    /// [`OrchestratorStatus::Error`]; the error is returned, stored and
    /// emitted. Starting a paused orchestrator resumes it.
    pub async fn start(&self) -> ConductorResult<()> {
        let mut bg = self.background.lock().await;
        match self.status() {
            OrchestratorStatus::Running => return Ok(()),
            OrchestratorStatus::Paused => {
                self.resume();
                return Ok(());
            }
            OrchestratorStatus::Stopped | OrchestratorStatus::Error => {}
        }

        if let Err(e) = self.start_inner(&mut bg).await {
            let message = e.to_string();
            error!(error = %message, "Orchestrator failed to start");
            {
                let mut lc = self.lifecycle.lock();
                lc.status = OrchestratorStatus::Error;
                lc.last_error = Some(message.clone());
            }
            self.events.emit(OrchestratorEvent::Error { message });
            if let Some(journal) = bg.journal.take() {
                journal.shutdown().await;
            }
            return Err(e);
        }

        {
            let mut lc = self.lifecycle.lock();
            lc.status = OrchestratorStatus::Running;
            lc.last_error = None;
        }
        info!(workers = self.registry.len(), "Orchestrator started");
        self.events.emit(OrchestratorEvent::Started);
        Ok(())
    }

    async fn start_inner(&self, bg: &mut Background) -> ConductorResult<()> {
        if let Some(log) = &self.checkpoint_log {
            log.streams().await.map_err(|e| {
                ConductorError::Lifecycle(format!("checkpoint log unavailable: {e}"))
            })?;
            if bg.journal.is_none() {
                let journal = EventJournal::spawn(
                    &self.events,
                    Arc::clone(log),
                    self.config.checkpoint.events_stream.clone(),
                )
                .await
                .map_err(|e| {
                    ConductorError::Lifecycle(format!("failed to open event journal: {e}"))
                })?;
                bg.journal = Some(journal);
            }
        }

        self.registry.initialize_all().await?;
        self.dispatcher.start();

        if let (Some(period), Some(store)) = (self.config.checkpoint.interval(), &self.snapshots) {
            if bg.checkpointer.is_none() {
                bg.checkpointer = Some(tokio::spawn(auto_checkpoint(
                    Arc::clone(&self.dispatcher),
                    Arc::clone(store),
                    self.config.checkpoint.snapshot_key.clone(),
                    period,
                )));
            }
        }
        Ok(())
    }

    /// Stop pulling new tasks. Returns `false` unless running.
    pub fn pause(&self) -> bool {
        {
            let mut lc = self.lifecycle.lock();
            if lc.status != OrchestratorStatus::Running {
                return false;
            }
            lc.status = OrchestratorStatus::Paused;
        }
        self.dispatcher.pause();
        self.events.emit(OrchestratorEvent::Paused);
        info!("Orchestrator paused");
        true
    }

    /// Returns `false` unless paused.
    pub fn resume(&self) -> bool {
        {
            let mut lc = self.lifecycle.lock();
            if lc.status != OrchestratorStatus::Paused {
                return false;
            }
            lc.status = OrchestratorStatus::Running;
        }
        self.dispatcher.resume();
        self.events.emit(OrchestratorEvent::Resumed);
        info!("Orchestrator resumed");
        true
    }

    /// Halt dispatching and background timers, shut workers down and close the
    /// journal. Queued tasks are kept. Safe to call repeatedly and without a
    /// prior successful `start`.
    pub async fn stop(&self) {
        let mut bg = self.background.lock().await;
        let previous = {
            let mut lc = self.lifecycle.lock();
            std::mem::replace(&mut lc.status, OrchestratorStatus::Stopped)
        };

        if let Some(handle) = bg.checkpointer.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.dispatcher.stop().await;
        self.registry.shutdown_all().await;
        if previous != OrchestratorStatus::Stopped {
            info!("Orchestrator stopped");
            self.events.emit(OrchestratorEvent::Stopped);
        }
        if let Some(journal) = bg.journal.take() {
            let written = journal.shutdown().await;
            debug!(written, "Event journal closed");
        }
    }

    /// Stop and unregister every worker.
    pub async fn destroy(&self) {
        self.stop().await;
        for worker in self.registry.all() {
            self.registry.unregister(&worker.profile().id);
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> OrchestratorStatus {
        self.lifecycle.lock().status
    }

    /// Message of the failure that put the orchestrator in `Error`.
    pub fn last_error(&self) -> Option<String> {
        self.lifecycle.lock().last_error.clone()
    }

    fn is_active(&self) -> bool {
        matches!(
            self.status(),
            OrchestratorStatus::Running | OrchestratorStatus::Paused
        )
    }

    fn ensure_accepting(&self) -> ConductorResult<()> {
        match self.status() {
            OrchestratorStatus::Running | OrchestratorStatus::Paused => Ok(()),
            status => Err(ConductorError::NotRunning(format!(
                "orchestrator is {}",
                match status {
                    OrchestratorStatus::Error => "in error state",
                    _ => "stopped",
                }
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Resolve the worker type and queue the task.
    pub fn submit_task(&self, request: TaskRequest) -> ConductorResult<TaskId> {
        self.ensure_accepting()?;
        let worker_type = self.resolve_worker_type(
            request.worker_type.as_deref(),
            &request.required_capabilities,
        )?;
        self.dispatcher.submit(request.into_task(worker_type))
    }

    /// Submit a high-level goal.
    ///
    /// With decomposition enabled the goal becomes one planning task for the
    /// configured planner type. Otherwise it is executed directly by the worker
    /// type resolved from `options`.
    pub fn submit_goal(&self, goal: &str, options: GoalOptions) -> ConductorResult<TaskId> {
        self.ensure_accepting()?;
        if goal.trim().is_empty() {
            return Err(ConductorError::InvalidArgument("goal must not be empty".into()));
        }
        let goals = &self.config.goals;
        let (worker_type, payload) = if goals.enable_decomposition {
            (
                goals.planner_worker_type.clone(),
                json!({ "goal": goal, "decompose": true, "context": options.context }),
            )
        } else {
            (
                self.resolve_worker_type(
                    options.worker_type.as_deref(),
                    &options.required_capabilities,
                )?,
                json!({ "goal": goal, "context": options.context }),
            )
        };
        let mut task = Task::new(worker_type, payload)
            .with_priority(options.priority)
            .with_capabilities(options.required_capabilities);
        task.metadata.correlation_id = options.correlation_id;
        info!(
            task_id = %task.id,
            worker_type = %task.worker_type,
            decompose = goals.enable_decomposition,
            "Goal submitted"
        );
        self.dispatcher.submit(task)
    }

    /// Queue child tasks under `parent_id`. Either every child is queued or
    /// none is.
    pub fn delegate_tasks(
        &self,
        parent_id: TaskId,
        subtasks: Vec<SubtaskSpec>,
    ) -> ConductorResult<Vec<TaskId>> {
        self.ensure_accepting()?;
        let parent = self
            .dispatcher
            .task(parent_id)
            .ok_or(ConductorError::TaskNotFound(parent_id))?;
        let ids = self.delegator.delegate(
            &parent,
            subtasks,
            |worker_type, caps| self.registry.suggest_worker_type(worker_type, caps),
            |tasks| self.dispatcher.submit_all(tasks),
        )?;
        info!(parent = %parent_id, children = ids.len(), "Subtasks delegated");
        Ok(ids)
    }

    /// Direct children recorded by `delegate_tasks`.
    pub fn children_of(&self, parent_id: TaskId) -> Vec<TaskId> {
        self.delegator.children_of(parent_id)
    }

    fn resolve_worker_type(
        &self,
        worker_type: Option<&str>,
        capabilities: &[String],
    ) -> ConductorResult<String> {
        self.registry
            .suggest_worker_type(worker_type, capabilities)
            .ok_or_else(|| {
                if capabilities.is_empty() {
                    ConductorError::InvalidArgument(
                        "request needs a worker type or required capabilities".into(),
                    )
                } else {
                    ConductorError::Routing(format!(
                        "no registered worker covers capabilities {capabilities:?}"
                    ))
                }
            })
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// See [`Dispatcher::cancel`].
    pub fn cancel_task(&self, task_id: TaskId) -> ConductorResult<bool> {
        self.dispatcher.cancel(task_id)
    }

    /// `None` for unknown or evicted ids.
    pub fn task_status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.dispatcher.task_status(task_id)
    }

    /// Terminal result, while still in history.
    pub fn task_result(&self, task_id: TaskId) -> Option<TaskResult> {
        self.dispatcher.result(task_id)
    }

    /// Wait for the task to reach a terminal state.
    pub async fn await_result(&self, task_id: TaskId) -> ConductorResult<TaskResult> {
        self.dispatcher.await_result(task_id).await
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Run one workflow step synchronously against the registered workers.
    pub async fn execute_step(
        &self,
        step: &WorkflowStep,
        ctx: &StepExecutionContext,
    ) -> StepResult {
        self.steps.execute(step, ctx).await
    }

    /// Record a step as skipped.
    pub fn skip_step(
        &self,
        step: &WorkflowStep,
        ctx: &StepExecutionContext,
        reason: &str,
    ) -> StepResult {
        self.steps.skip(step, ctx, reason)
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Events as a `Stream`; lagged events are dropped.
    pub fn event_stream(&self) -> impl Stream<Item = OrchestratorEvent> {
        self.events.stream()
    }

    /// Lifecycle, dispatcher and worker counts.
    pub fn stats(&self) -> OrchestratorStats {
        let (status, last_error) = {
            let lc = self.lifecycle.lock();
            (lc.status, lc.last_error.clone())
        };
        OrchestratorStats {
            dispatcher: self.dispatcher.stats(),
            worker_count: self.registry.len(),
            status,
            last_error,
        }
    }

    /// Health and execution metrics per worker, ordered by id.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.registry.monitor().snapshot()
    }

    /// Probe every worker now. Returns `true` if one recovered.
    pub async fn check_worker_health(&self) -> bool {
        self.dispatcher.check_health().await
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Save a snapshot of every non-terminal task. Returns the task count.
    pub async fn checkpoint(&self) -> ConductorResult<usize> {
        let store = self.snapshot_store()?;
        save_snapshot(&self.dispatcher, store.as_ref(), &self.config.checkpoint.snapshot_key)
            .await
    }

    /// Resubmit tasks from the latest snapshot, skipping ids already known.
    ///
    /// Restored tasks start over as `Pending` with no attempts. Returns how
    /// many were queued.
    pub async fn restore_checkpoint(&self) -> ConductorResult<usize> {
        let store = self.snapshot_store()?;
        let key = &self.config.checkpoint.snapshot_key;
        let Some(value) = store.load(key).await? else {
            debug!(key = %key, "No checkpoint to restore");
            return Ok(0);
        };
        let snapshot: QueueSnapshot = serde_json::from_value(value)?;
        let mut restored = 0;
        for queued in snapshot.tasks {
            if self.dispatcher.task_status(queued.task.id).is_some() {
                continue;
            }
            self.dispatcher.submit(queued.task)?;
            restored += 1;
        }
        info!(key = %key, restored, taken_at = %snapshot.taken_at, "Checkpoint restored");
        Ok(restored)
    }

    fn snapshot_store(&self) -> ConductorResult<&Arc<dyn SnapshotStore>> {
        self.snapshots
            .as_ref()
            .ok_or_else(|| ConductorError::Store("no snapshot store attached".into()))
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(handle) = self.background.get_mut().checkpointer.take() {
            handle.abort();
        }
    }
}

async fn save_snapshot(
    dispatcher: &Dispatcher,
    store: &dyn SnapshotStore,
    key: &str,
) -> ConductorResult<usize> {
    let snapshot = dispatcher.snapshot();
    let count = snapshot.tasks.len();
    store.save(key, &serde_json::to_value(&snapshot)?).await?;
    debug!(key = %key, tasks = count, "Checkpoint saved");
    Ok(count)
}

async fn auto_checkpoint(
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn SnapshotStore>,
    key: String,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = save_snapshot(&dispatcher, store.as_ref(), &key).await {
            warn!(key = %key, error = %e, "Auto-checkpoint failed");
        }
    }
}
