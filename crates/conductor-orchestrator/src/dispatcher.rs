use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, TaskError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::events::{EventBus, OrchestratorEvent};
use crate::queue::{CancelOutcome, TaskQueue};
use crate::registry::WorkerRegistry;
use crate::retry::{should_retry, RetryPolicy};
use crate::routing::Router;
use crate::state::{QueuedTask, TaskStatus};
use crate::types::{duration_ms, ResultMetadata, Task, TaskId, TaskResult};
use crate::worker::{invoke_with_timeout, Worker, WorkerDescriptor};

/// Run state of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherStatus {
    /// Created but never started. Submissions are accepted and wait.
    Idle,
    Running,
    /// No new tasks are pulled; in-flight attempts finish normally.
    Paused,
    /// Submissions are rejected until the dispatcher is started again.
    Stopped,
}

/// Point-in-time dispatcher statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Tasks that reached `Completed`, `Failed` or `Timeout`.
    pub total_processed: u64,
    pub completed_tasks: u64,
    /// Includes timed out tasks.
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub retried_attempts: u64,
    /// Mean duration of every finished attempt.
    pub average_processing_time_ms: f64,
    #[serde(rename = "uptime_ms", with = "duration_ms")]
    pub uptime: Duration,
    pub status: DispatcherStatus,
}

/// Serializable copy of every non-terminal task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub taken_at: DateTime<Utc>,
    pub tasks: Vec<QueuedTask>,
}

#[derive(Default)]
struct Counters {
    completed: u64,
    failed: u64,
    cancelled: u64,
    retried: u64,
    finished_attempts: u64,
    attempt_time_ms: u64,
}

struct DispatchState {
    queue: TaskQueue,
    active: usize,
    counters: Counters,
    started_at: Option<Instant>,
    waiters: HashMap<TaskId, Vec<oneshot::Sender<TaskResult>>>,
}

struct Launch {
    task: Task,
    worker: Arc<dyn Worker>,
    attempt: u32,
}

struct DispatchPass {
    /// Ready tasks were skipped because no worker was eligible.
    blocked: bool,
    next_due: Option<Instant>,
}

struct Shared {
    config: DispatcherConfig,
    retry: RetryPolicy,
    registry: Arc<WorkerRegistry>,
    router: Router,
    events: EventBus,
    state: Mutex<DispatchState>,
    wake: Notify,
    status: watch::Sender<DispatcherStatus>,
}

/// Bounded priority queue plus the concurrency-limited loop that drains it.
///
/// All queue mutation happens under one mutex that is never held across an
/// `.await`. The loop sleeps until it is woken by a submission, a finished
/// attempt, a status change, the next retry due time or, only while ready
/// tasks have no eligible worker, a short idle re-check.
pub struct Dispatcher {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Idle dispatcher; nothing runs until [`Dispatcher::start`].
    pub fn new(
        config: DispatcherConfig,
        retry: RetryPolicy,
        registry: Arc<WorkerRegistry>,
        events: EventBus,
    ) -> Self {
        let (status, _) = watch::channel(DispatcherStatus::Idle);
        let state = DispatchState {
            queue: TaskQueue::new(config.max_queue_size, config.history_limit),
            active: 0,
            counters: Counters::default(),
            started_at: None,
            waiters: HashMap::new(),
        };
        Self {
            shared: Arc::new(Shared {
                router: Router::new(config.routing_strategy),
                config,
                retry,
                registry,
                events,
                state: Mutex::new(state),
                wake: Notify::new(),
                status,
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Current run state.
    pub fn status(&self) -> DispatcherStatus {
        *self.shared.status.borrow()
    }

    /// Registry the dispatcher routes over.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.shared.registry
    }

    /// Start (or restart) the dispatch loop and the health-check timer.
    ///
    /// Must be called from within a tokio runtime. Starting a paused
    /// dispatcher resumes it.
    pub fn start(&self) {
        let previous = self.shared.status.send_replace(DispatcherStatus::Running);
        if previous == DispatcherStatus::Running {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            if state.started_at.is_none() {
                state.started_at = Some(Instant::now());
            }
        }
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        if handles.is_empty() {
            handles.push(tokio::spawn(run_loop(Arc::clone(&self.shared))));
            if let Some(period) = self.shared.config.health_check_interval() {
                handles.push(tokio::spawn(health_loop(Arc::clone(&self.shared), period)));
            }
        }
        self.shared.wake.notify_one();
        info!(
            max_concurrent = self.shared.config.max_concurrent_tasks,
            strategy = ?self.shared.router.strategy(),
            "Dispatcher started"
        );
    }

    /// Stop pulling new tasks. Returns `false` unless the dispatcher was running.
    pub fn pause(&self) -> bool {
        let paused = self.shared.status.send_if_modified(|status| {
            if *status == DispatcherStatus::Running {
                *status = DispatcherStatus::Paused;
                true
            } else {
                false
            }
        });
        if paused {
            info!("Dispatcher paused");
        }
        paused
    }

    /// Returns `false` unless the dispatcher was paused.
    pub fn resume(&self) -> bool {
        let resumed = self.shared.status.send_if_modified(|status| {
            if *status == DispatcherStatus::Paused {
                *status = DispatcherStatus::Running;
                true
            } else {
                false
            }
        });
        if resumed {
            self.shared.wake.notify_one();
            info!("Dispatcher resumed");
        }
        resumed
    }

    /// Halt the loop and the health-check timer. Queued tasks are kept and
    /// in-flight attempts run to completion. Idempotent.
    pub async fn stop(&self) {
        let previous = self.shared.status.send_replace(DispatcherStatus::Stopped);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        if previous != DispatcherStatus::Stopped {
            info!("Dispatcher stopped");
        }
    }

    /// Wake the loop, e.g. after a worker was registered.
    pub fn notify(&self) {
        self.shared.wake.notify_one();
    }

    /// Queue one task. Fails when stopped, full, or the id is already known.
    pub fn submit(&self, task: Task) -> ConductorResult<TaskId> {
        self.ensure_accepting()?;
        validate_task(&task)?;
        let event = queued_event(&task);
        let id = self.shared.state.lock().queue.push(task)?;
        debug!(task_id = %id, "Task queued");
        self.shared.events.emit(event);
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Submit several tasks atomically: either all are queued or none.
    pub fn submit_all(&self, tasks: Vec<Task>) -> ConductorResult<Vec<TaskId>> {
        self.ensure_accepting()?;
        for task in &tasks {
            validate_task(task)?;
        }
        let events: Vec<OrchestratorEvent> = tasks.iter().map(queued_event).collect();
        let ids = {
            let mut state = self.shared.state.lock();
            if state.queue.remaining() < tasks.len() {
                return Err(ConductorError::QueueFull {
                    capacity: state.queue.capacity(),
                });
            }
            let mut seen = std::collections::HashSet::new();
            for task in &tasks {
                if state.queue.contains(task.id) || !seen.insert(task.id) {
                    return Err(ConductorError::DuplicateTask(task.id));
                }
            }
            let mut ids = Vec::with_capacity(tasks.len());
            for task in tasks {
                ids.push(state.queue.push(task)?);
            }
            ids
        };
        for event in events {
            self.shared.events.emit(event);
        }
        self.shared.wake.notify_one();
        Ok(ids)
    }

    /// Cancel a task that has not started processing.
    ///
    /// Returns `false` for a task that is processing (it is marked and will
    /// not be retried) or already finished.
    /// Ids whose results left the history are `TaskNotFound`.
    pub fn cancel(&self, id: TaskId) -> ConductorResult<bool> {
        let outcome = {
            let mut state = self.shared.state.lock();
            let outcome = state.queue.cancel(id);
            if let CancelOutcome::Cancelled(result) = &outcome {
                state.counters.cancelled += 1;
                if let Some(waiters) = state.waiters.remove(&id) {
                    for tx in waiters {
                        let _ = tx.send(result.clone());
                    }
                }
            }
            outcome
        };
        match outcome {
            CancelOutcome::Cancelled(result) => {
                info!(task_id = %id, "Task cancelled");
                self.shared.events.emit(OrchestratorEvent::TaskCancelled {
                    task_id: id,
                    result,
                });
                self.shared.wake.notify_one();
                Ok(true)
            }
            CancelOutcome::Requested => {
                info!(task_id = %id, "Cancellation requested for processing task");
                Ok(false)
            }
            CancelOutcome::AlreadyFinished => Ok(false),
            CancelOutcome::NotFound => Err(ConductorError::TaskNotFound(id)),
        }
    }

    /// `None` for unknown ids and results evicted from history.
    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.shared.state.lock().queue.status(id)
    }

    /// Terminal result, if the task finished and is still in history.
    pub fn result(&self, id: TaskId) -> Option<TaskResult> {
        self.shared.state.lock().queue.result(id).cloned()
    }

    /// The submitted task, queued or finished.
    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.shared.state.lock().queue.task(id).cloned()
    }

    /// Wait until the task reaches a terminal state.
    pub async fn await_result(&self, id: TaskId) -> ConductorResult<TaskResult> {
        let rx = {
            let mut state = self.shared.state.lock();
            if let Some(result) = state.queue.result(id) {
                return Ok(result.clone());
            }
            if state.queue.get(id).is_none() {
                return Err(ConductorError::TaskNotFound(id));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(id).or_default().push(tx);
            rx
        };
        rx.await.map_err(|_| {
            ConductorError::Lifecycle(format!("dispatcher dropped before task {id} finished"))
        })
    }

    /// Counters and gauges as of now.
    pub fn stats(&self) -> DispatcherStats {
        let status = self.status();
        let state = self.shared.state.lock();
        let c = &state.counters;
        DispatcherStats {
            total_processed: c.completed + c.failed,
            completed_tasks: c.completed,
            failed_tasks: c.failed,
            cancelled_tasks: c.cancelled,
            active_tasks: state.active,
            queued_tasks: state.queue.pending_count(),
            retried_attempts: c.retried,
            average_processing_time_ms: if c.finished_attempts == 0 {
                0.0
            } else {
                c.attempt_time_ms as f64 / c.finished_attempts as f64
            },
            uptime: state
                .started_at
                .map(|t| t.elapsed())
                .unwrap_or_default(),
            status,
        }
    }

    /// Copy of every non-terminal task, in submission order.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            taken_at: Utc::now(),
            tasks: self.shared.state.lock().queue.snapshot(),
        }
    }

    /// Probe worker health now. Wakes the loop if a worker recovered.
    pub async fn check_health(&self) -> bool {
        self.shared.check_health().await
    }

    fn ensure_accepting(&self) -> ConductorResult<()> {
        if self.status() == DispatcherStatus::Stopped {
            return Err(ConductorError::NotRunning("dispatcher is stopped".into()));
        }
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.status.send_replace(DispatcherStatus::Stopped);
        for handle in self.handles.get_mut().drain(..) {
            handle.abort();
        }
    }
}

fn validate_task(task: &Task) -> ConductorResult<()> {
    if task.worker_type.trim().is_empty() {
        return Err(ConductorError::InvalidArgument(format!(
            "task {} has an empty worker type",
            task.id
        )));
    }
    Ok(())
}

fn queued_event(task: &Task) -> OrchestratorEvent {
    OrchestratorEvent::TaskQueued {
        task_id: task.id,
        worker_type: task.worker_type.clone(),
        priority: task.priority,
    }
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

async fn run_loop(shared: Arc<Shared>) {
    let mut status_rx = shared.status.subscribe();
    loop {
        let status = *status_rx.borrow_and_update();
        match status {
            DispatcherStatus::Stopped => break,
            DispatcherStatus::Idle | DispatcherStatus::Paused => {
                if status_rx.changed().await.is_err() {
                    break;
                }
                continue;
            }
            DispatcherStatus::Running => {}
        }

        let pass = shared.dispatch_ready();
        let recheck = pass.blocked.then(|| shared.config.idle_recheck());

        tokio::select! {
            _ = shared.wake.notified() => {}
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = sleep_until_opt(pass.next_due) => {}
            _ = sleep_opt(recheck) => {}
        }
    }
    debug!("Dispatch loop exited");
}

async fn health_loop(shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        shared.check_health().await;
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

impl Shared {
    /// One pass over the ready set: assign as many tasks as capacity allows
    /// and spawn their executions.
    fn dispatch_ready(self: &Arc<Self>) -> DispatchPass {
        let mut launches = Vec::new();
        let mut blocked = false;
        let next_due = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.queue.promote_due(Instant::now());
            let mut capacity = self
                .config
                .max_concurrent_tasks
                .saturating_sub(state.active);
            // Assignments made in this pass have not started yet, so workers
            // cannot report them in their load.
            let mut assigned: HashMap<String, usize> = HashMap::new();
            let slot = 1.0 / self.config.max_concurrent_tasks.max(1) as f64;

            for id in state.queue.ready_ids() {
                if capacity == 0 {
                    break;
                }
                let Some(entry) = state.queue.get(id) else {
                    continue;
                };
                let candidates = self.registry.eligible(&entry.task);
                let descriptors: Vec<WorkerDescriptor> = candidates
                    .iter()
                    .map(|w| {
                        let mut descriptor = WorkerDescriptor::of(w.as_ref());
                        let pending = assigned.get(&descriptor.id).copied().unwrap_or(0);
                        descriptor.load += pending as f64 * slot;
                        descriptor
                    })
                    .collect();
                let chosen = self
                    .router
                    .select(
                        &entry.task.worker_type,
                        &entry.task.metadata.required_capabilities,
                        &descriptors,
                    )
                    .and_then(|i| candidates.get(i).cloned());
                let Some(worker) = chosen else {
                    blocked = true;
                    continue;
                };
                let task = entry.task.clone();
                match state.queue.assign(id, &worker.profile().id) {
                    Ok(attempt) => {
                        state.active += 1;
                        capacity -= 1;
                        *assigned.entry(worker.profile().id.clone()).or_default() += 1;
                        launches.push(Launch {
                            task,
                            worker,
                            attempt,
                        });
                    }
                    Err(e) => warn!(task_id = %id, error = %e, "Failed to assign task"),
                }
            }
            state.queue.next_due()
        };

        for launch in launches {
            tokio::spawn(Arc::clone(self).execute(launch));
        }
        DispatchPass { blocked, next_due }
    }

    async fn execute(self: Arc<Self>, launch: Launch) {
        let Launch {
            task,
            worker,
            attempt,
        } = launch;
        let task_id = task.id;
        let worker_id = worker.profile().id.clone();

        if !self.state.lock().queue.begin_processing(task_id) {
            {
                let mut state = self.state.lock();
                state.active = state.active.saturating_sub(1);
            }
            debug!(task_id = %task_id, "Task cancelled before processing");
            self.wake.notify_one();
            return;
        }

        let monitor = Arc::clone(self.registry.monitor());
        monitor.start_task(&worker_id);
        self.events.emit(OrchestratorEvent::TaskStarted {
            task_id,
            worker_id: worker_id.clone(),
            attempt,
        });
        info!(task_id = %task_id, worker = %worker_id, attempt, "Task started");

        let timeout = task
            .metadata
            .timeout
            .unwrap_or_else(|| self.config.default_timeout());
        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = invoke_with_timeout(worker, task.clone(), timeout).await;
        let elapsed = clock.elapsed();
        monitor.finish_task(&worker_id, elapsed, outcome.as_ref().err());

        let metadata = ResultMetadata {
            worker_id: Some(worker_id),
            started_at: Some(started_at),
            completed_at: Utc::now(),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            attempt,
        };
        self.record_outcome(&task, attempt, metadata, outcome);
        self.wake.notify_one();
    }

    fn policy_for(&self, task: &Task) -> RetryPolicy {
        let mut policy = self.retry.clone();
        if let Some(max) = task.metadata.max_attempts {
            policy.max_attempts = max.max(1);
        }
        policy
    }

    fn record_outcome(
        &self,
        task: &Task,
        attempt: u32,
        metadata: ResultMetadata,
        outcome: Result<serde_json::Value, TaskError>,
    ) {
        let task_id = task.id;
        let duration_ms = metadata.duration_ms;
        let event = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.active = state.active.saturating_sub(1);
            state.counters.finished_attempts += 1;
            state.counters.attempt_time_ms += duration_ms;

            let (event, terminal) = match outcome {
                Ok(data) => {
                    let result =
                        TaskResult::completed(task_id, data, attempt.saturating_sub(1), metadata);
                    state.counters.completed += 1;
                    info!(task_id = %task_id, attempt, duration_ms, "Task completed");
                    (
                        OrchestratorEvent::TaskCompleted {
                            task_id,
                            result: result.clone(),
                        },
                        Some(result),
                    )
                }
                Err(error) => {
                    let cancel_requested = state
                        .queue
                        .get(task_id)
                        .is_some_and(|q| q.cancel_requested);
                    let policy = self.policy_for(task);
                    if !cancel_requested && should_retry(&error, attempt, &policy) {
                        let delay = policy.next_delay(attempt);
                        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                        if let Err(e) = state.queue.schedule_retry(
                            task_id,
                            error.clone(),
                            Instant::now() + delay,
                        ) {
                            error!(task_id = %task_id, error = %e, "Failed to schedule retry");
                            return;
                        }
                        state.counters.retried += 1;
                        warn!(
                            task_id = %task_id,
                            attempt,
                            delay_ms,
                            error = %error,
                            "Task failed, retrying"
                        );
                        (
                            OrchestratorEvent::TaskRetrying {
                                task_id,
                                attempt,
                                delay_ms,
                                error,
                            },
                            None,
                        )
                    } else {
                        let status = if error.is_timeout() {
                            TaskStatus::Timeout
                        } else {
                            TaskStatus::Failed
                        };
                        warn!(task_id = %task_id, attempt, error = %error, "Task failed");
                        let result = TaskResult::failed(task_id, status, error, attempt, metadata);
                        state.counters.failed += 1;
                        (
                            OrchestratorEvent::TaskFailed {
                                task_id,
                                result: result.clone(),
                            },
                            Some(result),
                        )
                    }
                }
            };

            if let Some(result) = terminal {
                if let Err(e) = state.queue.finish(task_id, result.clone()) {
                    error!(task_id = %task_id, error = %e, "Failed to record task outcome");
                }
                if let Some(waiters) = state.waiters.remove(&task_id) {
                    for tx in waiters {
                        let _ = tx.send(result.clone());
                    }
                }
            }
            event
        };
        self.events.emit(event);
    }

    async fn check_health(&self) -> bool {
        let recovered = self.registry.check_health().await;
        if recovered {
            self.wake.notify_one();
        }
        recovered
    }
}
