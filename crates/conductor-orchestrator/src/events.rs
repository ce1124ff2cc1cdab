use conductor_core::TaskError;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::trace;

use crate::step::StepResult;
use crate::types::{Priority, TaskId, TaskResult};

/// Everything observable about the engine.
///
/// Serialized with an `event` tag carrying the wire name (`"task:queued"`,
/// `"step:retrying"`, `"started"`...).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum OrchestratorEvent {
    #[serde(rename = "task:queued")]
    TaskQueued {
        task_id: TaskId,
        worker_type: String,
        priority: Priority,
    },
    #[serde(rename = "task:started")]
    TaskStarted {
        task_id: TaskId,
        worker_id: String,
        attempt: u32,
    },
    #[serde(rename = "task:completed")]
    TaskCompleted { task_id: TaskId, result: TaskResult },
    #[serde(rename = "task:failed")]
    TaskFailed { task_id: TaskId, result: TaskResult },
    #[serde(rename = "task:retrying")]
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        delay_ms: u64,
        error: TaskError,
    },
    #[serde(rename = "task:cancelled")]
    TaskCancelled { task_id: TaskId, result: TaskResult },
    #[serde(rename = "step:starting")]
    StepStarting { step_id: String, workflow_id: String },
    #[serde(rename = "step:completed")]
    StepCompleted {
        step_id: String,
        workflow_id: String,
        result: StepResult,
    },
    #[serde(rename = "step:failed")]
    StepFailed {
        step_id: String,
        workflow_id: String,
        result: StepResult,
    },
    #[serde(rename = "step:retrying")]
    StepRetrying {
        step_id: String,
        workflow_id: String,
        attempt: u32,
        delay_ms: u64,
        error: TaskError,
    },
    #[serde(rename = "step:skipped")]
    StepSkipped {
        step_id: String,
        workflow_id: String,
        reason: String,
    },
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "resumed")]
    Resumed,
    #[serde(rename = "error")]
    Error { message: String },
}

impl OrchestratorEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::TaskQueued { .. } => "task:queued",
            OrchestratorEvent::TaskStarted { .. } => "task:started",
            OrchestratorEvent::TaskCompleted { .. } => "task:completed",
            OrchestratorEvent::TaskFailed { .. } => "task:failed",
            OrchestratorEvent::TaskRetrying { .. } => "task:retrying",
            OrchestratorEvent::TaskCancelled { .. } => "task:cancelled",
            OrchestratorEvent::StepStarting { .. } => "step:starting",
            OrchestratorEvent::StepCompleted { .. } => "step:completed",
            OrchestratorEvent::StepFailed { .. } => "step:failed",
            OrchestratorEvent::StepRetrying { .. } => "step:retrying",
            OrchestratorEvent::StepSkipped { .. } => "step:skipped",
            OrchestratorEvent::Started => "started",
            OrchestratorEvent::Stopped => "stopped",
            OrchestratorEvent::Paused => "paused",
            OrchestratorEvent::Resumed => "resumed",
            OrchestratorEvent::Error { .. } => "error",
        }
    }

    /// Task the event is about, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            OrchestratorEvent::TaskQueued { task_id, .. }
            | OrchestratorEvent::TaskStarted { task_id, .. }
            | OrchestratorEvent::TaskCompleted { task_id, .. }
            | OrchestratorEvent::TaskFailed { task_id, .. }
            | OrchestratorEvent::TaskRetrying { task_id, .. }
            | OrchestratorEvent::TaskCancelled { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }

    /// Step the event is about, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            OrchestratorEvent::StepStarting { step_id, .. }
            | OrchestratorEvent::StepCompleted { step_id, .. }
            | OrchestratorEvent::StepFailed { step_id, .. }
            | OrchestratorEvent::StepRetrying { step_id, .. }
            | OrchestratorEvent::StepSkipped { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

/// Fire-and-forget fan-out of [`OrchestratorEvent`]s.
///
/// Emitting never blocks. Subscribers that fall behind by more than the
/// channel capacity miss events (`RecvError::Lagged`); nobody listening is fine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// Bus keeping up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`, silently skipping over lag gaps.
    pub fn stream(&self) -> impl Stream<Item = OrchestratorEvent> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(Result::ok)
    }

    /// Send to all subscribers. Having none is not an error.
    pub fn emit(&self, event: OrchestratorEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            trace!(event = name, "No event subscribers");
        }
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
