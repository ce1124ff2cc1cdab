use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, TaskError};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Task;

/// Lifecycle state of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    /// Wire name, e.g. `"processing"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    /// `Failed` and `Timeout` are terminal unless a retry moves the task back
    /// to `Pending`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// The edges of the task state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, Processing)
                | (Assigned, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Timeout)
                | (Failed, Pending)
                | (Timeout, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task together with its execution bookkeeping while it is owned by the
/// queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task: Task,
    pub status: TaskStatus,
    /// Dispatch count. Incremented once per assignment, never decremented.
    pub attempts: u32,
    pub assigned_worker_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Submission order, used as the FIFO tie-break within a priority level.
    pub seq: u64,
    pub cancel_requested: bool,
    pub last_error: Option<TaskError>,
}

impl QueuedTask {
    /// Fresh `Pending` entry with submission sequence `seq`.
    pub fn new(task: Task, seq: u64) -> Self {
        Self {
            task,
            status: TaskStatus::Pending,
            attempts: 0,
            assigned_worker_id: None,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            seq,
            cancel_requested: false,
            last_error: None,
        }
    }

    /// Move to `next`, rejecting edges the state machine does not allow.
    pub fn transition(&mut self, next: TaskStatus) -> ConductorResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ConductorError::InvalidTransition {
                task_id: self.task.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            TaskStatus::Processing => self.started_at = Some(Utc::now()),
            TaskStatus::Pending => {
                self.enqueued_at = Utc::now();
                self.assigned_worker_id = None;
            }
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// `Pending -> Assigned`, counting a new attempt. Returns the attempt number.
    pub fn assign(&mut self, worker_id: &str) -> ConductorResult<u32> {
        self.transition(TaskStatus::Assigned)?;
        self.attempts += 1;
        self.assigned_worker_id = Some(worker_id.to_string());
        Ok(self.attempts)
    }
}
