use chrono::{DateTime, Utc};
use conductor_core::TaskError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::state::TaskStatus;

/// Identifier of a submitted task.
pub type TaskId = Uuid;

/// Dispatch priority. Higher variants are always pulled before lower ones.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
/// Scheduling priority. Higher values run first.
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Per-task overrides and lineage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Overrides the dispatcher's default timeout for every attempt.
    #[serde(
        default,
        rename = "timeout_ms",
        with = "option_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Overrides the retry policy's `max_attempts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_task_id: Option<TaskId>,
    /// Delegation depth (root tasks are 0).
    #[serde(default)]
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, serde_json::Value>,
}

/// A unit of work destined for a worker of a given type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub worker_type: String,
    pub priority: Priority,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Root task with a fresh id and `Normal` priority.
    pub fn new(worker_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_type: worker_type.into(),
            priority: Priority::Normal,
            payload,
            metadata: TaskMetadata::default(),
            created_at: Utc::now(),
        }
    }

    /// Use a caller-supplied id instead of a generated one.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Defaults to `Normal`.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.metadata.timeout = Some(timeout);
        self
    }

    /// Override the retry policy's attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.metadata.max_attempts = Some(max_attempts);
        self
    }

    /// Caller correlation id, inherited by children.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    /// Capabilities a worker must declare to be preferred.
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.metadata.required_capabilities = capabilities;
        self
    }

    /// Free-form metadata label.
    pub fn with_label(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.labels.insert(key.into(), value);
        self
    }
}

/// Timing and placement details attached to every [`TaskResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Worker that ran the final attempt (`None` if the task never ran).
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Number of the final attempt (1-based, 0 if never dispatched).
    pub attempt: u32,
}

impl ResultMetadata {
    fn unstarted(attempt: u32) -> Self {
        Self {
            worker_id: None,
            started_at: None,
            completed_at: Utc::now(),
            duration_ms: 0,
            attempt,
        }
    }
}

/// Terminal outcome of a task.
///
/// Exactly one of `data` and `error` is populated for completed and failed
/// results; use the constructors rather than building the struct by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Failed attempts that preceded this outcome, including the final one.
    pub retry_count: u32,
    pub metadata: ResultMetadata,
}

impl TaskResult {
    /// Successful result.
    pub fn completed(
        task_id: TaskId,
        data: serde_json::Value,
        retry_count: u32,
        metadata: ResultMetadata,
    ) -> Self {
        Self {
            task_id,
            success: true,
            status: TaskStatus::Completed,
            data: Some(data),
            error: None,
            retry_count,
            metadata,
        }
    }

    /// A terminal failure. `status` is `Failed` or `Timeout`.
    pub fn failed(
        task_id: TaskId,
        status: TaskStatus,
        error: TaskError,
        retry_count: u32,
        metadata: ResultMetadata,
    ) -> Self {
        Self {
            task_id,
            success: false,
            status,
            data: None,
            error: Some(error),
            retry_count,
            metadata,
        }
    }

    /// Result of a task cancelled before it ran.
    pub fn cancelled(task_id: TaskId, attempts: u32) -> Self {
        Self {
            task_id,
            success: false,
            status: TaskStatus::Cancelled,
            data: None,
            error: Some(TaskError::cancelled(format!("task {task_id} was cancelled"))),
            retry_count: attempts,
            metadata: ResultMetadata::unstarted(attempts),
        }
    }
}

/// Serde adapter for `Duration` fields stored as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Write as whole milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Read whole milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serde adapter for `Option<Duration>` fields stored as integer milliseconds.
pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Write as whole milliseconds, or null.
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    /// Read whole milliseconds, or null.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
