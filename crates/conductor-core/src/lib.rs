//! Core types and error definitions for the Conductor orchestration engine.
//!
//! This crate provides the foundational types shared across all Conductor crates:
//! the engine-level error enum and the value type used to describe a failed
//! unit of work.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for misuse and infrastructure failures.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`TaskError`] — A worker- or engine-reported failure of one execution attempt.
//! - [`ErrorCode`] — Classification of a [`TaskError`], used by retry policies.

/// Execution failure classification.
pub mod task_error;

pub use task_error::{ErrorCode, TaskError};

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Conductor engine.
///
/// Failures of submitted work are reported as data ([`TaskError`] inside a
/// result); this enum covers programmer errors and infrastructure faults that
/// are surfaced synchronously to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// The bounded queue already holds its maximum number of tasks.
    #[error("Queue full: capacity of {capacity} tasks reached")]
    QueueFull {
        /// Configured `max_queue_size`.
        capacity: usize,
    },

    /// A task with the same id is already known to the queue.
    #[error("Duplicate task id: {0}")]
    DuplicateTask(Uuid),

    /// No active or historical task matches the id.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// A task was asked to move along an edge the state machine does not allow.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// The task being transitioned.
        task_id: Uuid,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The component is not accepting work in its current lifecycle state.
    #[error("Not running: {0}")]
    NotRunning(String),

    /// A caller supplied an argument the engine cannot act on.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No registered worker can accept the requested unit of work.
    #[error("Routing error: {0}")]
    Routing(String),

    /// A startup dependency failed.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Sub-task delegation violated a lineage limit.
    #[error("Delegation error: {0}")]
    Delegation(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from a checkpoint log or snapshot store.
    #[error("Store error: {0}")]
    Store(String),

    /// A failure reported by a worker outside of the dispatch loop.
    #[error("Worker error: {0}")]
    Worker(#[from] TaskError),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_message() {
        let err = ConductorError::QueueFull { capacity: 10 };
        assert_eq!(err.to_string(), "Queue full: capacity of 10 tasks reached");
    }

    #[test]
    fn test_task_error_converts() {
        let err: ConductorError = TaskError::execution("boom").into();
        assert!(matches!(err, ConductorError::Worker(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_json_error_converts() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err: ConductorError = parse.unwrap_err().into();
        assert!(err.to_string().starts_with("JSON error"));
    }
}
