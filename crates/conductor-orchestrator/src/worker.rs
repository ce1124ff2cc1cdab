use async_trait::async_trait;
use conductor_core::TaskError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::types::Task;

/// Static identity a worker declares when it is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub id: String,
    pub worker_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl WorkerProfile {
    /// Profile with no capabilities.
    pub fn new(id: impl Into<String>, worker_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            worker_type: worker_type.into(),
            capabilities: Vec::new(),
        }
    }

    /// Replace the declared capabilities.
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Whether every capability in `required` is declared by this worker.
    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Self-reported worker metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    /// Current load in `0.0..=1.0`.
    pub load: f64,
    pub processed: u64,
    pub failed: u64,
}

/// Read-only snapshot of a worker used for routing decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub id: String,
    pub worker_type: String,
    pub capabilities: Vec<String>,
    pub load: f64,
    pub available: bool,
}

impl WorkerDescriptor {
    /// Snapshot `worker` for routing. Load is clamped to `0.0..=1.0`.
    pub fn of(worker: &dyn Worker) -> Self {
        let profile = worker.profile();
        Self {
            id: profile.id.clone(),
            worker_type: profile.worker_type.clone(),
            capabilities: profile.capabilities.clone(),
            load: worker.metrics().load.clamp(0.0, 1.0),
            available: worker.is_available(),
        }
    }
}

/// An executor of tasks of one type.
///
/// Only `profile` and `process_task` are required. The lifecycle hooks are
/// called by the registry when the orchestrator starts and stops.
#[async_trait]
pub trait Worker: Send + Sync {
    fn profile(&self) -> &WorkerProfile;

    /// Final say on whether this worker accepts `task`. Defaults to a type match.
    fn can_handle(&self, task: &Task) -> bool {
        task.worker_type == self.profile().worker_type
    }

    async fn process_task(&self, task: &Task) -> Result<serde_json::Value, TaskError>;

    fn metrics(&self) -> WorkerMetrics {
        WorkerMetrics::default()
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn initialize(&self) -> Result<(), TaskError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TaskError> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Run one attempt of `task` on `worker`, bounded by `timeout`.
///
/// The call runs on its own tokio task so a panicking worker surfaces as an
/// `EXECUTION` error. When the timeout fires the call is aborted and any late
/// response is dropped.
pub(crate) async fn invoke_with_timeout(
    worker: Arc<dyn Worker>,
    task: Task,
    timeout: Duration,
) -> Result<serde_json::Value, TaskError> {
    let mut handle = tokio::spawn(async move { worker.process_task(&task).await });
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_err)) => Err(TaskError::execution(format!(
            "worker invocation aborted: {join_err}"
        ))),
        Err(_) => {
            handle.abort();
            Err(TaskError::timeout(
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            ))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct SleepyWorker {
        profile: WorkerProfile,
        delay: Duration,
    }

    #[async_trait]
    impl Worker for SleepyWorker {
        fn profile(&self) -> &WorkerProfile {
            &self.profile
        }

        async fn process_task(&self, task: &Task) -> Result<serde_json::Value, TaskError> {
            tokio::time::sleep(self.delay).await;
            if task.payload["panic"] == true {
                panic!("worker blew up");
            }
            Ok(task.payload.clone())
        }
    }

    fn sleepy(delay_ms: u64) -> Arc<dyn Worker> {
        Arc::new(SleepyWorker {
            profile: WorkerProfile::new("w1", "echo").with_capabilities(vec!["a".into()]),
            delay: Duration::from_millis(delay_ms),
        })
    }

    #[test]
    fn test_defaults_and_descriptor() {
        let worker = sleepy(0);
        let task = Task::new("echo", serde_json::Value::Null);
        assert!(worker.can_handle(&task));
        assert!(!worker.can_handle(&Task::new("other", serde_json::Value::Null)));

        let desc = WorkerDescriptor::of(worker.as_ref());
        assert_eq!(desc.id, "w1");
        assert_eq!(desc.load, 0.0);
        assert!(desc.available);
    }

    #[test]
    fn test_profile_covers() {
        let profile = WorkerProfile::new("w", "t").with_capabilities(vec!["a".into(), "b".into()]);
        assert!(profile.covers(&[]));
        assert!(profile.covers(&["a".into(), "b".into()]));
        assert!(!profile.covers(&["c".into()]));
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let task = Task::new("echo", serde_json::json!({"x": 1}));
        let out = invoke_with_timeout(sleepy(1), task, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out["x"], 1);
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        let task = Task::new("echo", serde_json::Value::Null);
        let err = invoke_with_timeout(sleepy(5_000), task, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.retryable);
        assert_eq!(err.message, "operation timed out after 20ms");
    }

    #[tokio::test]
    async fn test_invoke_panic_becomes_execution_error() {
        let task = Task::new("echo", serde_json::json!({"panic": true}));
        let err = invoke_with_timeout(sleepy(0), task, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, conductor_core::ErrorCode::Execution);
    }
}
