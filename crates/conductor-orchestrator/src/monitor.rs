use chrono::{DateTime, Utc};
use conductor_core::TaskError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Engine-side view of one worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: String,
    /// Attempts currently running on this worker.
    pub in_flight: u32,
    pub processed: u64,
    pub failed: u64,
    pub total_duration_ms: u64,
    pub healthy: bool,
    pub last_error: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl WorkerState {
    fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            healthy: true,
            ..Self::default()
        }
    }

    /// Mean attempt duration, 0 before the first finished attempt.
    pub fn average_duration_ms(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.processed as f64
        }
    }
}

/// Tracks health and per-worker execution metrics.
///
/// Workers unknown to the monitor are treated as healthy.
#[derive(Default)]
pub struct WorkerMonitor {
    states: RwLock<HashMap<String, WorkerState>>,
}

impl WorkerMonitor {
    /// Empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a worker as healthy. No-op if already tracked.
    pub fn track(&self, worker_id: &str) {
        self.states
            .write()
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerState::new(worker_id));
    }

    /// Stop tracking a worker.
    pub fn forget(&self, worker_id: &str) {
        self.states.write().remove(worker_id);
    }

    /// Mark an attempt as running on `worker_id`.
    pub fn start_task(&self, worker_id: &str) {
        let mut states = self.states.write();
        let state = states
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerState::new(worker_id));
        state.in_flight += 1;
    }

    /// Record the end of an attempt.
    pub fn finish_task(&self, worker_id: &str, duration: Duration, error: Option<&TaskError>) {
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(worker_id) {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.processed += 1;
            state.total_duration_ms += u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
            if let Some(err) = error {
                state.failed += 1;
                state.last_error = Some(err.to_string());
            }
        }
    }

    /// Record a health probe. Returns `true` when the worker recovered.
    pub fn set_health(&self, worker_id: &str, healthy: bool) -> bool {
        let mut states = self.states.write();
        match states.get_mut(worker_id) {
            Some(state) => {
                let recovered = healthy && !state.healthy;
                state.healthy = healthy;
                state.last_health_check = Some(Utc::now());
                recovered
            }
            None => false,
        }
    }

    /// Unknown workers count as healthy.
    pub fn is_healthy(&self, worker_id: &str) -> bool {
        self.states
            .read()
            .get(worker_id)
            .map_or(true, |s| s.healthy)
    }

    /// Copy of one worker's state.
    pub fn get_state(&self, worker_id: &str) -> Option<WorkerState> {
        self.states.read().get(worker_id).cloned()
    }

    /// All tracked workers, ordered by id.
    pub fn snapshot(&self) -> Vec<WorkerState> {
        let mut states: Vec<WorkerState> = self.states.read().values().cloned().collect();
        states.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        states
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_worker_is_healthy() {
        let monitor = WorkerMonitor::new();
        assert!(monitor.is_healthy("ghost"));
        assert!(monitor.get_state("ghost").is_none());
    }

    #[test]
    fn test_start_and_finish_task() {
        let monitor = WorkerMonitor::new();
        monitor.track("w1");
        monitor.start_task("w1");
        assert_eq!(monitor.get_state("w1").unwrap().in_flight, 1);

        monitor.finish_task("w1", Duration::from_millis(40), None);
        monitor.start_task("w1");
        monitor.finish_task(
            "w1",
            Duration::from_millis(60),
            Some(&TaskError::execution("boom")),
        );

        let state = monitor.get_state("w1").unwrap();
        assert_eq!(state.in_flight, 0);
        assert_eq!(state.processed, 2);
        assert_eq!(state.failed, 1);
        assert_eq!(state.total_duration_ms, 100);
        assert_eq!(state.average_duration_ms(), 50.0);
        assert_eq!(state.last_error.as_deref(), Some("EXECUTION: boom"));
    }

    #[test]
    fn test_health_transitions() {
        let monitor = WorkerMonitor::new();
        monitor.track("w1");
        assert!(!monitor.set_health("w1", true));
        assert!(!monitor.set_health("w1", false));
        assert!(!monitor.is_healthy("w1"));
        assert!(monitor.set_health("w1", true));
        assert!(monitor.is_healthy("w1"));
        assert!(monitor.get_state("w1").unwrap().last_health_check.is_some());
    }

    #[test]
    fn test_snapshot_sorted_and_forget() {
        let monitor = WorkerMonitor::new();
        monitor.track("b");
        monitor.track("a");
        let ids: Vec<String> = monitor.snapshot().into_iter().map(|s| s.worker_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        monitor.forget("a");
        assert_eq!(monitor.snapshot().len(), 1);
    }
}
