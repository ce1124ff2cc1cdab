use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::routing::RoutingStrategy;

/// Top-level orchestrator configuration, usually loaded from TOML.
///
/// ```toml
/// [dispatcher]
/// max_concurrent_tasks = 4
/// routing_strategy = "least_loaded"
///
/// [retry]
/// max_attempts = 5
/// initial_delay_ms = 200
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Task-level retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub steps: StepsConfig,
    #[serde(default)]
    pub goals: GoalsConfig,
    #[serde(default)]
    pub delegation: DelegationConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl OrchestratorConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(s: &str) -> ConductorResult<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| ConductorError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&s)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> ConductorResult<()> {
        let d = &self.dispatcher;
        if d.max_concurrent_tasks == 0 {
            return Err(ConductorError::Config(
                "dispatcher.max_concurrent_tasks must be > 0".into(),
            ));
        }
        if d.max_queue_size == 0 {
            return Err(ConductorError::Config(
                "dispatcher.max_queue_size must be > 0".into(),
            ));
        }
        if d.default_timeout_ms == 0 {
            return Err(ConductorError::Config(
                "dispatcher.default_timeout_ms must be > 0".into(),
            ));
        }
        if d.event_capacity == 0 {
            return Err(ConductorError::Config(
                "dispatcher.event_capacity must be > 0".into(),
            ));
        }
        self.retry.validate()?;
        if let Some(step_retry) = &self.steps.retry {
            step_retry.validate()?;
        }
        if self.steps.default_timeout_ms == 0 {
            return Err(ConductorError::Config(
                "steps.default_timeout_ms must be > 0".into(),
            ));
        }
        if self.goals.enable_decomposition && self.goals.planner_worker_type.trim().is_empty() {
            return Err(ConductorError::Config(
                "goals.planner_worker_type is required when decomposition is enabled".into(),
            ));
        }
        if self.checkpoint.events_stream.trim().is_empty()
            || self.checkpoint.snapshot_key.trim().is_empty()
        {
            return Err(ConductorError::Config(
                "checkpoint.events_stream and checkpoint.snapshot_key must not be empty".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// `[dispatcher]` section: queue bounds, concurrency, routing and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Terminal results kept for `status`/`result` lookups.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub routing_strategy: RoutingStrategy,
    /// Period of worker health probes; 0 disables them.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// How soon to look again when ready tasks have no eligible worker.
    #[serde(default = "default_idle_recheck_ms")]
    pub idle_recheck_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl DispatcherConfig {
    /// Timeout for tasks that set none.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// `None` when health probes are disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }

    /// Never zero.
    pub fn idle_recheck(&self) -> Duration {
        Duration::from_millis(self.idle_recheck_ms.max(1))
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            default_timeout_ms: default_timeout_ms(),
            history_limit: default_history_limit(),
            routing_strategy: RoutingStrategy::default(),
            health_check_interval_ms: default_health_check_interval_ms(),
            idle_recheck_ms: default_idle_recheck_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// `[steps]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepsConfig {
    /// Nested workflows deeper than this fail with `MAX_DEPTH_EXCEEDED`.
    #[serde(default = "default_max_execution_depth")]
    pub max_execution_depth: u32,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Step retry policy when a step does not carry its own. Falls back to
    /// the top-level `[retry]` section.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl StepsConfig {
    /// Timeout for steps that set none.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for StepsConfig {
    fn default() -> Self {
        Self {
            max_execution_depth: default_max_execution_depth(),
            default_timeout_ms: default_timeout_ms(),
            retry: None,
        }
    }
}

/// `[goals]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalsConfig {
    /// Route goals to a planner worker instead of executing them directly.
    #[serde(default)]
    pub enable_decomposition: bool,
    #[serde(default = "default_planner_worker_type")]
    pub planner_worker_type: String,
}

impl Default for GoalsConfig {
    fn default() -> Self {
        Self {
            enable_decomposition: false,
            planner_worker_type: default_planner_worker_type(),
        }
    }
}

/// `[delegation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: u32,
    #[serde(default = "default_max_children")]
    pub max_children_per_task: u32,
    /// Delegating parents whose children stay listed; oldest dropped first.
    #[serde(default = "default_history_limit")]
    pub lineage_limit: usize,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            max_delegation_depth: default_max_delegation_depth(),
            max_children_per_task: default_max_children(),
            lineage_limit: default_history_limit(),
        }
    }
}

/// `[checkpoint]` section: journal stream, snapshot key and auto-checkpoint period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Auto-checkpoint period; 0 disables the timer.
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(default = "default_events_stream")]
    pub events_stream: String,
    #[serde(default = "default_snapshot_key")]
    pub snapshot_key: String,
}

impl CheckpointConfig {
    /// `None` when auto-checkpointing is disabled.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: 0,
            events_stream: default_events_stream(),
            snapshot_key: default_snapshot_key(),
        }
    }
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_history_limit() -> usize {
    1000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_idle_recheck_ms() -> u64 {
    250
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_execution_depth() -> u32 {
    10
}

fn default_planner_worker_type() -> String {
    "planner".to_string()
}

fn default_max_delegation_depth() -> u32 {
    3
}

fn default_max_children() -> u32 {
    5
}

fn default_events_stream() -> String {
    "events".to_string()
}

fn default_snapshot_key() -> String {
    "queue".to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::retry::BackoffStrategy;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatcher.max_concurrent_tasks, 10);
        assert_eq!(config.dispatcher.max_queue_size, 1000);
        assert_eq!(config.dispatcher.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.steps.max_execution_depth, 10);
        assert_eq!(config.delegation.max_delegation_depth, 3);
        assert_eq!(config.delegation.max_children_per_task, 5);
        assert_eq!(config.delegation.lineage_limit, 1000);
        assert!(config.checkpoint.interval().is_none());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config.dispatcher.history_limit, 1000);
        assert_eq!(config.goals.planner_worker_type, "planner");
        assert_eq!(config.checkpoint.snapshot_key, "queue");
    }

    #[test]
    fn test_parse_full_toml() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [dispatcher]
            max_concurrent_tasks = 4
            routing_strategy = "capability_affinity"
            health_check_interval_ms = 0

            [retry]
            max_attempts = 5
            initial_delay_ms = 200
            max_delay_ms = 2000
            strategy = "linear"
            retryable_error_codes = ["EXECUTION", "RATE_LIMITED"]

            [steps]
            max_execution_depth = 4

            [steps.retry]
            max_attempts = 2
            initial_delay_ms = 10
            max_delay_ms = 10

            [goals]
            enable_decomposition = true

            [checkpoint]
            interval_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.dispatcher.max_concurrent_tasks, 4);
        assert_eq!(
            config.dispatcher.routing_strategy,
            RoutingStrategy::CapabilityAffinity
        );
        assert!(config.dispatcher.health_check_interval().is_none());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(config.retry.retryable_error_codes.as_ref().unwrap().len(), 2);
        assert_eq!(config.steps.retry.as_ref().unwrap().max_attempts, 2);
        assert!(config.goals.enable_decomposition);
        assert_eq!(config.checkpoint.interval(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_validation_errors() {
        for toml in [
            "[dispatcher]\nmax_concurrent_tasks = 0",
            "[dispatcher]\nmax_queue_size = 0",
            "[retry]\nmax_attempts = 0",
            "[retry]\ninitial_delay_ms = 500\nmax_delay_ms = 100",
            "[retry]\nbackoff_multiplier = 0.5",
            "[goals]\nenable_decomposition = true\nplanner_worker_type = \"\"",
        ] {
            let err = OrchestratorConfig::from_toml_str(toml).unwrap_err();
            assert!(matches!(err, ConductorError::Config(_)), "{toml}");
        }
    }

    #[test]
    fn test_malformed_toml() {
        let err = OrchestratorConfig::from_toml_str("[dispatcher\n").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        std::fs::write(&path, "[delegation]\nmax_children_per_task = 2\n").unwrap();
        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.delegation.max_children_per_task, 2);

        assert!(OrchestratorConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
