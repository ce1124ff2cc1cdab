//! Retry decisions and backoff delays.
//!
//! Everything here is pure: the dispatcher and the step executor decide *when*
//! to sleep, this module only computes *how long* and *whether* to try again.

use conductor_core::{ConductorError, ConductorResult, ErrorCode, TaskError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::duration_ms;

/// Fraction of the computed delay used as uniform jitter in either direction.
pub const JITTER_RATIO: f64 = 0.1;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Always `initial_delay`.
    Fixed,
    /// `initial_delay * attempt`.
    Linear,
    /// `initial_delay * multiplier^(attempt - 1)`.
    #[default]
    Exponential,
}

/// Retry configuration shared by task-level and step-level execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub strategy: BackoffStrategy,
    /// When set, only these codes are retried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable_error_codes: Option<Vec<ErrorCode>>,
    /// Opt in to retrying task-level timeouts.
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            strategy: BackoffStrategy::Exponential,
            retryable_error_codes: None,
            retry_on_timeout: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Total attempts including the first.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before the first retry and the ceiling for later ones.
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Shape of the delay curve.
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Growth factor for exponential backoff.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Codes that may be retried.
    pub fn with_retryable_codes(mut self, codes: Vec<ErrorCode>) -> Self {
        self.retryable_error_codes = Some(codes);
        self
    }

    /// Whether `TIMEOUT` failures are retried.
    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// Reject zero attempts, inverted delays and a multiplier below 1.0.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.max_attempts == 0 {
            return Err(ConductorError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConductorError::Config(format!(
                "retry.max_delay_ms ({}) must be >= initial_delay_ms ({})",
                self.max_delay.as_millis(),
                self.initial_delay.as_millis()
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConductorError::Config(format!(
                "retry.backoff_multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Delay before the retry that follows attempt number `attempt`, using the
    /// policy's own strategy.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self, self.strategy)
    }
}

/// The capped delay for `attempt` (1-based) before jitter is applied.
pub fn base_delay(attempt: u32, policy: &RetryPolicy, strategy: BackoffStrategy) -> Duration {
    let attempt = attempt.max(1);
    let initial_ms = millis_f64(policy.initial_delay);
    let raw_ms = match strategy {
        BackoffStrategy::Fixed => initial_ms,
        BackoffStrategy::Linear => initial_ms * f64::from(attempt),
        BackoffStrategy::Exponential => {
            let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
            initial_ms * policy.backoff_multiplier.powi(exp)
        }
    };
    let max_ms = millis_f64(policy.max_delay);
    let capped = if raw_ms.is_finite() {
        raw_ms.min(max_ms)
    } else {
        max_ms
    };
    from_millis_f64(capped)
}

/// Backoff delay for `attempt` with uniform ±[`JITTER_RATIO`] jitter.
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy, strategy: BackoffStrategy) -> Duration {
    let jitter = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
    backoff_delay_with_jitter(attempt, policy, strategy, jitter)
}

/// Deterministic variant of [`backoff_delay`]. `jitter` is clamped to
/// `[-JITTER_RATIO, JITTER_RATIO]`.
pub fn backoff_delay_with_jitter(
    attempt: u32,
    policy: &RetryPolicy,
    strategy: BackoffStrategy,
    jitter: f64,
) -> Duration {
    let base = millis_f64(base_delay(attempt, policy, strategy));
    let jitter = if jitter.is_finite() {
        jitter.clamp(-JITTER_RATIO, JITTER_RATIO)
    } else {
        0.0
    };
    from_millis_f64(base * (1.0 + jitter))
}

fn millis_f64(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

fn from_millis_f64(ms: f64) -> Duration {
    Duration::from_nanos((ms.max(0.0) * 1_000_000.0).round() as u64)
}

/// Whether another attempt should follow a failure.
///
/// `attempts_made` counts the attempt that just failed.
pub fn should_retry(error: &TaskError, attempts_made: u32, policy: &RetryPolicy) -> bool {
    if attempts_made >= policy.max_attempts {
        return false;
    }
    let retryable = error.retryable || (error.is_timeout() && policy.retry_on_timeout);
    if !retryable {
        return false;
    }
    match &policy.retryable_error_codes {
        Some(codes) => codes.contains(&error.code),
        None => true,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_delays(Duration::from_millis(100), Duration::from_millis(1000))
            .with_multiplier(2.0)
    }

    #[test]
    fn test_fixed_linear_exponential() {
        let p = policy();
        assert_eq!(base_delay(3, &p, BackoffStrategy::Fixed), Duration::from_millis(100));
        assert_eq!(base_delay(3, &p, BackoffStrategy::Linear), Duration::from_millis(300));
        assert_eq!(
            base_delay(1, &p, BackoffStrategy::Exponential),
            Duration::from_millis(100)
        );
        assert_eq!(
            base_delay(3, &p, BackoffStrategy::Exponential),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_delay_is_capped() {
        let p = policy();
        assert_eq!(
            base_delay(10, &p, BackoffStrategy::Exponential),
            Duration::from_millis(1000)
        );
        assert_eq!(base_delay(50, &p, BackoffStrategy::Linear), Duration::from_millis(1000));
        // Huge exponents overflow to infinity and still cap.
        assert_eq!(
            base_delay(u32::MAX, &p, BackoffStrategy::Exponential),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let p = policy();
        assert_eq!(
            base_delay(0, &p, BackoffStrategy::Exponential),
            base_delay(1, &p, BackoffStrategy::Exponential)
        );
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let p = policy();
        for attempt in 1..=8 {
            let base = base_delay(attempt, &p, BackoffStrategy::Exponential).as_secs_f64();
            for _ in 0..50 {
                let d = backoff_delay(attempt, &p, BackoffStrategy::Exponential).as_secs_f64();
                assert!(d >= base * 0.9 - 1e-9, "attempt {attempt}: {d} < {base} * 0.9");
                assert!(d <= base * 1.1 + 1e-9, "attempt {attempt}: {d} > {base} * 1.1");
            }
        }
    }

    #[test]
    fn test_deterministic_jitter_is_clamped() {
        let p = policy();
        let high = backoff_delay_with_jitter(1, &p, BackoffStrategy::Fixed, 5.0);
        assert_eq!(high.as_millis(), 110);
        let low = backoff_delay_with_jitter(1, &p, BackoffStrategy::Fixed, -0.1);
        assert_eq!(low.as_millis(), 90);
        let none = backoff_delay_with_jitter(1, &p, BackoffStrategy::Fixed, f64::NAN);
        assert_eq!(none.as_millis(), 100);
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let p = policy().with_max_attempts(3);
        let err = TaskError::execution("boom");
        assert!(should_retry(&err, 1, &p));
        assert!(should_retry(&err, 2, &p));
        assert!(!should_retry(&err, 3, &p));
    }

    #[test]
    fn test_should_retry_non_retryable() {
        let p = policy();
        assert!(!should_retry(&TaskError::validation("bad"), 1, &p));
        assert!(!should_retry(
            &TaskError::execution("fatal").with_retryable(false),
            1,
            &p
        ));
    }

    #[test]
    fn test_timeout_requires_opt_in() {
        let err = TaskError::timeout(100);
        assert!(!should_retry(&err, 1, &policy()));
        assert!(should_retry(&err, 1, &policy().with_retry_on_timeout(true)));
    }

    #[test]
    fn test_allow_list() {
        let p = policy().with_retryable_codes(vec![ErrorCode::from("RATE_LIMITED")]);
        assert!(should_retry(&TaskError::new("RATE_LIMITED", "slow"), 1, &p));
        assert!(!should_retry(&TaskError::execution("boom"), 1, &p));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::default().with_max_attempts(0).validate().is_err());
        assert!(RetryPolicy::default()
            .with_delays(Duration::from_secs(5), Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(RetryPolicy::default().with_multiplier(0.5).validate().is_err());
        assert!(RetryPolicy::default()
            .with_multiplier(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_policy_serializes_millis() {
        let json = serde_json::to_value(policy()).unwrap();
        assert_eq!(json["initial_delay_ms"], 100);
        assert_eq!(json["max_delay_ms"], 1000);
        assert_eq!(json["strategy"], "exponential");
        let parsed: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 5, "strategy": "linear"}"#).unwrap();
        assert_eq!(parsed.max_attempts, 5);
        assert_eq!(parsed.strategy, BackoffStrategy::Linear);
        assert_eq!(parsed.initial_delay, Duration::from_millis(1000));
    }
}
