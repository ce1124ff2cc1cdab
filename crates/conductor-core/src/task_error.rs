use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of an execution failure.
///
/// Serialized as a SCREAMING_SNAKE_CASE string so that retry allow-lists in
/// configuration files can name codes directly (`"TIMEOUT"`, `"RATE_LIMITED"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    /// Generic failure reported by a worker.
    Execution,
    /// The attempt exceeded its effective timeout.
    Timeout,
    /// A nested workflow exceeded the configured execution depth.
    MaxDepthExceeded,
    /// The unit of work is malformed and cannot be executed.
    Validation,
    /// No eligible worker was available for the required type.
    NoWorkerAvailable,
    /// The unit of work was cancelled.
    Cancelled,
    /// Worker-defined code.
    Custom(String),
}

impl ErrorCode {
    /// Wire name of the code, e.g. `"EXECUTION"`.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Execution => "EXECUTION",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::MaxDepthExceeded => "MAX_DEPTH_EXCEEDED",
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::NoWorkerAvailable => "NO_WORKER_AVAILABLE",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Custom(code) => code,
        }
    }

    /// Whether failures with this code are worth another attempt by default.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Execution | ErrorCode::NoWorkerAvailable | ErrorCode::Custom(_)
        )
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "EXECUTION" => ErrorCode::Execution,
            "TIMEOUT" => ErrorCode::Timeout,
            "MAX_DEPTH_EXCEEDED" => ErrorCode::MaxDepthExceeded,
            "VALIDATION" => ErrorCode::Validation,
            "NO_WORKER_AVAILABLE" => ErrorCode::NoWorkerAvailable,
            "CANCELLED" => ErrorCode::Cancelled,
            _ => ErrorCode::Custom(code),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        ErrorCode::from(code.to_string())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single execution attempt.
///
/// Workers return this from `process_task`; the engine produces it for
/// timeouts, depth violations and routing failures. Whether another attempt
/// is made is decided by the retry policy, which honours `retryable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
    /// `false` marks the error as explicitly non-retryable.
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    /// Creates an error whose retryability follows [`ErrorCode::default_retryable`].
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        let code = code.into();
        let retryable = code.default_retryable();
        Self {
            code,
            message: message.into(),
            retryable,
            details: None,
        }
    }

    /// Generic worker failure.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Execution, message)
    }

    /// Timeouts are a named non-retryable class.
    pub fn timeout(after_ms: u64) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("operation timed out after {after_ms}ms"),
        )
    }

    /// Step nesting went past the configured limit.
    pub fn max_depth_exceeded(depth: u32, max_depth: u32) -> Self {
        Self::new(
            ErrorCode::MaxDepthExceeded,
            format!("execution depth {depth} exceeds maximum of {max_depth}"),
        )
    }

    /// Malformed input, such as an unknown step kind.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// No registered worker can take tasks of `worker_type`.
    pub fn no_worker(worker_type: &str) -> Self {
        Self::new(
            ErrorCode::NoWorkerAvailable,
            format!("no available worker for type '{worker_type}'"),
        )
    }

    /// Task was cancelled.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    /// Override the default retryability.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach structured context.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the code is `TIMEOUT`.
    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::Timeout
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trips_through_string() {
        for code in [
            ErrorCode::Execution,
            ErrorCode::Timeout,
            ErrorCode::MaxDepthExceeded,
            ErrorCode::Validation,
            ErrorCode::NoWorkerAvailable,
            ErrorCode::Cancelled,
            ErrorCode::Custom("RATE_LIMITED".into()),
        ] {
            let s: String = code.clone().into();
            assert_eq!(ErrorCode::from(s), code);
        }
    }

    #[test]
    fn test_code_serializes_as_plain_string() {
        let json = serde_json::to_string(&ErrorCode::MaxDepthExceeded).unwrap();
        assert_eq!(json, "\"MAX_DEPTH_EXCEEDED\"");
        let parsed: ErrorCode = serde_json::from_str("\"HTTP_503\"").unwrap();
        assert_eq!(parsed, ErrorCode::Custom("HTTP_503".into()));
    }

    #[test]
    fn test_default_retryability() {
        assert!(TaskError::execution("x").retryable);
        assert!(TaskError::no_worker("coder").retryable);
        assert!(TaskError::new("RATE_LIMITED", "slow down").retryable);
        assert!(!TaskError::timeout(100).retryable);
        assert!(!TaskError::max_depth_exceeded(11, 10).retryable);
        assert!(!TaskError::validation("bad step").retryable);
        assert!(!TaskError::cancelled("stop").retryable);
    }

    #[test]
    fn test_with_retryable_overrides() {
        let err = TaskError::execution("fatal").with_retryable(false);
        assert!(!err.retryable);
        let err = TaskError::timeout(5).with_retryable(true);
        assert!(err.retryable);
        assert!(err.is_timeout());
    }

    #[test]
    fn test_display() {
        let err = TaskError::timeout(100);
        assert_eq!(err.to_string(), "TIMEOUT: operation timed out after 100ms");
        let err = TaskError::max_depth_exceeded(11, 10);
        assert!(err.to_string().starts_with("MAX_DEPTH_EXCEEDED"));
    }

    #[test]
    fn test_details_skipped_when_empty() {
        let json = serde_json::to_value(TaskError::execution("x")).unwrap();
        assert!(json.get("details").is_none());
        let json = serde_json::to_value(
            TaskError::execution("x").with_details(serde_json::json!({"status": 503})),
        )
        .unwrap();
        assert_eq!(json["details"]["status"], 503);
    }
}
