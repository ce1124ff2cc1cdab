#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. TaskError serialization
// ---------------------------------------------------------------------------

#[test]
fn task_error_serialization_roundtrip() {
    let err = TaskError::new("RATE_LIMITED", "slow down")
        .with_details(serde_json::json!({"retry_after_ms": 250}));

    let json = serde_json::to_string(&err).unwrap();
    let parsed: TaskError = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed, err);
    assert_eq!(parsed.code, ErrorCode::Custom("RATE_LIMITED".into()));
    assert!(parsed.retryable);
}

#[test]
fn task_error_wire_shape() {
    let json = serde_json::to_value(TaskError::timeout(1500)).unwrap();
    assert_eq!(json["code"], "TIMEOUT");
    assert_eq!(json["message"], "operation timed out after 1500ms");
    assert_eq!(json["retryable"], false);
}

// ---------------------------------------------------------------------------
// 2. ConductorError display
// ---------------------------------------------------------------------------

#[test]
fn conductor_error_messages() {
    let id = Uuid::new_v4();
    let err = ConductorError::InvalidTransition {
        task_id: id,
        from: "completed".into(),
        to: "processing".into(),
    };
    assert_eq!(
        err.to_string(),
        format!("Invalid transition for task {id}: completed -> processing")
    );

    assert_eq!(
        ConductorError::TaskNotFound(id).to_string(),
        format!("Task not found: {id}")
    );
    assert_eq!(
        ConductorError::NotRunning("orchestrator is stopped".into()).to_string(),
        "Not running: orchestrator is stopped"
    );
}

#[test]
fn io_error_converts_with_question_mark() {
    fn open_missing() -> ConductorResult<String> {
        Ok(std::fs::read_to_string("/definitely/not/here/conductor")?)
    }
    let err = open_missing().unwrap_err();
    assert!(matches!(err, ConductorError::Io(_)));
}
