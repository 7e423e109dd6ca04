use super::*;

#[test]
fn kind_serializes_kebab_case() {
    let json = serde_json::to_string(&ErrorKind::RecursionExceeded).unwrap();
    assert_eq!(json, "\"recursion-exceeded\"");
    let json = serde_json::to_string(&ErrorKind::ThreadBusy).unwrap();
    assert_eq!(json, "\"thread-busy\"");
}

#[test]
fn kind_round_trips() {
    for kind in [
        ErrorKind::AuthRequired,
        ErrorKind::ThreadBusy,
        ErrorKind::ThreadNotFound,
        ErrorKind::LlmUnavailable,
        ErrorKind::LlmInvalidResponse,
        ErrorKind::ToolFailed,
        ErrorKind::SandboxUnavailable,
        ErrorKind::PathEscape,
        ErrorKind::Timeout,
        ErrorKind::RecursionExceeded,
        ErrorKind::StorageUnavailable,
        ErrorKind::StaleParent,
        ErrorKind::Cancelled,
        ErrorKind::Internal,
    ] {
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, format!("\"{}\"", kind.as_str()));
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kind);
    }
}

#[test]
fn retryable_classification() {
    assert!(ServerError::LlmUnavailable("503".into()).is_retryable());
    assert!(
        ServerError::StaleParent {
            thread_id: "t".into(),
            expected: Some(1),
            got: Some(2),
        }
        .is_retryable()
    );
    assert!(!ServerError::PathEscape("../etc".into()).is_retryable());
    assert!(!ServerError::RecursionExceeded { limit: 3 }.is_retryable());
    assert!(!ServerError::Cancelled.is_retryable());
}

#[test]
fn anyhow_converts_to_internal() {
    fn inner() -> anyhow::Result<()> {
        anyhow::bail!("boom")
    }
    fn outer() -> ServerResult<()> {
        inner()?;
        Ok(())
    }
    let err = outer().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
}
