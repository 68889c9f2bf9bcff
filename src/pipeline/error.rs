//! Error taxonomy shared by every pipeline stage.
//!
//! Callers decide what to do with a failure from its variant alone:
//! validation failures are dropped, store failures and timeouts are retried
//! by whoever owns redelivery, conflicts count as success.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed ping. Drop it, do not retry.
    #[error("invalid ping: {0}")]
    Validation(String),

    /// Cache or sink unavailable. Retryable by the caller.
    #[error("store unavailable: {0}")]
    TransientStore(String),

    /// Duplicate primary key on insert.
    #[error("duplicate record: {0}")]
    Conflict(String),

    /// Expected cache entry missing (e.g. telemetry buffer at aggregation time).
    #[error("not found: {0}")]
    NotFound(String),

    /// A downstream call exceeded its deadline.
    #[error("timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// True when the same input may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientStore(_) | PipelineError::Timeout { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PipelineError::Conflict(_))
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                PipelineError::Conflict(err.to_string())
            }
            _ => PipelineError::TransientStore(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::TransientStore("down".into()).is_retryable());
        assert!(PipelineError::Timeout {
            operation: "publish".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!PipelineError::Validation("bad".into()).is_retryable());
        assert!(!PipelineError::Conflict("dup".into()).is_retryable());
        assert!(!PipelineError::NotFound("gone".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = PipelineError::Timeout {
            operation: "insert trips".into(),
            timeout_ms: 5000,
        };
        assert_eq!(err.to_string(), "timed out after 5000ms: insert trips");
    }
}
