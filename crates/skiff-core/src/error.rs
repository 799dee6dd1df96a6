//! Dispatch error taxonomy.
//!
//! Errors local to one filter or one tool call are contained by their
//! components and never surface here. Errors from the selected execution
//! handler terminate that request's generation but are persisted before the
//! caller-facing response ends.

use std::time::Duration;

use crate::cancel::CancelReason;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A filter endpoint errored, timed out, or returned non-2xx.
    /// Only ever observed inside the filter pipeline, which logs and skips.
    #[error("filter '{id}' failed: {reason}")]
    FilterFailure { id: String, reason: String },

    /// Network-level failure reaching an execution backend.
    #[error("backend connection error: {0}")]
    BackendConnection(String),

    /// The gateway↔backend segment exceeded its configured timeout.
    /// Reported to callers the same way as a connection error.
    #[error("backend timed out after {0:?}")]
    BackendTimeout(Duration),

    /// The backend answered with a structured error (bad request, quota,
    /// auth failure). Status and detail are propagated, not masked.
    #[error("backend returned {status}: {detail}")]
    BackendProtocol { status: u16, detail: String },

    /// An execution handler raised during its own logic. Surfaces as an
    /// in-stream `OutputEvent::Error`, never a transport failure.
    #[error("{0}")]
    HandlerInternal(String),

    /// No descriptor resolves for the requested model or arena member.
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// Caller-initiated abort. Not an error for reporting purposes: partial
    /// content is persisted and a distinct cancelled status recorded.
    #[error("cancelled ({0})")]
    Cancelled(CancelReason),
}

impl DispatchError {
    /// Whether this error should persist and report as a connection-class
    /// failure (timeouts collapse into this bucket).
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            DispatchError::BackendConnection(_) | DispatchError::BackendTimeout(_)
        )
    }

    pub fn handler(message: impl Into<String>) -> Self {
        DispatchError::HandlerInternal(message.into())
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured duration here; callers
            // that know it use BackendTimeout directly.
            DispatchError::BackendTimeout(Duration::ZERO)
        } else {
            DispatchError::BackendConnection(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_connection_class() {
        assert!(DispatchError::BackendTimeout(Duration::from_secs(300)).is_connection_class());
        assert!(DispatchError::BackendConnection("refused".into()).is_connection_class());
        assert!(!DispatchError::handler("oops").is_connection_class());
    }

    #[test]
    fn test_protocol_error_keeps_status_and_detail() {
        let err = DispatchError::BackendProtocol {
            status: 429,
            detail: "quota exceeded".into(),
        };
        let text = err.to_string();
        assert!(text.contains("429"));
        assert!(text.contains("quota exceeded"));
    }
}
