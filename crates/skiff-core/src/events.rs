//! Canonical output event protocol.
//!
//! `OutputEvent` is the single source of truth for everything a running
//! completion emits. Execution handlers produce these, the streaming bridge
//! carries them, the filter pipeline transforms the terminal payload built
//! from them, and transport layers (HTTP/SSE server) map them to their own
//! wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events emitted while a completion is being produced.
///
/// Ordered per request. Exactly one terminal event ends every sequence:
/// `Done` (complete or cancelled) or `Error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    /// Incremental content delta from the backend.
    PartialContent { delta: String },

    /// Human-readable progress line (agent started, workflow node done, ...).
    StatusUpdate { status: String },

    /// A handler is about to invoke a tool.
    ToolCallRequested {
        id: String,
        name: String,
        arguments: Value,
    },

    /// Tool invocation finished.
    ToolCallResult {
        id: String,
        output: Value,
        is_error: bool,
    },

    /// Generation failed. Terminal; no events follow.
    Error { message: String },

    /// Generation finished. Terminal; no events follow.
    ///
    /// `content` is the full assembled (and outlet-filtered) text, so
    /// non-streaming consumers never have to re-accumulate deltas.
    Done { finish: FinishKind, content: String },
}

/// How a finished generation ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishKind {
    Complete,
    Cancelled,
}

impl OutputEvent {
    /// Terminal events end the sequence; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutputEvent::Done { .. } | OutputEvent::Error { .. })
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutputEvent::Error {
            message: message.into(),
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        OutputEvent::StatusUpdate {
            status: status.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_snake_case_tags() {
        let event = OutputEvent::PartialContent {
            delta: "Hello".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "partial_content");
        assert_eq!(json["delta"], "Hello");

        let event = OutputEvent::Done {
            finish: FinishKind::Cancelled,
            content: "partial".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["finish"], "cancelled");
    }

    #[test]
    fn test_terminal_classification() {
        assert!(OutputEvent::error("boom").is_terminal());
        assert!(OutputEvent::Done {
            finish: FinishKind::Complete,
            content: String::new(),
        }
        .is_terminal());
        assert!(!OutputEvent::status("working").is_terminal());
        assert!(!OutputEvent::PartialContent {
            delta: "x".to_string()
        }
        .is_terminal());
    }
}
