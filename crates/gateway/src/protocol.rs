//! Chat stream wire protocol
//!
//! Inbound client messages and outbound server events for the `/v1/chat`
//! socket, plus the per-query state machine the driver enforces.
//!
//! Event sequence per query: `received → retrieving → response_start →
//! response_chunk* → response_end`, with `error` as the alternate
//! terminal from any non-terminal state. Exactly one `response_start`
//! and exactly one terminal per query.

use chrono::{DateTime, Utc};
use docpilot_common::errors::{AppError, ErrorCode};
use docpilot_common::types::{ContextChunk, GenerationParams, SourceRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Inbound messages, tagged by `type`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Query(QueryMessage),
    Highlight(HighlightMessage),
    Cancel,
}

fn default_require_sources() -> bool {
    true
}

/// One user question
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct QueryMessage {
    #[validate(length(min = 1, max = 10000, message = "message must be 1-10000 characters"))]
    pub message: String,

    /// Omitted or unknown ids start a fresh session, never an error
    pub session_id: Option<Uuid>,

    /// When true the answer must cite the supplied excerpts
    #[serde(default = "default_require_sources")]
    pub require_sources: bool,

    /// Client-tunable generation knobs, clamped server-side
    #[serde(default)]
    pub params: GenerationParams,
}

/// A passage the user pinned as context for upcoming queries
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct HighlightMessage {
    #[validate(length(min = 1, max = 4000, message = "highlight text must be 1-4000 characters"))]
    pub text: String,

    pub session_id: Option<Uuid>,
}

/// Outbound events, tagged by `type`. Every query-scoped event carries
/// the session id, the query id, and an emission timestamp.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Received {
        session_id: Uuid,
        query_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    Retrieving {
        session_id: Uuid,
        query_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    ResponseStart {
        session_id: Uuid,
        query_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    ResponseChunk {
        session_id: Uuid,
        query_id: Uuid,
        timestamp: DateTime<Utc>,
        delta: String,
    },
    ResponseEnd {
        session_id: Uuid,
        query_id: Uuid,
        timestamp: DateTime<Utc>,
        sources: Vec<SourceRef>,
        has_relevant_content: bool,
        response_time_ms: u64,
    },
    Error {
        session_id: Uuid,
        query_id: Uuid,
        timestamp: DateTime<Utc>,
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
    HighlightAdded {
        session_id: Uuid,
        highlight_id: Uuid,
        expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

impl ServerEvent {
    pub fn received(session_id: Uuid, query_id: Uuid) -> Self {
        Self::Received {
            session_id,
            query_id,
            timestamp: Utc::now(),
        }
    }

    pub fn retrieving(session_id: Uuid, query_id: Uuid) -> Self {
        Self::Retrieving {
            session_id,
            query_id,
            timestamp: Utc::now(),
        }
    }

    pub fn response_start(session_id: Uuid, query_id: Uuid) -> Self {
        Self::ResponseStart {
            session_id,
            query_id,
            timestamp: Utc::now(),
        }
    }

    pub fn response_chunk(session_id: Uuid, query_id: Uuid, delta: String) -> Self {
        Self::ResponseChunk {
            session_id,
            query_id,
            timestamp: Utc::now(),
            delta,
        }
    }

    pub fn response_end(
        session_id: Uuid,
        query_id: Uuid,
        sources: Vec<SourceRef>,
        has_relevant_content: bool,
        response_time_ms: u64,
    ) -> Self {
        Self::ResponseEnd {
            session_id,
            query_id,
            timestamp: Utc::now(),
            sources,
            has_relevant_content,
            response_time_ms,
        }
    }

    /// Build the protocol `error` event from a typed error. Only the
    /// stable client message crosses the wire.
    pub fn error(session_id: Uuid, query_id: Uuid, error: &AppError) -> Self {
        Self::Error {
            session_id,
            query_id,
            timestamp: Utc::now(),
            code: error.code(),
            message: error.client_message(),
            retry_after_ms: error.retry_after_ms(),
        }
    }

    pub fn highlight_added(highlight: &ContextChunk) -> Self {
        Self::HighlightAdded {
            session_id: highlight.session_id,
            highlight_id: highlight.id,
            expires_at: highlight.expires_at,
            timestamp: Utc::now(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::Received { .. } => "received",
            ServerEvent::Retrieving { .. } => "retrieving",
            ServerEvent::ResponseStart { .. } => "response_start",
            ServerEvent::ResponseChunk { .. } => "response_chunk",
            ServerEvent::ResponseEnd { .. } => "response_end",
            ServerEvent::Error { .. } => "error",
            ServerEvent::HighlightAdded { .. } => "highlight_added",
        }
    }
}

/// Per-query lifecycle. `Completed` and `Failed` are terminal; no event
/// may follow a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Pending,
    Received,
    Retrieving,
    Streaming,
    Completed,
    Failed,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryState::Completed | QueryState::Failed)
    }

    /// Whether `event` may legally be emitted from this state
    pub fn permits(self, event: &ServerEvent) -> bool {
        if self.is_terminal() {
            return false;
        }
        match event {
            ServerEvent::Received { .. } => self == QueryState::Pending,
            ServerEvent::Retrieving { .. } => self == QueryState::Received,
            ServerEvent::ResponseStart { .. } => self == QueryState::Retrieving,
            ServerEvent::ResponseChunk { .. } | ServerEvent::ResponseEnd { .. } => {
                self == QueryState::Streaming
            }
            // Alternate terminal, reachable from any non-terminal state.
            ServerEvent::Error { .. } => true,
            ServerEvent::HighlightAdded { .. } => false,
        }
    }

    pub fn apply(self, event: &ServerEvent) -> Self {
        match event {
            ServerEvent::Received { .. } => QueryState::Received,
            ServerEvent::Retrieving { .. } => QueryState::Retrieving,
            ServerEvent::ResponseStart { .. } | ServerEvent::ResponseChunk { .. } => {
                QueryState::Streaming
            }
            ServerEvent::ResponseEnd { .. } => QueryState::Completed,
            ServerEvent::Error { .. } => QueryState::Failed,
            ServerEvent::HighlightAdded { .. } => self,
        }
    }
}

/// Replay a query's event sequence through the state machine; true when
/// every transition is legal and the sequence ends in a terminal.
#[cfg(test)]
pub fn validate_sequence(events: &[ServerEvent]) -> bool {
    let mut state = QueryState::Pending;
    for event in events {
        if matches!(event, ServerEvent::HighlightAdded { .. }) {
            continue;
        }
        if !state.permits(event) {
            return false;
        }
        state = state.apply(event);
    }
    state.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_message_defaults() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type": "query", "message": "how do I install?"}"#).unwrap();
        let ClientMessage::Query(query) = parsed else {
            panic!("expected query message");
        };
        assert_eq!(query.message, "how do I install?");
        assert!(query.require_sources);
        assert!(query.session_id.is_none());
        assert!(query.params.max_tokens.is_none());
        assert!(query.validate().is_ok());
    }

    #[test]
    fn test_highlight_and_cancel_parse() {
        let highlight: ClientMessage = serde_json::from_str(
            r#"{"type": "highlight", "text": "pinned passage", "session_id": "6a6f9b6e-6a1f-4f07-9f6e-3ab6a3f0c001"}"#,
        )
        .unwrap();
        assert!(matches!(highlight, ClientMessage::Highlight(h) if h.session_id.is_some()));

        let cancel: ClientMessage = serde_json::from_str(r#"{"type": "cancel"}"#).unwrap();
        assert!(matches!(cancel, ClientMessage::Cancel));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let parsed = serde_json::from_str::<ClientMessage>(r#"{"type": "subscribe"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_message_length_bounds() {
        let empty = QueryMessage {
            message: String::new(),
            session_id: None,
            require_sources: true,
            params: GenerationParams::default(),
        };
        assert!(empty.validate().is_err());

        let oversized = QueryMessage {
            message: "x".repeat(10_001),
            ..empty.clone()
        };
        assert!(oversized.validate().is_err());

        let fits = QueryMessage {
            message: "x".repeat(10_000),
            ..empty
        };
        assert!(fits.validate().is_ok());
    }

    #[test]
    fn test_error_event_wire_shape() {
        let session = Uuid::new_v4();
        let query = Uuid::new_v4();
        let event = ServerEvent::error(
            session,
            query,
            &AppError::RateLimited { retry_after_ms: 500 },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "RATE_LIMITED");
        assert_eq!(value["retry_after_ms"], 500);
        assert_eq!(value["session_id"], session.to_string());

        // Absent hint is omitted, not null.
        let event = ServerEvent::error(session, query, &AppError::Cancelled);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["code"], "CANCELLED");
        assert!(value.get("retry_after_ms").is_none());
    }

    #[test]
    fn test_response_end_wire_shape() {
        let event = ServerEvent::response_end(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![SourceRef {
                source_path: "guides/install.md".to_string(),
                heading_path: vec!["Install".to_string()],
                relevance_score: 0.92,
            }],
            true,
            1234,
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "response_end");
        assert_eq!(value["has_relevant_content"], true);
        assert_eq!(value["response_time_ms"], 1234);
        assert_eq!(value["sources"][0]["source_path"], "guides/install.md");
    }

    fn lifecycle(session: Uuid, query: Uuid) -> Vec<ServerEvent> {
        vec![
            ServerEvent::received(session, query),
            ServerEvent::retrieving(session, query),
            ServerEvent::response_start(session, query),
            ServerEvent::response_chunk(session, query, "partial ".to_string()),
            ServerEvent::response_chunk(session, query, "answer".to_string()),
            ServerEvent::response_end(session, query, vec![], true, 10),
        ]
    }

    #[test]
    fn test_legal_sequences() {
        let (s, q) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(validate_sequence(&lifecycle(s, q)));

        // Zero chunks is legal.
        assert!(validate_sequence(&[
            ServerEvent::received(s, q),
            ServerEvent::retrieving(s, q),
            ServerEvent::response_start(s, q),
            ServerEvent::response_end(s, q, vec![], false, 5),
        ]));

        // Error is reachable from any non-terminal state.
        assert!(validate_sequence(&[ServerEvent::error(
            s,
            q,
            &AppError::RateLimited { retry_after_ms: 100 }
        )]));
        assert!(validate_sequence(&[
            ServerEvent::received(s, q),
            ServerEvent::retrieving(s, q),
            ServerEvent::error(s, q, &AppError::Cancelled),
        ]));
    }

    #[test]
    fn test_illegal_sequences() {
        let (s, q) = (Uuid::new_v4(), Uuid::new_v4());

        // Nothing may follow a terminal.
        let mut doubled = lifecycle(s, q);
        doubled.push(ServerEvent::response_end(s, q, vec![], true, 10));
        assert!(!validate_sequence(&doubled));

        let mut chunk_after_end = lifecycle(s, q);
        chunk_after_end.push(ServerEvent::response_chunk(s, q, "late".to_string()));
        assert!(!validate_sequence(&chunk_after_end));

        let mut error_after_end = lifecycle(s, q);
        error_after_end.push(ServerEvent::error(s, q, &AppError::Cancelled));
        assert!(!validate_sequence(&error_after_end));

        // Chunks require response_start first.
        assert!(!validate_sequence(&[
            ServerEvent::received(s, q),
            ServerEvent::response_chunk(s, q, "early".to_string()),
        ]));

        // An unterminated sequence is incomplete.
        assert!(!validate_sequence(&[
            ServerEvent::received(s, q),
            ServerEvent::retrieving(s, q),
        ]));
    }
}
