//! Core data models for the tool orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ToolError;

//
// ================= Enums =================
//

/// Independent cache store, also the unit tool timeouts and TTLs are configured by.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Quote,
    Search,
    News,
    Embedding,
}

impl CacheType {
    pub const ALL: [CacheType; 4] = [
        CacheType::Quote,
        CacheType::Search,
        CacheType::News,
        CacheType::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Quote => "quote",
            CacheType::Search => "search",
            CacheType::News => "news",
            CacheType::Embedding => "embedding",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CacheType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quote" | "quotes" => Ok(CacheType::Quote),
            "search" | "search-result" | "search_result" => Ok(CacheType::Search),
            "news" => Ok(CacheType::News),
            "embedding" | "embeddings" => Ok(CacheType::Embedding),
            other => Err(format!("unknown cache type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Pending,
    CacheHit,
    DedupJoined,
    Running,
    Completed,
    Error,
    TimedOut,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::CacheHit | CallState::Completed | CallState::Error | CallState::TimedOut
        )
    }
}

//
// ================= Tools =================
//

/// Static description of a cataloged tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub baseline_confidence: f32,
    pub cache_type: CacheType,
}

/// One concrete, correlatable request to invoke a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub state: CallState,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            state: CallState::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    CacheHit { value: Value },
    Completed { value: Value },
    Error { kind: String, message: String },
    TimedOut,
}

impl ToolOutcome {
    pub fn from_result(result: std::result::Result<Value, ToolError>) -> Self {
        match result {
            Ok(value) => ToolOutcome::Completed { value },
            Err(ToolError::Timeout(_)) => ToolOutcome::TimedOut,
            Err(e) => ToolOutcome::Error {
                kind: e.kind().to_string(),
                message: e.message(),
            },
        }
    }

    /// Terminal state a call takes on when it resolves with this outcome.
    pub fn state(&self) -> CallState {
        match self {
            ToolOutcome::CacheHit { .. } => CallState::CacheHit,
            ToolOutcome::Completed { .. } => CallState::Completed,
            ToolOutcome::Error { .. } => CallState::Error,
            ToolOutcome::TimedOut => CallState::TimedOut,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            ToolOutcome::CacheHit { value } | ToolOutcome::Completed { value } => Some(value),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.value().is_some()
    }
}

/// Terminal record yielded by the executor for each call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call: ToolCall,
    pub outcome: ToolOutcome,
    pub elapsed_ms: u64,
    /// Joined a flight another caller started instead of executing.
    #[serde(default)]
    pub deduplicated: bool,
}

//
// ================= Streaming =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ToolStarted,
    ToolCompleted,
    ToolError,
    ContentDelta,
    Done,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ToolStarted => "tool_started",
            EventKind::ToolCompleted => "tool_completed",
            EventKind::ToolError => "tool_error",
            EventKind::ContentDelta => "content_delta",
            EventKind::Done => "done",
        }
    }

    /// Terminal events are never dropped for backpressure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::ToolCompleted | EventKind::ToolError | EventKind::Done
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub sequence_no: u64,
    pub kind: EventKind,
    pub payload: Value,
}

/// Request-scoped handle correlating a query's calls and events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub query: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            query: query.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_from_timeout_is_timed_out() {
        let outcome = ToolOutcome::from_result(Err(ToolError::Timeout(1)));
        assert_eq!(outcome, ToolOutcome::TimedOut);
        assert_eq!(outcome.state(), CallState::TimedOut);
    }

    #[test]
    fn test_outcome_error_carries_kind() {
        let outcome = ToolOutcome::from_result(Err(ToolError::Transport("down".into())));
        assert_eq!(
            outcome,
            ToolOutcome::Error {
                kind: "transport".into(),
                message: "down".into()
            }
        );
    }

    #[test]
    fn test_event_kind_serialization() {
        let event = StreamEvent {
            sequence_no: 3,
            kind: EventKind::ContentDelta,
            payload: json!({"text": "hi"}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "content_delta");
        assert!(!EventKind::ContentDelta.is_terminal());
        assert!(EventKind::Done.is_terminal());
    }

    #[test]
    fn test_cache_type_parse() {
        assert_eq!("quotes".parse::<CacheType>().unwrap(), CacheType::Quote);
        assert_eq!("search-result".parse::<CacheType>().unwrap(), CacheType::Search);
        assert!("bogus".parse::<CacheType>().is_err());
    }
}
