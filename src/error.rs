//! Error types for the financial tool orchestrator

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Error raised by a single tool invocation.
///
/// Cloneable so every caller attached to a deduplicated flight observes the
/// identical error value.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ToolError {
    /// Malformed arguments. Never retried, never cached.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The tool could not reach its upstream dependency.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Per-call budget exceeded.
    #[error("Tool timed out after {0} ms")]
    Timeout(u64),

    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Internal tool error: {0}")]
    Internal(String),
}

impl ToolError {
    /// Label used in `tool_error` event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "validation",
            ToolError::Transport(_) => "transport",
            ToolError::Timeout(_) => "timeout",
            ToolError::NotFound(_) => "not_found",
            ToolError::Internal(_) => "internal",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ToolError::Validation(m)
            | ToolError::Transport(m)
            | ToolError::NotFound(m)
            | ToolError::Internal(m) => m.clone(),
            ToolError::Timeout(ms) => format!("timed out after {} ms", ms),
        }
    }
}

impl From<reqwest::Error> for ToolError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ToolError::Transport(format!("upstream timed out: {}", e))
        } else {
            ToolError::Transport(e.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_kind_labels() {
        assert_eq!(ToolError::Validation("x".into()).kind(), "validation");
        assert_eq!(ToolError::Timeout(5).kind(), "timeout");
        assert_eq!(ToolError::Timeout(5).message(), "timed out after 5 ms");
    }

    #[test]
    fn test_tool_error_serializes_with_kind_tag() {
        let json = serde_json::to_value(ToolError::Transport("refused".into())).unwrap();
        assert_eq!(json["kind"], "transport");
        assert_eq!(json["message"], "refused");
    }
}
