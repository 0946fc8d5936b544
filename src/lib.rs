//! Financial Tool Orchestrator
//!
//! Routes a user query to the relevant financial tools and streams the
//! results back:
//! - Selects a small candidate set per query (classifier + lexical fallback)
//! - Runs tool calls concurrently on a bounded worker pool
//! - Collapses identical in-flight calls and caches results per data type
//! - Streams progress and answer deltas with bounded backpressure
//!
//! FLOW:
//! QUERY → SELECT → PLAN CALLS → EXECUTE (CACHE → DEDUP → POOL) → STREAM → DONE

pub mod api;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod executor;
pub mod gemini;
pub mod keys;
pub mod llm;
pub mod models;
pub mod runtime;
pub mod selector;
pub mod stream;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use models::*;
