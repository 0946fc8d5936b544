//! REST API Server for the financial tool orchestrator
//!
//! Streams sessions over SSE and exposes selection, catalog and cache
//! administration endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::models::{CacheType, EventKind, StreamEvent};
use crate::runtime::Runtime;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Either a bare `query` or a chat transcript whose last user turn is used.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub query: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    fn user_query(&self) -> Option<String> {
        let query = match &self.query {
            Some(q) => q.clone(),
            None => self
                .messages
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone())?,
        };
        let query = query.trim().to_string();
        (!query.is_empty()).then_some(query)
    }
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub query: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn bad_request(message: &str) -> (StatusCode, Json<ApiResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::error(message.to_string())),
    )
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub runtime: Arc<Runtime>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoints
/// =============================

fn sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.kind.as_str())
        .id(event.sequence_no.to_string())
        .data(serde_json::to_string(event).unwrap_or_default())
}

/// One `context` frame with the selected candidates, then one frame per
/// `StreamEvent` until `done`. Dropping the response disconnects the session.
async fn chat_stream(State(state): State<ApiState>, Json(req): Json<ChatRequest>) -> Response {
    let Some(query) = req.user_query() else {
        return bad_request("No user query found").into_response();
    };
    info!(%query, "Streaming chat request");

    let source = state.runtime.chat(&query).await;

    let context = Event::default().event("context").data(
        json!({
            "session_id": source.session.session_id,
            "candidates": source.selection.candidates,
            "fallback": source.selection.fallback,
        })
        .to_string(),
    );

    let events = stream::once(async move { context })
        .chain(source.into_stream().map(|e| sse_event(&e)))
        .map(Ok::<_, Infallible>);

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Non-streaming variant: runs the session to `done` and returns the
/// collected answer and tool outcomes.
async fn chat(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(query) = req.user_query() else {
        return bad_request("No user query found");
    };
    info!(%query, "Chat request");

    let source = state.runtime.chat(&query).await;
    let session_id = source.session.session_id;
    let selection = source.selection.clone();
    let events = source.collect().await;

    let answer: String = events
        .iter()
        .filter(|e| e.kind == EventKind::ContentDelta)
        .filter_map(|e| e.payload.get("delta").and_then(|d| d.as_str()))
        .collect();

    let tools: Vec<&serde_json::Value> = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::ToolCompleted | EventKind::ToolError))
        .map(|e| &e.payload)
        .collect();

    let done = events
        .iter()
        .rev()
        .find(|e| e.kind == EventKind::Done)
        .map(|e| e.payload.clone())
        .unwrap_or_else(|| json!({ "status": "error", "error": "stream ended without done" }));

    let status = if done["status"] == "ok" {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };

    (
        status,
        Json(ApiResponse::success(json!({
            "session_id": session_id,
            "answer": answer,
            "candidates": selection.candidates,
            "fallback": selection.fallback,
            "tools": tools,
            "done": done,
        }))),
    )
}

/// =============================
/// Tool Endpoints
/// =============================

async fn select_tools(
    State(state): State<ApiState>,
    Json(req): Json<SelectRequest>,
) -> Json<ApiResponse> {
    let catalog = state.runtime.registry.catalog();
    let selection = state.runtime.selector.select(&req.query, &catalog).await;
    Json(ApiResponse::success(selection))
}

async fn list_tools(State(state): State<ApiState>) -> Json<ApiResponse> {
    Json(ApiResponse::success(state.runtime.registry.catalog()))
}

async fn runtime_stats(State(state): State<ApiState>) -> Json<ApiResponse> {
    Json(ApiResponse::success(json!({
        "selector": state.runtime.selector.stats(),
        "dedup": state.runtime.dedup.stats(),
        "worker_permits_available": state.runtime.executor.available_permits(),
    })))
}

/// =============================
/// Cache Endpoints
/// =============================

async fn cache_stats(State(state): State<ApiState>) -> Json<ApiResponse> {
    let stats = state.runtime.cache.stats().await;
    let by_type: serde_json::Map<String, serde_json::Value> = stats
        .into_iter()
        .map(|(t, s)| (t.to_string(), serde_json::to_value(s).unwrap_or_default()))
        .collect();
    Json(ApiResponse::success(by_type))
}

async fn cache_health(State(state): State<ApiState>) -> Json<ApiResponse> {
    Json(ApiResponse::success(state.runtime.cache.health_check()))
}

async fn clear_cache(State(state): State<ApiState>) -> Json<ApiResponse> {
    let removed = state.runtime.cache.clear(None).await;
    Json(ApiResponse::success(json!({ "removed": removed })))
}

async fn clear_cache_type(
    State(state): State<ApiState>,
    Path(cache_type): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let cache_type: CacheType = match cache_type.parse() {
        Ok(t) => t,
        Err(e) => return bad_request(&e),
    };

    let removed = state.runtime.cache.clear(Some(cache_type)).await;
    (
        StatusCode::OK,
        Json(ApiResponse::success(json!({
            "cache_type": cache_type,
            "removed": removed,
        }))),
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(runtime: Arc<Runtime>) -> Router {
    let state = ApiState { runtime };

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/select", post(select_tools))
        .route("/api/stats", get(runtime_stats))
        .route("/api/cache", delete(clear_cache))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/health", get(cache_health))
        .route("/api/cache/:cache_type", delete(clear_cache_type))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    runtime: Arc<Runtime>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(Arc::clone(&runtime));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await?;

    runtime.shutdown().await;

    Ok(())
}
