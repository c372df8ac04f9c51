//! Axum-based HTTP gateway for the inspector surface.
//!
//! Four routes: health, session listing, the live SSE event stream, and the
//! trace read path. The gateway owns no state of its own — it serves the
//! event stream and registry the hook subscribers feed, and derives session
//! lists straight from the trace directory on every request.

use crate::config::Config;
use crate::error::ReadError;
use crate::events::EventStream;
use crate::registry::SessionRegistry;
use crate::{sessions, stream};
use anyhow::Result;
use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Response, StatusCode, header},
    response::{IntoResponse, Json},
    routing::get,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

/// Maximum request body size (16KB) — the surface is read-only, bodies are
/// never meaningful.
pub const MAX_BODY_SIZE: usize = 16_384;

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub traces_dir: PathBuf,
    pub events: Arc<EventStream>,
    pub registry: Arc<SessionRegistry>,
}

/// Run the HTTP gateway on the configured host and port.
pub async fn run_gateway(
    config: &Config,
    events: Arc<EventStream>,
    registry: Arc<SessionRegistry>,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    run_gateway_with_listener(listener, config, events, registry).await
}

/// Run the HTTP gateway from a pre-bound listener.
pub async fn run_gateway_with_listener(
    listener: tokio::net::TcpListener,
    config: &Config,
    events: Arc<EventStream>,
    registry: Arc<SessionRegistry>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    let state = AppState {
        traces_dir: config.traces_dir(),
        events,
        registry,
    };

    tracing::info!(%addr, traces_dir = %state.traces_dir.display(), "tracelens gateway listening");

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/sessions", get(handle_sessions))
        .route("/events", get(handle_events))
        .route("/trace/{session_id}", get(handle_trace))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any));

    axum::serve(listener, app).await?;
    Ok(())
}

/// GET /health — name and version, nothing sensitive.
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": crate::SERVICE_NAME,
        "version": crate::VERSION,
    }))
}

/// GET /sessions — derived from trace files on every call, newest first.
async fn handle_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = sessions::list_sessions(&state.traces_dir).await;
    Json(serde_json::json!({ "sessions": sessions }))
}

/// GET /events — long-lived SSE stream of session lifecycle events.
async fn handle_events(State(state): State<AppState>) -> Response<Body> {
    crate::events::sse_response(Arc::clone(&state.events))
}

/// GET /trace/{session_id} — full, ranged, or conditional trace read.
async fn handle_trace(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response<Body> {
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

    match stream::serve_trace(&state.traces_dir, &session_id, if_none_match, range).await {
        Ok(response) => response,
        Err(error) => read_error_response(&session_id, &error),
    }
}

/// Map a [`ReadError`] to its HTTP status; messages stay path-free.
fn read_error_response(session_id: &str, error: &ReadError) -> Response<Body> {
    let status = match error {
        ReadError::BadId | ReadError::BadFormat | ReadError::BadRange => StatusCode::BAD_REQUEST,
        ReadError::NotFound => StatusCode::NOT_FOUND,
        ReadError::Forbidden => StatusCode::FORBIDDEN,
        ReadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(session = session_id, %error, "trace read failed");
    }
    let message = match error {
        ReadError::Io(_) => "internal error".to_string(),
        other => other.to_string(),
    };
    let body = serde_json::json!({ "error": message });
    (status, Json(body)).into_response()
}
