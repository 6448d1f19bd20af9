//! HTTP API handler
//!
//! | Method   | Path                           | Description                      |
//! |----------|--------------------------------|----------------------------------|
//! | `GET`    | `/health`                      | Liveness probe                   |
//! | `POST`   | `/v1/messages`                 | Run one turn (JSON or SSE)       |
//! | `GET`    | `/v1/sessions`                 | List sessions                    |
//! | `GET`    | `/v1/sessions/:id`             | Session snapshot                 |
//! | `DELETE` | `/v1/sessions/:id`             | Kill a session                   |
//! | `POST`   | `/v1/sessions/:id/interrupt`   | Interrupt the current turn       |

use crate::agent::assembler::{collect_turn, stream_turn, StreamTranslator};
use crate::agent::registry::SessionRegistry;
use crate::agent::types::{LaunchOptions, PermissionMode};
use crate::error::Error;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Header carrying the session id in both directions
pub const SESSION_HEADER: &str = "x-session-id";

/// Header carrying the credential forwarded to the agent
pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<SessionRegistry>,
    pub default_permission_mode: PermissionMode,
    pub turn_timeout: Duration,
}

/// Create the HTTP router
pub fn api_router(state: ApiState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/messages", post(create_message))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/:id", get(get_session).delete(delete_session))
        .route("/v1/sessions/:id/interrupt", post(interrupt_session))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors(cors_origins))
}

// =============================================================================
// Errors
// =============================================================================

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidSessionId(_) => StatusCode::BAD_REQUEST,
        Error::SessionNotFound(_) => StatusCode::NOT_FOUND,
        Error::SessionBusy(_) => StatusCode::CONFLICT,
        Error::Spawn(_) | Error::ProcessExited { .. } | Error::Transport(_) | Error::Agent(_) => {
            StatusCode::BAD_GATEWAY
        }
        Error::ReadinessTimeout(_) | Error::TurnTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Config(_) | Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_body(kind: &str, message: impl Into<String>) -> Json<Value> {
    Json(serde_json::json!({
        "type": "error",
        "error": {"type": kind, "message": message.into()}
    }))
}

fn error_response(err: Error) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::warn!(kind = err.kind(), "Request failed: {}", err);
    }
    (status, error_body(err.kind(), err.to_string())).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        error_body("invalid_request_error", message),
    )
        .into_response()
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    sessions: usize,
}

async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.registry.len().await,
    })
}

/// Message request body
#[derive(Debug, Deserialize)]
struct MessagesRequest {
    #[serde(default)]
    model: Option<String>,
    messages: Vec<InputMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    permission_mode: Option<PermissionMode>,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InputMessage {
    role: String,
    content: Value,
}

/// Run one turn on a new or existing session
async fn create_message(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<MessagesRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    // The agent keeps the history; only the newest user message is sent
    let Some(content) = request
        .messages
        .into_iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content)
    else {
        return bad_request("messages must contain at least one user message");
    };

    let session_id = request.session_id.or_else(|| header_str(&headers, SESSION_HEADER));
    let options = LaunchOptions {
        model: request.model,
        permission_mode: request
            .permission_mode
            .unwrap_or(state.default_permission_mode),
        cwd: request.cwd,
        api_key: header_str(&headers, API_KEY_HEADER),
    };

    let (session_id, info, is_new) = match state.registry.get_or_create(session_id, options).await {
        Ok(created) => created,
        Err(e) => return error_response(e),
    };
    let events = match state.registry.start_turn(&session_id, content).await {
        Ok(events) => events,
        Err(e) => return error_response(e),
    };
    tracing::info!(session_id = %session_id, is_new, stream = request.stream, "Turn started");

    let mut response = if request.stream {
        let translator = StreamTranslator::new(info.model.clone());
        let events = stream_turn(session_id.clone(), events, translator, state.turn_timeout).map(
            |event| {
                let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                Ok::<_, Infallible>(Event::default().event(event.event_type()).data(data))
            },
        );
        Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response()
    } else {
        match collect_turn(&session_id, events, state.turn_timeout).await {
            Ok(assembled) => Json(assembled).into_response(),
            Err(e) => error_response(e),
        }
    };

    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

async fn list_sessions(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

async fn get_session(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id).await {
        Some(info) => Json(info).into_response(),
        None => error_response(Error::SessionNotFound(id)),
    }
}

async fn delete_session(State(state): State<ApiState>, Path(id): Path<String>) -> StatusCode {
    state.registry.kill(&id).await;
    StatusCode::NO_CONTENT
}

async fn interrupt_session(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.registry.interrupt(&id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"session_id": id, "status": "interrupt_sent"})),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// =============================================================================
// CORS
// =============================================================================

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::HeaderName::from_static(SESSION_HEADER),
            header::HeaderName::from_static(API_KEY_HEADER),
        ])
        .expose_headers([header::HeaderName::from_static(SESSION_HEADER)]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        cors.allow_origin(parsed)
    }
}
