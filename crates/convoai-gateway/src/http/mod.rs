pub mod analytics;
pub mod conversations;
pub mod health;
pub mod tool_servers;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use serde_json::{json, Value};

use convoai_analytics::ApiCall;
use convoai_core::ConvoError;
use convoai_store::StoreError;

use crate::app::AppState;

pub(crate) type ApiError = (StatusCode, Json<Value>);

/// Map a core error onto an HTTP status + JSON body.
pub(crate) fn error_response(err: ConvoError) -> ApiError {
    let status = match &err {
        ConvoError::InvalidToken(_) | ConvoError::ExpiredToken { .. } => StatusCode::UNAUTHORIZED,
        ConvoError::Forbidden { .. } => StatusCode::FORBIDDEN,
        ConvoError::NotFound { .. } => StatusCode::NOT_FOUND,
        ConvoError::ConversationEnded { .. } => StatusCode::CONFLICT,
        ConvoError::Backpressure => StatusCode::TOO_MANY_REQUESTS,
        ConvoError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "error": err.code(), "message": err.to_string() })),
    )
}

pub(crate) fn store_error(err: StoreError) -> ApiError {
    error_response(err.into())
}

/// Request-tracking middleware for the management surface.
///
/// Ingest, health, and WS routes are excluded — tracking the ingest routes
/// would have the gateway feeding its own telemetry back to itself forever.
pub(crate) async fn track_api(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let tracked =
        !(path.starts_with("/ingest") || path.starts_with("/health") || path.starts_with("/ws"));
    let method = req.method().to_string();
    let start = Instant::now();

    let resp = next.run(req).await;

    if tracked {
        state.emitter.emit_api_call(ApiCall {
            endpoint: path,
            method,
            subject: None,
            status: resp.status().as_u16(),
            latency_ms: start.elapsed().as_millis() as i64,
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
    }
    resp
}
