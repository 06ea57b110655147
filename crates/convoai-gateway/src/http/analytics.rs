//! Analytics HTTP surface.
//!
//! Ingest routes consult no bearer token; the peer must instead sit inside
//! the private network. Query routes require a token-verified admin.

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use convoai_analytics::query::{ActivityFilter, Summary, TopUser};
use convoai_analytics::{
    Activity, AnalyticsError, ApiCall, ConversationLifecycle, MessageMetric,
};
use convoai_core::ConvoError;

use crate::app::AppState;
use crate::auth::authenticate;
use crate::http::{error_response, ApiError};
use crate::net::is_private_addr;

fn analytics_error(err: AnalyticsError) -> ApiError {
    match err {
        AnalyticsError::RollupNotFound { conversation_id } => error_response(ConvoError::NotFound {
            what: "rollup",
            id: conversation_id,
        }),
        AnalyticsError::Database(e) => error_response(ConvoError::Database(e.to_string())),
    }
}

/// Reject ingest requests that did not originate inside the private
/// network. No token is consulted on this surface.
fn ensure_private(addr: SocketAddr) -> Result<(), ApiError> {
    if is_private_addr(addr.ip()) {
        Ok(())
    } else {
        warn!(peer = %addr, "ingest request from outside the private network");
        Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "FORBIDDEN", "message": "ingest is intra-cluster only" })),
        ))
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let (claims, _) = authenticate(state, headers).map_err(error_response)?;
    if claims.is_admin() {
        Ok(())
    } else {
        Err(error_response(ConvoError::Forbidden {
            reason: "admin role required".to_string(),
        }))
    }
}

// ── ingest (private network, fire-and-forget callers) ─────────────────────

/// POST /ingest/activity
pub async fn ingest_activity(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(event): Json<Activity>,
) -> Result<StatusCode, ApiError> {
    ensure_private(addr)?;
    state
        .analytics
        .record_activity(&event)
        .map_err(analytics_error)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /ingest/api-call
pub async fn ingest_api_call(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(event): Json<ApiCall>,
) -> Result<StatusCode, ApiError> {
    ensure_private(addr)?;
    state
        .analytics
        .record_api_call(&event)
        .map_err(analytics_error)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /ingest/conversation
pub async fn ingest_lifecycle(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(event): Json<ConversationLifecycle>,
) -> Result<StatusCode, ApiError> {
    ensure_private(addr)?;
    state
        .analytics
        .record_lifecycle(&event)
        .map_err(analytics_error)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /ingest/message — the rollup-updating path. Serialized per
/// conversation inside the analytics manager.
pub async fn ingest_message_metric(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(event): Json<MessageMetric>,
) -> Result<StatusCode, ApiError> {
    ensure_private(addr)?;
    state
        .analytics
        .record_message_metric(&event)
        .map_err(analytics_error)?;
    Ok(StatusCode::ACCEPTED)
}

// ── query (admin bearer) ──────────────────────────────────────────────────

/// GET /analytics/summary
pub async fn summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Summary>, ApiError> {
    require_admin(&state, &headers)?;
    let summary = state.analytics.summary().map_err(analytics_error)?;
    Ok(Json(summary))
}

#[derive(Deserialize)]
pub struct TopUsersParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// GET /analytics/top-users?limit=10
pub async fn top_users(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TopUsersParams>,
    headers: HeaderMap,
) -> Result<Json<Vec<TopUser>>, ApiError> {
    require_admin(&state, &headers)?;
    let users = state
        .analytics
        .top_users(params.limit.min(100))
        .map_err(analytics_error)?;
    Ok(Json(users))
}

#[derive(Deserialize)]
pub struct ActivitiesParams {
    pub subject: Option<String>,
    pub kind: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub skip: usize,
}

/// GET /analytics/activities?subject=&kind=&limit=&skip=
pub async fn activities(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ActivitiesParams>,
    headers: HeaderMap,
) -> Result<Json<Vec<Activity>>, ApiError> {
    require_admin(&state, &headers)?;
    let filter = ActivityFilter {
        subject: params.subject,
        kind: params.kind,
    };
    let rows = state
        .analytics
        .user_activities(&filter, params.limit.min(500), params.skip)
        .map_err(analytics_error)?;
    Ok(Json(rows))
}

/// GET /analytics/conversations/{id}
pub async fn conversation_rollup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    let rollup = state
        .analytics
        .conversation_rollup(&id)
        .map_err(analytics_error)?;
    Ok(Json(serde_json::to_value(rollup).unwrap_or(Value::Null)))
}

/// DELETE /analytics — destructive reset, admin only.
pub async fn clear_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    require_admin(&state, &headers)?;
    state.analytics.clear_all().map_err(analytics_error)?;
    Ok(StatusCode::NO_CONTENT)
}
