//! Tool-server registration routes. Owner-scoped like conversations; the
//! endpoint URL is stored opaquely and only ever interpreted by the
//! dispatcher.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use convoai_core::types::ServerId;
use convoai_store::types::ToolServerRegistration;

use crate::app::AppState;
use crate::auth::authenticate;
use crate::http::{error_response, store_error, ApiError};

#[derive(Deserialize)]
pub struct CreateToolServer {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub endpoint_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Deserialize)]
pub struct UpdateToolServer {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub endpoint_url: String,
    pub enabled: bool,
}

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub enabled_only: bool,
}

fn default_enabled() -> bool {
    true
}

/// POST /tool-servers
pub async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateToolServer>,
) -> Result<(StatusCode, Json<ToolServerRegistration>), ApiError> {
    let (claims, _) = authenticate(&state, &headers).map_err(error_response)?;
    let registration = state
        .store
        .create_tool_server(
            &claims.subject(),
            &body.name,
            &body.description,
            &body.endpoint_url,
            body.enabled,
        )
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(registration)))
}

/// GET /tool-servers?enabled_only=true
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> Result<Json<Vec<ToolServerRegistration>>, ApiError> {
    let (claims, _) = authenticate(&state, &headers).map_err(error_response)?;
    let registrations = state
        .store
        .list_tool_servers(&claims.subject(), params.enabled_only)
        .map_err(store_error)?;
    Ok(Json(registrations))
}

/// PUT /tool-servers/{id}
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateToolServer>,
) -> Result<Json<ToolServerRegistration>, ApiError> {
    let (claims, _) = authenticate(&state, &headers).map_err(error_response)?;
    let registration = state
        .store
        .update_tool_server(
            &ServerId::from(id.as_str()),
            &claims.subject(),
            &body.name,
            &body.description,
            &body.endpoint_url,
            body.enabled,
        )
        .map_err(store_error)?;
    Ok(Json(registration))
}

/// DELETE /tool-servers/{id}
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let (claims, _) = authenticate(&state, &headers).map_err(error_response)?;
    state
        .store
        .delete_tool_server(&ServerId::from(id.as_str()), &claims.subject(), claims.role())
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}
