//! Conversation management routes.
//!
//! Each handler authenticates the bearer token, delegates to the store
//! (which applies the owner/admin predicates), and emits lifecycle events
//! fire-and-forget.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use convoai_analytics::events::LifecycleAction;
use convoai_analytics::ConversationLifecycle;
use convoai_core::types::ConversationId;
use convoai_store::types::{Conversation, Message};

use crate::app::AppState;
use crate::auth::authenticate;
use crate::http::{error_response, store_error, ApiError};

#[derive(Deserialize)]
pub struct CreateConversation {
    pub title: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// POST /conversations
pub async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateConversation>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let (claims, _) = authenticate(&state, &headers).map_err(error_response)?;
    let subject = claims.subject();

    let conversation = state
        .store
        .create_conversation(&subject, &body.title, body.system_prompt.as_deref())
        .map_err(store_error)?;

    state.emitter.emit_lifecycle(ConversationLifecycle {
        conversation_id: conversation.id.as_str().to_string(),
        subject: subject.as_str().to_string(),
        action: LifecycleAction::Created,
        timestamp: chrono::Utc::now().to_rfc3339(),
    });

    Ok((StatusCode::CREATED, Json(conversation)))
}

/// GET /conversations — the requester's own conversations, newest first.
pub async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let (claims, _) = authenticate(&state, &headers).map_err(error_response)?;
    let conversations = state
        .store
        .list_conversations(&claims.subject())
        .map_err(store_error)?;
    Ok(Json(conversations))
}

/// GET /conversations/{id}
pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Conversation>, ApiError> {
    let (claims, _) = authenticate(&state, &headers).map_err(error_response)?;
    let conversation = state
        .store
        .get_conversation(
            &ConversationId::from(id.as_str()),
            &claims.subject(),
            claims.role(),
        )
        .map_err(store_error)?;
    Ok(Json(conversation))
}

/// DELETE /conversations/{id} — cascades to messages; analytics rows for the
/// conversation are audit data and survive.
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let (claims, _) = authenticate(&state, &headers).map_err(error_response)?;
    let subject = claims.subject();

    state
        .store
        .delete_conversation(&ConversationId::from(id.as_str()), &subject, claims.role())
        .map_err(store_error)?;

    state.emitter.emit_lifecycle(ConversationLifecycle {
        conversation_id: id,
        subject: subject.as_str().to_string(),
        action: LifecycleAction::Deleted,
        timestamp: chrono::Utc::now().to_rfc3339(),
    });

    Ok(StatusCode::NO_CONTENT)
}

/// POST /conversations/{id}/end — marks the conversation terminal.
pub async fn end(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let (claims, _) = authenticate(&state, &headers).map_err(error_response)?;
    state
        .store
        .end_conversation(&ConversationId::from(id.as_str()), &claims.subject())
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /conversations/{id}/messages — the persisted history, oldest first.
/// Reconnecting clients use this as their sole continuity mechanism.
pub async fn messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Message>>, ApiError> {
    let (claims, _) = authenticate(&state, &headers).map_err(error_response)?;
    let messages = state
        .store
        .list_messages(
            &ConversationId::from(id.as_str()),
            &claims.subject(),
            claims.role(),
        )
        .map_err(store_error)?;
    Ok(Json(messages))
}
