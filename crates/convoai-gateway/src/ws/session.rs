//! The streaming front door — one session per WS connection, bound to a
//! conversation at open.
//!
//! Session lifecycle: authenticate → authorize against the conversation →
//! serve turns strictly one at a time. Client disconnect cancels the
//! in-flight turn cooperatively; every assistant frame the session ever
//! streams was persisted before the pipeline returned it.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use convoai_analytics::Activity;
use convoai_core::config::MAX_PAYLOAD_BYTES;
use convoai_core::types::{ConversationId, MessageRole};
use convoai_core::ConvoError;
use convoai_pipeline::{ModelPipeline, TurnError};
use convoai_protocol::frames::{ClientFrame, ServerFrame};
use convoai_store::types::Conversation;

use crate::app::AppState;
use crate::auth::extract_token;

#[derive(Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// Axum handler — upgrades HTTP to WebSocket at GET /ws/{conversation_id}.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(conversation_id): Path<String>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let token = extract_token(&headers, params.token.as_deref());
    ws.on_upgrade(move |socket| handle_session(socket, state, conversation_id, token))
}

type WsSink = futures_util::stream::SplitSink<WebSocket, WsMessage>;

/// Per-session task — lives for the entire WS connection lifetime.
async fn handle_session(
    socket: WebSocket,
    state: Arc<AppState>,
    conversation_id: String,
    token: Result<String, ConvoError>,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, conversation = %conversation_id, "new session");

    let (mut tx, mut rx) = socket.split();

    // Authenticate, then authorize the binding to this conversation. Either
    // failure closes the stream after a single error frame — no retry.
    let (claims, token) = match token.and_then(|t| Ok((state.verifier.verify(&t)?, t))) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(conn_id, error = %e, "session auth failed");
            let _ = send_frame(&mut tx, &ServerFrame::error(&e)).await;
            return;
        }
    };
    let subject = claims.subject();
    let conversation = match state.store.get_conversation(
        &ConversationId::from(conversation_id.as_str()),
        &subject,
        claims.role(),
    ) {
        Ok(c) => c,
        Err(e) => {
            warn!(conn_id, subject = %subject, error = %e, "session authorization failed");
            let _ = send_frame(&mut tx, &ServerFrame::error(&e.into())).await;
            return;
        }
    };

    info!(conn_id, subject = %subject, "session open");
    state.emitter.emit_activity(Activity {
        subject: subject.as_str().to_string(),
        kind: "conversation_started".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        metadata: Some(serde_json::json!({ "conversation_id": conversation.id.as_str() })),
    });

    let session_cancel = CancellationToken::new();
    state
        .active_turns
        .insert(conn_id.clone(), session_cancel.clone());

    // Turn results come back over a channel so the select loop stays free to
    // notice a disconnect while a turn is in flight.
    let (turn_tx, mut turn_rx) =
        mpsc::channel::<Result<convoai_store::types::Message, TurnError>>(2);
    let mut in_flight = false;
    let mut queued: Option<String> = None;

    loop {
        tokio::select! {
            frame = rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let text_ref: &str = &text;
                        if text_ref.len() > MAX_PAYLOAD_BYTES {
                            warn!(conn_id, size = text_ref.len(), "payload too large, dropping session");
                            break;
                        }
                        match ClientFrame::parse(text_ref) {
                            Ok(ClientFrame::SendMessage { content }) => {
                                if !in_flight {
                                    in_flight = true;
                                    spawn_turn(
                                        Arc::clone(&state.pipeline),
                                        conversation.clone(),
                                        content,
                                        token.clone(),
                                        session_cancel.child_token(),
                                        turn_tx.clone(),
                                    );
                                } else if queued.is_none() {
                                    queued = Some(content);
                                } else {
                                    // queue depth 1: reject rather than buffer
                                    let _ = send_frame(
                                        &mut tx,
                                        &ServerFrame::error(&ConvoError::Backpressure),
                                    )
                                    .await;
                                }
                            }
                            Ok(ClientFrame::End) => break,
                            Err(e) => {
                                warn!(conn_id, error = %e, "malformed frame");
                                let _ = send_frame(&mut tx, &ServerFrame::error(&e)).await;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = tx.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    _ => {}
                }
            }

            Some(outcome) = turn_rx.recv() => {
                in_flight = false;
                match outcome {
                    Ok(message) => {
                        // persisted by the pipeline before we ever see it
                        let frame = ServerFrame::message(
                            MessageRole::Assistant,
                            message.content,
                            message.id.as_str(),
                            message.created_at,
                        );
                        if send_frame(&mut tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(TurnError::Cancelled) => break,
                    Err(e) => {
                        let err: ConvoError = e.into();
                        warn!(conn_id, error = %err, "turn failed");
                        let fatal = err.is_session_fatal();
                        let _ = send_frame(&mut tx, &ServerFrame::error(&err)).await;
                        if fatal {
                            break;
                        }
                    }
                }
                if let Some(content) = queued.take() {
                    in_flight = true;
                    spawn_turn(
                        Arc::clone(&state.pipeline),
                        conversation.clone(),
                        content,
                        token.clone(),
                        session_cancel.child_token(),
                        turn_tx.clone(),
                    );
                }
            }
        }
    }

    // Disconnect or client end: cancel whatever is still running. A partial
    // assistant message is discarded by the pipeline, never persisted.
    session_cancel.cancel();
    state.active_turns.remove(&conn_id);
    state.emitter.emit_activity(Activity {
        subject: subject.as_str().to_string(),
        kind: "conversation_ended".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        metadata: Some(serde_json::json!({ "conversation_id": conversation.id.as_str() })),
    });
    info!(conn_id, "session closed");
}

fn spawn_turn(
    pipeline: Arc<ModelPipeline>,
    conversation: Conversation,
    content: String,
    token: String,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<convoai_store::types::Message, TurnError>>,
) {
    tokio::spawn(async move {
        let result = pipeline
            .run_turn(&conversation, &content, &token, &cancel)
            .await;
        let _ = tx.send(result).await;
    });
}

/// Serialize and send a frame over the WS sink.
async fn send_frame(tx: &mut WsSink, frame: &ServerFrame) -> Result<(), axum::Error> {
    tx.send(WsMessage::Text(frame.to_json().into()))
        .await
        .map_err(axum::Error::new)
}
