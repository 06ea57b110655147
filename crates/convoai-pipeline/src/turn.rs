//! The completion loop: prompt → model → (tool → model)* → terminal message.
//!
//! Tool failures are absorbed into the loop as tool results; model failures
//! surface to the caller after bounded retries; the terminal assistant
//! message is persisted before this function returns, so the gateway can
//! only ever stream durable messages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use convoai_analytics::{AnalyticsEmitter, MessageMetric};
use convoai_core::config::ModelConfig;
use convoai_core::types::MessageRole;
use convoai_dispatch::{ToolCatalog, ToolDispatcher};
use convoai_store::error::StoreError;
use convoai_store::types::{Conversation, Message, NewMessage};
use convoai_store::StoreManager;

use crate::provider::{
    ChatProvider, ChatRequest, Completion, ProviderError, Role, ToolDefinition,
};

/// How many prior messages the model sees each turn.
const HISTORY_WINDOW: usize = 20;

/// Maximum tool hops per turn. A confused model that keeps electing tools
/// gets this terminal text instead of an unbounded loop.
const TOOL_HOP_BUDGET: usize = 5;
const BUDGET_EXHAUSTED_TEXT: &str = "tool budget exhausted";

/// Model invocation retries after the first failure.
const MODEL_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("turn timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("turn cancelled")]
    Cancelled,
}

impl From<TurnError> for convoai_core::ConvoError {
    fn from(e: TurnError) -> Self {
        use convoai_core::ConvoError;
        match e {
            TurnError::Store(e) => e.into(),
            TurnError::ModelUnavailable(m) => ConvoError::ModelUnavailable(m),
            TurnError::Timeout { ms } => ConvoError::Timeout { ms },
            TurnError::Cancelled => ConvoError::Internal("turn cancelled".to_string()),
        }
    }
}

/// Orchestrates one turn end to end. Shared across sessions; all per-turn
/// state lives on the stack of `run_turn`.
pub struct ModelPipeline {
    store: Arc<StoreManager>,
    dispatcher: Arc<dyn ToolDispatcher>,
    provider: Arc<dyn ChatProvider>,
    emitter: AnalyticsEmitter,
    config: ModelConfig,
}

impl ModelPipeline {
    pub fn new(
        store: Arc<StoreManager>,
        dispatcher: Arc<dyn ToolDispatcher>,
        provider: Arc<dyn ChatProvider>,
        emitter: AnalyticsEmitter,
        config: ModelConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            provider,
            emitter,
            config,
        }
    }

    /// Run one full turn for an already-authorized session.
    ///
    /// Returns the persisted terminal assistant message. On cancellation or
    /// error no assistant message is persisted — the user message is, since
    /// it was received.
    pub async fn run_turn(
        &self,
        conversation: &Conversation,
        content: &str,
        bearer_token: &str,
        cancel: &CancellationToken,
    ) -> Result<Message, TurnError> {
        let turn_start = Instant::now();

        let user_message = self.store.append_message(
            &conversation.id,
            NewMessage::text(MessageRole::User, content),
        )?;
        self.emit_metric(conversation, &user_message);

        // Fresh catalog every turn: a server enabled a second ago is already
        // visible, a disabled one is already gone. Empty is fine.
        let catalog = self
            .dispatcher
            .discover(&conversation.owner_subject, bearer_token)
            .await;
        let tools = function_specs(&catalog);

        let history = self
            .store
            .recent_messages(&conversation.id, HISTORY_WINDOW)?;
        let mut raw_messages: Vec<serde_json::Value> = history
            .iter()
            .filter_map(|m| {
                prompt_role(m.role).map(|role| {
                    json!({
                        "role": role,
                        "content": m.content,
                    })
                })
            })
            .collect();

        let system = conversation.system_prompt.clone().unwrap_or_default();

        let mut hops = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }

            let request = ChatRequest {
                model: self.config.model.clone(),
                system: system.clone(),
                messages: Vec::new(),
                max_tokens: self.config.max_tokens,
                tools: tools.clone(),
                raw_messages: Some(raw_messages.clone()),
            };

            let completion = self.call_model(&request, cancel).await?;

            if completion.is_terminal() {
                info!(
                    conversation = %conversation.id,
                    hops,
                    tokens_out = completion.tokens_out,
                    "turn complete"
                );
                return self.finish_turn(conversation, completion, turn_start);
            }

            if hops == TOOL_HOP_BUDGET {
                warn!(
                    conversation = %conversation.id,
                    budget = TOOL_HOP_BUDGET,
                    "tool hop budget exhausted, coercing terminal message"
                );
                let coerced = Completion {
                    content: BUDGET_EXHAUSTED_TEXT.to_string(),
                    model: completion.model,
                    tokens_in: 0,
                    tokens_out: 0,
                    stop_reason: "budget_exhausted".to_string(),
                    tool_calls: Vec::new(),
                };
                return self.finish_turn(conversation, coerced, turn_start);
            }
            hops += 1;

            // Working-context records only — tool hops are never persisted.
            raw_messages.push(assistant_tool_call_record(&completion));
            for call in &completion.tool_calls {
                if cancel.is_cancelled() {
                    return Err(TurnError::Cancelled);
                }
                let result_text = match self
                    .dispatcher
                    .invoke(&catalog, &call.name, &call.arguments, bearer_token)
                    .await
                {
                    Ok(value) => value.to_string(),
                    // fed back to the model, which may recover or apologise
                    Err(failure) => failure.render(),
                };
                debug!(tool = %call.name, "tool result injected");
                raw_messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": result_text,
                }));
            }
        }
    }

    /// Bounded-retry model call with an independent deadline and the
    /// session's cancellation signal.
    async fn call_model(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, TurnError> {
        let deadline = Duration::from_secs(self.config.call_timeout_secs);
        let mut delay = RETRY_BASE_DELAY;
        let mut last_err: Option<ProviderError> = None;

        for attempt in 0..=MODEL_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                outcome = tokio::time::timeout(deadline, self.provider.complete(request)) => {
                    match outcome {
                        Err(_) => {
                            return Err(TurnError::Timeout {
                                ms: deadline.as_millis() as u64,
                            })
                        }
                        Ok(Ok(completion)) => return Ok(completion),
                        Ok(Err(ProviderError::Cancelled)) => return Err(TurnError::Cancelled),
                        Ok(Err(ProviderError::RateLimited { retry_after_ms })) => {
                            warn!(attempt, retry_after_ms, "model rate limited");
                            delay = delay.max(Duration::from_millis(retry_after_ms));
                            last_err = Some(ProviderError::RateLimited { retry_after_ms });
                        }
                        Ok(Err(e)) => {
                            warn!(attempt, error = %e, provider = self.provider.name(), "model call failed");
                            last_err = Some(e);
                        }
                    }
                }
            }
        }

        Err(TurnError::ModelUnavailable(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "retries exhausted".to_string()),
        ))
    }

    /// Persist the terminal assistant message, then account for it.
    fn finish_turn(
        &self,
        conversation: &Conversation,
        completion: Completion,
        turn_start: Instant,
    ) -> Result<Message, TurnError> {
        let response_time_ms = turn_start.elapsed().as_millis() as i64;
        let token_count = (completion.tokens_out > 0).then_some(completion.tokens_out);

        let message = self.store.append_message(
            &conversation.id,
            NewMessage {
                role: MessageRole::Assistant,
                content: completion.content,
                token_count,
                response_time_ms: Some(response_time_ms),
                model_name: Some(completion.model),
            },
        )?;
        self.emit_metric(conversation, &message);
        Ok(message)
    }

    fn emit_metric(&self, conversation: &Conversation, message: &Message) {
        self.emitter.emit_message_metric(MessageMetric {
            message_id: message.id.as_str().to_string(),
            conversation_id: conversation.id.as_str().to_string(),
            subject: conversation.owner_subject.as_str().to_string(),
            role: message.role.to_string(),
            token_count: message.token_count,
            // milliseconds were the measurement; the division adds no rounding
            response_time_s: message.response_time_ms.map(|ms| ms as f64 / 1000.0),
            model_name: message.model_name.clone(),
            timestamp: message.created_at.clone(),
        });
    }
}

fn function_specs(catalog: &ToolCatalog) -> Vec<ToolDefinition> {
    catalog
        .tools()
        .iter()
        .map(|t| ToolDefinition {
            name: t.presented_name.clone(),
            description: t.description.clone(),
            parameters: t.parameter_schema.clone(),
        })
        .collect()
}

/// Persisted roles → model role vocabulary. Tool-hop records never persist,
/// so a stored `tool` role has nothing to map to and is skipped.
fn prompt_role(role: MessageRole) -> Option<Role> {
    match role {
        MessageRole::User => Some(Role::User),
        MessageRole::Assistant => Some(Role::Assistant),
        MessageRole::System => Some(Role::System),
        MessageRole::Tool => None,
    }
}

fn assistant_tool_call_record(completion: &Completion) -> serde_json::Value {
    let calls: Vec<serde_json::Value> = completion
        .tool_calls
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "type": "function",
                "function": {
                    "name": c.name,
                    "arguments": c.arguments.to_string(),
                }
            })
        })
        .collect();
    json!({
        "role": "assistant",
        "content": if completion.content.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::String(completion.content.clone())
        },
        "tool_calls": calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rusqlite::Connection;

    use convoai_core::types::{Subject, UserRole};
    use convoai_dispatch::rpc::AdvertisedTool;
    use convoai_dispatch::{FailureKind, ToolFailure};

    struct StubProvider {
        script: Mutex<VecDeque<Result<Completion, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn new(script: Vec<Result<Completion, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, _req: &ChatRequest) -> Result<Completion, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Unavailable("script exhausted".into())))
        }
    }

    struct StubDispatcher {
        catalog: ToolCatalog,
        results: Mutex<VecDeque<Result<serde_json::Value, ToolFailure>>>,
        invocations: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl StubDispatcher {
        fn empty() -> Self {
            Self {
                catalog: ToolCatalog::new(),
                results: Mutex::new(VecDeque::new()),
                invocations: Mutex::new(Vec::new()),
            }
        }

        fn with_clock_tool(results: Vec<Result<serde_json::Value, ToolFailure>>) -> Self {
            let mut catalog = ToolCatalog::new();
            catalog.add_server_tools(
                &convoai_core::types::ServerId::from("s1"),
                "http://s1",
                vec![AdvertisedTool {
                    name: "get_current_time".to_string(),
                    description: "clock".to_string(),
                    parameters: json!({"type": "object"}),
                }],
            );
            Self {
                catalog,
                results: Mutex::new(results.into_iter().collect()),
                invocations: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolDispatcher for StubDispatcher {
        async fn discover(&self, _owner: &Subject, _bearer_token: &str) -> ToolCatalog {
            self.catalog.clone()
        }

        async fn invoke(
            &self,
            _catalog: &ToolCatalog,
            presented_name: &str,
            arguments: &serde_json::Value,
            _bearer_token: &str,
        ) -> Result<serde_json::Value, ToolFailure> {
            self.invocations
                .lock()
                .unwrap()
                .push((presented_name.to_string(), arguments.clone()));
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ToolFailure::new(FailureKind::UnknownTool, "no result")))
        }
    }

    fn terminal(content: &str, tokens_out: u32) -> Completion {
        Completion {
            content: content.to_string(),
            model: "stub-model".to_string(),
            tokens_in: 10,
            tokens_out,
            stop_reason: "stop".to_string(),
            tool_calls: Vec::new(),
        }
    }

    fn tool_election(name: &str) -> Completion {
        Completion {
            content: String::new(),
            model: "stub-model".to_string(),
            tokens_in: 10,
            tokens_out: 2,
            stop_reason: "tool_use".to_string(),
            tool_calls: vec![crate::provider::ToolCall {
                id: "call_1".to_string(),
                name: name.to_string(),
                arguments: json!({"tz": "Asia/Tokyo"}),
            }],
        }
    }

    fn store() -> Arc<StoreManager> {
        let conn = Connection::open_in_memory().unwrap();
        convoai_store::db::init_db(&conn).unwrap();
        Arc::new(StoreManager::new(conn))
    }

    fn pipeline(
        store: Arc<StoreManager>,
        dispatcher: Arc<StubDispatcher>,
        provider: Arc<StubProvider>,
    ) -> ModelPipeline {
        ModelPipeline::new(
            store,
            dispatcher,
            provider,
            AnalyticsEmitter::disabled(),
            ModelConfig {
                api_key: "test".to_string(),
                base_url: "http://unused".to_string(),
                model: "stub-model".to_string(),
                max_tokens: 512,
                call_timeout_secs: 5,
            },
        )
    }

    fn conversation(store: &StoreManager) -> Conversation {
        store
            .create_conversation(&Subject::from("alice"), "chat", None)
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_persists_assistant_with_accounting() {
        let store = store();
        let c = conversation(&store);
        let provider = Arc::new(StubProvider::new(vec![Ok(terminal("hi alice", 3))]));
        let pipeline = pipeline(store.clone(), Arc::new(StubDispatcher::empty()), provider);

        let message = pipeline
            .run_turn(&c, "hello", "tok", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(message.content, "hi alice");
        assert_eq!(message.token_count, Some(3));
        assert!(message.response_time_ms.unwrap() >= 0);

        let history = store
            .list_messages(&c.id, &Subject::from("alice"), UserRole::User)
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn tool_roundtrip_injects_result_and_persists_only_terminal() {
        let store = store();
        let c = conversation(&store);
        let provider = Arc::new(StubProvider::new(vec![
            Ok(tool_election("get_current_time")),
            Ok(terminal("It is 12:00 in Tokyo.", 8)),
        ]));
        let dispatcher = Arc::new(StubDispatcher::with_clock_tool(vec![Ok(json!(
            "2025-01-01T12:00:00+09:00"
        ))]));
        let pipeline = pipeline(store.clone(), dispatcher.clone(), provider.clone());

        let message = pipeline
            .run_turn(&c, "what time is it in Tokyo?", "T_A", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(message.content, "It is 12:00 in Tokyo.");

        let invocations = dispatcher.invocations.lock().unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].0, "get_current_time");
        assert_eq!(invocations[0].1["tz"], "Asia/Tokyo");

        // only user + terminal assistant persisted, tool hops stay in memory
        let history = store
            .list_messages(&c.id, &Subject::from("alice"), UserRole::User)
            .unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn tool_failure_feeds_back_into_the_loop() {
        let store = store();
        let c = conversation(&store);
        let provider = Arc::new(StubProvider::new(vec![
            Ok(tool_election("get_current_time")),
            Ok(terminal("sorry, the clock is down", 5)),
        ]));
        let dispatcher = Arc::new(StubDispatcher::with_clock_tool(vec![Err(ToolFailure::new(
            FailureKind::Timeout,
            "deadline exceeded",
        ))]));
        let pipeline = pipeline(store.clone(), dispatcher, provider);

        // a dead tool server never aborts the turn
        let message = pipeline
            .run_turn(&c, "time?", "tok", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(message.content, "sorry, the clock is down");
    }

    #[tokio::test]
    async fn hop_budget_coerces_terminal_message() {
        let store = store();
        let c = conversation(&store);
        let script: Vec<Result<Completion, ProviderError>> = (0..10)
            .map(|_| Ok(tool_election("get_current_time")))
            .collect();
        let provider = Arc::new(StubProvider::new(script));
        let results = (0..10).map(|_| Ok(json!("12:00"))).collect();
        let dispatcher = Arc::new(StubDispatcher::with_clock_tool(results));
        let pipeline = pipeline(store.clone(), dispatcher.clone(), provider.clone());

        let message = pipeline
            .run_turn(&c, "loop forever", "tok", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(message.content, "tool budget exhausted");
        // budget+1 model calls, budget tool executions
        assert_eq!(provider.calls.load(Ordering::SeqCst), TOOL_HOP_BUDGET + 1);
        assert_eq!(dispatcher.invocations.lock().unwrap().len(), TOOL_HOP_BUDGET);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_surfaces_model_unavailable() {
        let store = store();
        let c = conversation(&store);
        let provider = Arc::new(StubProvider::new(vec![
            Err(ProviderError::Unavailable("down".into())),
            Err(ProviderError::Unavailable("down".into())),
            Err(ProviderError::Unavailable("down".into())),
        ]));
        let pipeline = pipeline(store.clone(), Arc::new(StubDispatcher::empty()), provider.clone());

        let err = pipeline
            .run_turn(&c, "hello", "tok", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::ModelUnavailable(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1 + MODEL_RETRIES as usize);

        // no partial assistant message persisted
        let history = store
            .list_messages(&c.id, &Subject::from("alice"), UserRole::User)
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_turn_persists_no_assistant_message() {
        let store = store();
        let c = conversation(&store);
        let provider = Arc::new(StubProvider::new(vec![Ok(terminal("never sent", 1))]));
        let pipeline = pipeline(store.clone(), Arc::new(StubDispatcher::empty()), provider);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline.run_turn(&c, "hello", "tok", &cancel).await.unwrap_err();
        assert!(matches!(err, TurnError::Cancelled));

        let history = store
            .list_messages(&c.id, &Subject::from("alice"), UserRole::User)
            .unwrap();
        assert!(history.iter().all(|m| m.role != MessageRole::Assistant));
    }

    #[tokio::test]
    async fn ended_conversation_rejects_the_turn() {
        let store = store();
        let c = conversation(&store);
        store.end_conversation(&c.id, &Subject::from("alice")).unwrap();

        let provider = Arc::new(StubProvider::new(vec![Ok(terminal("unused", 1))]));
        let pipeline = pipeline(store, Arc::new(StubDispatcher::empty()), provider);

        let err = pipeline
            .run_turn(&c, "hello", "tok", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Store(StoreError::Ended { .. })));
    }
}
