use std::path::Path;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use convoai_analytics::{AnalyticsEmitter, AnalyticsManager};
use convoai_core::config::ConvoConfig;
use convoai_core::ConvoError;
use convoai_dispatch::HttpDispatcher;
use convoai_identity::Verifier;
use convoai_pipeline::{ModelPipeline, OpenAiProvider};
use convoai_store::{StoreManager, ToolRegistry};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: ConvoConfig,
    pub verifier: Verifier,
    pub store: Arc<StoreManager>,
    pub analytics: Arc<AnalyticsManager>,
    pub pipeline: Arc<ModelPipeline>,
    pub emitter: AnalyticsEmitter,
    /// In-flight turns: session conn_id -> cancellation token. Sessions
    /// register here so a process shutdown can cancel cooperatively.
    pub active_turns: DashMap<String, CancellationToken>,
}

impl AppState {
    pub fn new(config: ConvoConfig, verifier: Verifier) -> Result<Self, ConvoError> {
        let store = Arc::new(StoreManager::new(open_db(
            &config.database.conversation_path,
            convoai_store::db::init_db,
        )?));
        let analytics = Arc::new(AnalyticsManager::new(open_db(
            &config.database.analytics_path,
            convoai_analytics::db::init_db,
        )?));

        let emitter = AnalyticsEmitter::new(config.analytics.ingest_base_url.clone());
        let registry = ToolRegistry::new(Arc::clone(&store));
        let dispatcher = Arc::new(HttpDispatcher::new(registry, config.dispatcher.clone()));
        let provider = Arc::new(OpenAiProvider::from_config(&config.model));
        let pipeline = Arc::new(ModelPipeline::new(
            Arc::clone(&store),
            dispatcher,
            provider,
            emitter.clone(),
            config.model.clone(),
        ));

        Ok(Self {
            config,
            verifier,
            store,
            analytics,
            pipeline,
            emitter,
            active_turns: DashMap::new(),
        })
    }
}

fn open_db(
    path: &str,
    init: fn(&rusqlite::Connection) -> rusqlite::Result<()>,
) -> Result<rusqlite::Connection, ConvoError> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn =
        rusqlite::Connection::open(path).map_err(|e| ConvoError::Database(e.to_string()))?;
    init(&conn).map_err(|e| ConvoError::Database(e.to_string()))?;
    Ok(conn)
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/ws/{conversation_id}", get(crate::ws::session::ws_handler))
        // conversation management
        .route(
            "/conversations",
            post(crate::http::conversations::create).get(crate::http::conversations::list),
        )
        .route(
            "/conversations/{id}",
            get(crate::http::conversations::get_one).delete(crate::http::conversations::remove),
        )
        .route(
            "/conversations/{id}/end",
            post(crate::http::conversations::end),
        )
        .route(
            "/conversations/{id}/messages",
            get(crate::http::conversations::messages),
        )
        // tool-server registrations
        .route(
            "/tool-servers",
            post(crate::http::tool_servers::create).get(crate::http::tool_servers::list),
        )
        .route(
            "/tool-servers/{id}",
            put(crate::http::tool_servers::update).delete(crate::http::tool_servers::remove),
        )
        // analytics ingest — private-network only, no bearer auth
        .route(
            "/ingest/activity",
            post(crate::http::analytics::ingest_activity),
        )
        .route(
            "/ingest/api-call",
            post(crate::http::analytics::ingest_api_call),
        )
        .route(
            "/ingest/conversation",
            post(crate::http::analytics::ingest_lifecycle),
        )
        .route(
            "/ingest/message",
            post(crate::http::analytics::ingest_message_metric),
        )
        // analytics query — admin bearer required
        .route("/analytics/summary", get(crate::http::analytics::summary))
        .route("/analytics/top-users", get(crate::http::analytics::top_users))
        .route(
            "/analytics/activities",
            get(crate::http::analytics::activities),
        )
        .route(
            "/analytics/conversations/{id}",
            get(crate::http::analytics::conversation_rollup),
        )
        .route("/analytics", delete(crate::http::analytics::clear_all))
        .with_state(state.clone())
        .layer(axum::middleware::from_fn_with_state(
            state,
            crate::http::track_api,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
