use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use convoai_core::config::DispatcherConfig;
use convoai_core::types::Subject;
use convoai_store::types::ToolServerRegistration;
use convoai_store::ToolRegistry;

use crate::catalog::ToolCatalog;
use crate::rpc::{self, FailureKind, ToolFailure, MAX_RESPONSE_BYTES};

/// The seam between the model pipeline and tool-server I/O.
///
/// `discover` never fails — a user with no reachable servers simply gets an
/// empty catalog. `invoke` fails only with a `ToolFailure`, which the
/// pipeline injects back into the loop as a tool result.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Phase 1: build this turn's catalog by probing every active server
    /// registered to `owner`, forwarding their bearer token.
    async fn discover(&self, owner: &Subject, bearer_token: &str) -> ToolCatalog;

    /// Phase 2: route a model-chosen call back to the owning server and
    /// return its `result` payload verbatim.
    async fn invoke(
        &self,
        catalog: &ToolCatalog,
        presented_name: &str,
        arguments: &Value,
        bearer_token: &str,
    ) -> Result<Value, ToolFailure>;
}

/// Production dispatcher speaking JSON-RPC 2.0 over HTTP POST.
pub struct HttpDispatcher {
    registry: ToolRegistry,
    client: reqwest::Client,
    config: DispatcherConfig,
    rpc_id: AtomicU64,
}

impl HttpDispatcher {
    pub fn new(registry: ToolRegistry, config: DispatcherConfig) -> Self {
        Self {
            registry,
            client: reqwest::Client::new(),
            config,
            rpc_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.rpc_id.fetch_add(1, Ordering::Relaxed)
    }

    /// One discovery probe. Every failure mode collapses to "this server
    /// contributes zero tools" plus a warning log.
    async fn probe_server(
        &self,
        registration: &ToolServerRegistration,
        bearer_token: &str,
    ) -> Vec<rpc::AdvertisedTool> {
        let deadline = Duration::from_millis(self.config.discovery_timeout_ms);
        let body = rpc::list_request(self.next_id());

        match self
            .post_rpc(&registration.endpoint_url, &body, bearer_token, deadline)
            .await
        {
            Ok(text) => match rpc::parse_list_response(&text) {
                Ok(tools) => {
                    debug!(
                        server = %registration.id,
                        name = %registration.name,
                        count = tools.len(),
                        "tool discovery ok"
                    );
                    tools
                }
                Err(failure) => {
                    warn!(
                        server = %registration.id,
                        name = %registration.name,
                        error = %failure.render(),
                        "tool discovery returned bad payload"
                    );
                    Vec::new()
                }
            },
            Err(failure) => {
                warn!(
                    server = %registration.id,
                    name = %registration.name,
                    error = %failure.render(),
                    "tool discovery failed"
                );
                Vec::new()
            }
        }
    }

    /// POST a JSON-RPC envelope and return the response body as text,
    /// enforcing the deadline, the size cap, and UTF-8.
    async fn post_rpc(
        &self,
        endpoint_url: &str,
        body: &Value,
        bearer_token: &str,
        deadline: Duration,
    ) -> Result<String, ToolFailure> {
        let resp = self
            .client
            .post(endpoint_url)
            .timeout(deadline)
            .bearer_auth(bearer_token)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    FailureKind::Timeout
                } else {
                    FailureKind::Unavailable
                };
                ToolFailure::new(kind, e.to_string())
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ToolFailure::new(
                FailureKind::Unavailable,
                format!("status {}", status.as_u16()),
            ));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ToolFailure::new(FailureKind::Unavailable, e.to_string()))?;
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(ToolFailure::new(
                FailureKind::Malformed,
                format!("response of {} bytes exceeds cap", bytes.len()),
            ));
        }

        String::from_utf8(bytes.to_vec())
            .map_err(|_| ToolFailure::new(FailureKind::Malformed, "response is not UTF-8"))
    }

    async fn probe_one<'a>(
        &'a self,
        idx: usize,
        registration: &'a ToolServerRegistration,
        bearer_token: &'a str,
    ) -> (usize, &'a ToolServerRegistration, Vec<rpc::AdvertisedTool>) {
        let tools = self.probe_server(registration, bearer_token).await;
        (idx, registration, tools)
    }
}

#[async_trait]
impl ToolDispatcher for HttpDispatcher {
    async fn discover(&self, owner: &Subject, bearer_token: &str) -> ToolCatalog {
        let servers = match self.registry.active_tool_servers(owner) {
            Ok(servers) => servers,
            Err(e) => {
                warn!(owner = %owner, error = %e, "tool registry lookup failed");
                return ToolCatalog::new();
            }
        };

        // Probe concurrently with a bounded fan-out, but fold results back in
        // registration order — name disambiguation must be deterministic, not
        // a race between servers.
        let fanout = self.config.discovery_fanout.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut iter = servers.iter().enumerate();
        for (idx, registration) in iter.by_ref().take(fanout) {
            in_flight.push(self.probe_one(idx, registration, bearer_token));
        }
        let mut probed: Vec<(usize, &ToolServerRegistration, Vec<rpc::AdvertisedTool>)> =
            Vec::with_capacity(servers.len());
        while let Some(result) = in_flight.next().await {
            probed.push(result);
            if let Some((idx, registration)) = iter.next() {
                in_flight.push(self.probe_one(idx, registration, bearer_token));
            }
        }
        probed.sort_by_key(|(idx, _, _)| *idx);

        let mut catalog = ToolCatalog::new();
        for (_, registration, tools) in probed {
            catalog.add_server_tools(&registration.id, &registration.endpoint_url, tools);
        }
        debug!(owner = %owner, tools = catalog.len(), "tool catalog assembled");
        catalog
    }

    async fn invoke(
        &self,
        catalog: &ToolCatalog,
        presented_name: &str,
        arguments: &Value,
        bearer_token: &str,
    ) -> Result<Value, ToolFailure> {
        let (server_id, tool_name) = catalog.resolve(presented_name).ok_or_else(|| {
            ToolFailure::new(
                FailureKind::UnknownTool,
                format!("no tool named {}", presented_name),
            )
        })?;
        let endpoint = catalog.endpoint(server_id).ok_or_else(|| {
            ToolFailure::new(
                FailureKind::UnknownTool,
                format!("no endpoint for server {}", server_id),
            )
        })?;

        let deadline = Duration::from_millis(self.config.invoke_timeout_ms);
        let body = rpc::call_request(self.next_id(), tool_name, arguments);

        debug!(server = %server_id, tool = tool_name, "invoking tool");
        let text = self.post_rpc(endpoint, &body, bearer_token, deadline).await?;
        rpc::parse_call_response(&text)
    }
}
