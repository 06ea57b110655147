use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::events::{Activity, ApiCall, ConversationLifecycle, MessageMetric};

/// Deadline for one ingest POST. Well above the ingestor's budget of tens
/// of milliseconds; anything slower is treated as down.
const EMIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Fire-and-forget client side of the analytics fabric.
///
/// Every `emit_*` spawns a detached task that POSTs the event and logs on
/// failure. No retry, no queue, no backpressure onto the caller — a dead
/// ingestor costs the platform telemetry, never a user request.
#[derive(Clone)]
pub struct AnalyticsEmitter {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl AnalyticsEmitter {
    pub fn new(ingest_base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: ingest_base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    /// An emitter that drops everything. Used when analytics is not
    /// configured and in tests.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn emit_activity(&self, event: Activity) {
        self.post("/ingest/activity", event);
    }

    pub fn emit_api_call(&self, event: ApiCall) {
        self.post("/ingest/api-call", event);
    }

    pub fn emit_lifecycle(&self, event: ConversationLifecycle) {
        self.post("/ingest/conversation", event);
    }

    pub fn emit_message_metric(&self, event: MessageMetric) {
        self.post("/ingest/message", event);
    }

    fn post<T: Serialize + Send + 'static>(&self, path: &str, event: T) {
        let Some(base) = &self.base_url else {
            return;
        };
        let url = format!("{}{}", base, path);
        let client = self.client.clone();

        tokio::spawn(async move {
            match client
                .post(&url)
                .timeout(EMIT_TIMEOUT)
                .json(&event)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    // dropped by contract — log and move on
                    debug!(url = %url, status = resp.status().as_u16(), "analytics ingest rejected event");
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "analytics ingest unreachable, event dropped");
                }
            }
        });
    }
}
