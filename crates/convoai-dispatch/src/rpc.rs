//! JSON-RPC 2.0 envelope helpers for the tool-server wire protocol.
//!
//! Two methods are required of any tool server: `tools/list` (no params)
//! and `tools/call` (`{name, arguments}`). Transport is HTTP POST with the
//! requesting user's bearer token attached.

use serde::Deserialize;
use serde_json::{json, Value};

/// Hard cap on a tool server's response body. Anything larger is treated as
/// a malformed response — the server is hostile or broken either way.
pub const MAX_RESPONSE_BYTES: usize = 256 * 1024;

/// Longest error text we keep when reflecting a server failure into logs or
/// tool results.
const MAX_ERROR_CHARS: usize = 500;

/// Build a `tools/list` request envelope.
pub fn list_request(id: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/list",
        "params": {}
    })
}

/// Build a `tools/call` request envelope.
pub fn call_request(id: u64, tool_name: &str, arguments: &Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {
            "name": tool_name,
            "arguments": arguments,
        }
    })
}

/// A tool as advertised by a server's `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct AdvertisedTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-Schema object describing the call arguments.
    #[serde(default = "empty_schema")]
    pub parameters: Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Deserialize)]
struct ListResult {
    tools: Vec<AdvertisedTool>,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// How a tool interaction failed. Never a pipeline error — the model sees
/// the failure as a tool result and decides how to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The model chose a name that is not in this turn's catalog.
    UnknownTool,
    /// Connection refused, DNS failure, non-2xx status.
    Unavailable,
    /// The per-call deadline elapsed.
    Timeout,
    /// Oversized, non-UTF-8, or non-JSON-RPC response body.
    Malformed,
    /// The server returned a JSON-RPC error object.
    Rpc,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTool => write!(f, "unknown_tool"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Timeout => write!(f, "timeout"),
            Self::Malformed => write!(f, "malformed"),
            Self::Rpc => write!(f, "rpc_error"),
        }
    }
}

/// Structured tool failure, safe to inject into the model loop.
#[derive(Debug, Clone)]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl ToolFailure {
    pub fn new(kind: FailureKind, detail: impl AsRef<str>) -> Self {
        Self {
            kind,
            detail: sanitize(detail.as_ref()),
        }
    }

    /// Text form fed back to the model as the tool result.
    pub fn render(&self) -> String {
        format!("tool call failed ({}): {}", self.kind, self.detail)
    }
}

/// Strip control characters and truncate. Server-supplied error text goes
/// through here before it reaches logs or the model context.
pub fn sanitize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == ' ')
        .collect();
    if cleaned.chars().count() > MAX_ERROR_CHARS {
        cleaned.chars().take(MAX_ERROR_CHARS).collect()
    } else {
        cleaned
    }
}

/// Extract the advertised tool list from a `tools/list` response body.
pub fn parse_list_response(body: &str) -> Result<Vec<AdvertisedTool>, ToolFailure> {
    let envelope: RpcEnvelope = serde_json::from_str(body)
        .map_err(|e| ToolFailure::new(FailureKind::Malformed, format!("bad envelope: {}", e)))?;

    if let Some(err) = envelope.error {
        return Err(ToolFailure::new(
            FailureKind::Rpc,
            format!("code {}: {}", err.code, err.message),
        ));
    }

    let result = envelope
        .result
        .ok_or_else(|| ToolFailure::new(FailureKind::Malformed, "missing result"))?;
    let list: ListResult = serde_json::from_value(result)
        .map_err(|e| ToolFailure::new(FailureKind::Malformed, format!("bad tools list: {}", e)))?;
    Ok(list.tools)
}

/// Extract the verbatim `result` payload from a `tools/call` response body.
pub fn parse_call_response(body: &str) -> Result<Value, ToolFailure> {
    let envelope: RpcEnvelope = serde_json::from_str(body)
        .map_err(|e| ToolFailure::new(FailureKind::Malformed, format!("bad envelope: {}", e)))?;

    if let Some(err) = envelope.error {
        return Err(ToolFailure::new(
            FailureKind::Rpc,
            format!("code {}: {}", err.code, err.message),
        ));
    }

    envelope
        .result
        .ok_or_else(|| ToolFailure::new(FailureKind::Malformed, "missing result"))
}
