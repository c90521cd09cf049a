//! JSON-RPC 2.0 envelopes and the tool-server handshake shared by every transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use gov_bridge_core::{Error, Result, ToolOutput};

/// Protocol revision announced during `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Largest single response accepted from a backend.
pub const MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024;

// =============================================================================
// Envelopes
// =============================================================================

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn call(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        }
    }

    /// A request without an id; the peer sends no response.
    pub fn notification(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
}

/// Incoming message. Responses carry an id and either `result` or `error`;
/// anything with a `method` is a server-initiated request or notification.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Numeric id of a response, if this is one.
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// The result payload, or the peer's error as a backend fault.
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(Error::backend(format!("{} (code {})", error.message, error.code)));
        }
        self.result
            .ok_or_else(|| Error::backend("response has neither result nor error"))
    }
}

// =============================================================================
// Channel
// =============================================================================

/// A request/response channel to one backend.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;
}

/// `initialize` followed by the `initialized` notification.
pub async fn handshake(channel: &dyn RpcChannel) -> Result<Value> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "gov-bridge",
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let server = channel.request("initialize", Some(params)).await?;
    channel.notify("notifications/initialized", None).await?;
    Ok(server)
}

pub async fn call_tool(channel: &dyn RpcChannel, tool: &str, arguments: Value) -> Result<ToolOutput> {
    let params = json!({ "name": tool, "arguments": arguments });
    let result = channel.request("tools/call", Some(params)).await?;
    parse_tool_result(result)
}

pub async fn list_tools(channel: &dyn RpcChannel) -> Result<Vec<String>> {
    let result = channel.request("tools/list", None).await?;
    parse_tool_list(&result)
}

// =============================================================================
// Result Parsing
// =============================================================================

/// Convert a `tools/call` result into a [`ToolOutput`].
///
/// Text content items are joined with newlines; other content types are kept
/// only in the raw payload.
pub fn parse_tool_result(result: Value) -> Result<ToolOutput> {
    let content = result
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::backend("malformed tools/call result: missing content array"))?;

    let text = content
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");

    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut output = ToolOutput::text(text);
    output.is_error = is_error;
    if let Some(structured) = result.get("structuredContent") {
        output = output.with_structured(structured.clone());
    }
    Ok(output.with_raw(result))
}

/// Tool names from a `tools/list` result.
pub fn parse_tool_list(result: &Value) -> Result<Vec<String>> {
    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::backend("malformed tools/list result: missing tools array"))?;

    Ok(tools
        .iter()
        .filter_map(|t| t.get("name").and_then(Value::as_str))
        .map(String::from)
        .collect())
}

/// Extract the JSON-RPC message answering `id` from a `text/event-stream` body.
///
/// Events are separated by blank lines; multi-line `data:` fields are joined.
pub fn parse_sse_body(body: &str, id: u64) -> Result<JsonRpcMessage> {
    let mut data: Vec<&str> = Vec::new();
    let mut events: Vec<String> = Vec::new();

    for line in body.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if !data.is_empty() {
                events.push(data.join("\n"));
                data.clear();
            }
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data.push(value.trim_start());
        }
    }

    events
        .iter()
        .filter_map(|event| serde_json::from_str::<JsonRpcMessage>(event).ok())
        .find(|message| message.response_id() == Some(id))
        .ok_or_else(|| Error::backend(format!("event stream carried no response for request {}", id)))
}
