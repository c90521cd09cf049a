//! HTTP transport: one POST per JSON-RPC message.
//!
//! The server may answer with a plain JSON body or a `text/event-stream`
//! body. A session id issued by the server is sent back on every later request.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use gov_bridge_core::{BackendTransport, Error, Result, ToolOutput, TransportKind};

use super::rpc::{self, JsonRpcMessage, JsonRpcRequest, RpcChannel, MAX_RESPONSE_BYTES};

const SESSION_HEADER: &str = "mcp-session-id";

pub struct HttpTransport {
    backend_id: String,
    url: String,
    client: Client,
    headers: HeaderMap,
    session: RwLock<Option<String>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Build the client and complete the handshake.
    pub async fn connect(backend_id: &str, url: &str, headers: &BTreeMap<String, String>) -> Result<Self> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::config(format!("{}: invalid header name '{}'", backend_id, name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::config(format!("{}: invalid value for header '{}'", backend_id, name.as_str())))?;
            header_map.insert(name, value);
        }

        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {}", e)))?;

        let transport = Self {
            backend_id: backend_id.to_string(),
            url: url.to_string(),
            client,
            headers: header_map,
            session: RwLock::new(None),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        };
        rpc::handshake(&transport).await?;

        tracing::info!(backend = backend_id, url, "HTTP backend connected");
        Ok(transport)
    }

    fn session(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn post(&self, message: &JsonRpcRequest<'_>) -> Result<Response> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::backend_unavailable(format!("{}: transport closed", self.backend_id)));
        }

        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(session) = self.session() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|e| {
            Error::backend_unavailable(format!("{}: request failed: {}", self.backend_id, e))
        })?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) {
            return Err(Error::backend_unavailable(format!("{}: http status {}", self.backend_id, status)));
        }
        if !status.is_success() {
            return Err(Error::backend(format!("{}: http status {}", self.backend_id, status)));
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session.to_string());
        }
        Ok(response)
    }
}

/// Read a response body, refusing anything over the size limit.
async fn read_body(mut response: Response) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| Error::backend_unavailable(format!("body read failed: {}", e)))?
    {
        if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(Error::backend(format!(
                "response exceeds {} bytes",
                MAX_RESPONSE_BYTES
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[async_trait]
impl RpcChannel for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self.post(&JsonRpcRequest::call(id, method, params)).await?;

        let event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.starts_with("text/event-stream"));
        let body = read_body(response).await?;

        let message: JsonRpcMessage = if event_stream {
            let text = std::str::from_utf8(&body)
                .map_err(|_| Error::backend("event stream was not valid UTF-8"))?;
            rpc::parse_sse_body(text, id)?
        } else {
            serde_json::from_slice(&body)
                .map_err(|e| Error::backend(format!("invalid JSON-RPC response: {}", e)))?
        };
        message.into_result()
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.post(&JsonRpcRequest::notification(method, params)).await?;
        Ok(())
    }
}

#[async_trait]
impl BackendTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolOutput> {
        rpc::call_tool(self, tool, arguments).await
    }

    async fn list_tools(&self) -> Result<Vec<String>> {
        rpc::list_tools(self).await
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // let the server release its session state
        if let Some(session) = self.session() {
            let result = self
                .client
                .delete(&self.url)
                .headers(self.headers.clone())
                .header(SESSION_HEADER, session)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(backend = %self.backend_id, error = %e, "Session close failed");
            }
        }
        Ok(())
    }
}
