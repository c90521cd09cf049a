//! Backend transport traits.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{ToolOutput, TransportKind};

/// One live connection to a backend.
///
/// Each implementation is the exclusive owner of its underlying process or
/// socket handle and manages its own connection lifecycle.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Transport family.
    fn kind(&self) -> TransportKind;

    /// Whether the connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Call a tool. Timeouts are enforced by the caller.
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolOutput>;

    /// List tool names exposed by the backend.
    async fn list_tools(&self) -> Result<Vec<String>>;

    /// Release the connection.
    async fn shutdown(&self) -> Result<()>;
}
