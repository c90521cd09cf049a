//! Long-lived TCP stream transport.

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpStream;

use gov_bridge_core::{BackendTransport, Error, Result, ToolOutput, TransportKind};

use super::line::LineConnection;
use super::rpc;

pub struct StreamTransport {
    address: String,
    connection: LineConnection,
}

impl StreamTransport {
    /// Connect and complete the handshake.
    pub async fn connect(backend_id: &str, address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            Error::backend_unavailable(format!("{}: connect to {} failed: {}", backend_id, address, e))
        })?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();

        let transport = Self {
            address: address.to_string(),
            connection: LineConnection::new(backend_id, read, write),
        };
        rpc::handshake(&transport.connection).await?;

        tracing::info!(backend = backend_id, address, "Stream backend connected");
        Ok(transport)
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl BackendTransport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolOutput> {
        rpc::call_tool(&self.connection, tool, arguments).await
    }

    async fn list_tools(&self) -> Result<Vec<String>> {
        rpc::list_tools(&self.connection).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.connection.close().await;
        Ok(())
    }
}
