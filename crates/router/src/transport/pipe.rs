//! Child-process transport over stdin/stdout.
//!
//! The child is killed when the transport is dropped. Its stderr is forwarded
//! to the log at debug level.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use gov_bridge_core::{BackendTransport, Error, Result, ToolOutput, TransportKind};

use super::line::LineConnection;
use super::rpc;

pub struct PipeTransport {
    child: Mutex<Option<Child>>,
    connection: LineConnection,
}

impl PipeTransport {
    /// Spawn the backend process and complete the handshake.
    pub async fn spawn(
        backend_id: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::backend_unavailable(format!("{}: spawn '{}' failed: {}", backend_id, command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::backend_unavailable(format!("{}: missing child stdin", backend_id)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::backend_unavailable(format!("{}: missing child stdout", backend_id)))?;

        if let Some(stderr) = child.stderr.take() {
            let label = backend_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(backend = %label, "{}", line);
                }
            });
        }

        let transport = Self {
            child: Mutex::new(Some(child)),
            connection: LineConnection::new(backend_id, stdout, stdin),
        };
        if let Err(e) = rpc::handshake(&transport.connection).await {
            let _ = transport.shutdown().await;
            return Err(e);
        }

        tracing::info!(backend = backend_id, command, "Pipe backend started");
        Ok(transport)
    }
}

#[async_trait]
impl BackendTransport for PipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
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
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Backend process already gone");
            }
        }
        Ok(())
    }
}
