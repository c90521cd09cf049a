//! Newline-delimited JSON-RPC over a byte stream.
//!
//! One reader task owns the read half and routes each response to the caller
//! waiting on its id, so concurrent calls share the connection. Callers that
//! give up (timeout, cancellation) remove their slot; a response arriving
//! later finds no slot and is discarded.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use gov_bridge_core::{Error, Result};

use super::rpc::{JsonRpcMessage, JsonRpcRequest, RpcChannel, MAX_RESPONSE_BYTES};

type Pending = DashMap<u64, oneshot::Sender<JsonRpcMessage>>;

struct Shared {
    label: String,
    pending: Pending,
    connected: AtomicBool,
}

impl Shared {
    fn disconnect(&self, why: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::warn!(backend = %self.label, reason = why, "Backend connection lost");
        }
        // dropping the senders fails every waiting caller
        self.pending.clear();
    }
}

/// Removes a pending slot when the waiting call finishes or is dropped.
struct SlotGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// A multiplexed JSON-RPC connection over newline-delimited frames.
pub struct LineConnection {
    shared: Arc<Shared>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl LineConnection {
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            label: label.into(),
            pending: DashMap::new(),
            connected: AtomicBool::new(true),
        });
        let reader = tokio::spawn(read_loop(shared.clone(), BufReader::new(reader)));

        Self {
            shared,
            writer: Mutex::new(Box::new(writer)),
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, request: &JsonRpcRequest<'_>) -> Result<()> {
        let mut frame = serde_json::to_vec(request)?;
        frame.push(b'\n');

        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        written.map_err(|e| {
            self.shared.disconnect("write failed");
            Error::backend_unavailable(format!("{}: write failed: {}", self.shared.label, e))
        })
    }

    /// Stop reading and fail every waiting call.
    pub async fn close(&self) {
        self.reader.abort();
        self.shared.disconnect("closed");
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl Drop for LineConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl RpcChannel for LineConnection {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::backend_unavailable(format!(
                "{}: not connected",
                self.shared.label
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        let _slot = SlotGuard {
            pending: &self.shared.pending,
            id,
        };
        // the reader may have cleared the slots between the check and the insert
        if !self.is_connected() {
            return Err(Error::backend_unavailable(format!(
                "{}: not connected",
                self.shared.label
            )));
        }

        self.send(&JsonRpcRequest::call(id, method, params)).await?;

        let message = rx.await.map_err(|_| {
            Error::backend_unavailable(format!(
                "{}: connection closed before '{}' completed",
                self.shared.label, method
            ))
        })?;
        message.into_result()
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send(&JsonRpcRequest::notification(method, params)).await
    }
}

/// One read from the wire.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// A complete line (without the newline), or the unterminated tail at EOF.
    Line,
    /// A line longer than the limit; its bytes were discarded.
    Oversized(usize),
    Eof,
}

/// Read up to the next newline into `buf`, holding at most `limit` bytes.
///
/// An over-long line is consumed and dropped up to its newline so the next
/// frame starts clean.
async fn read_frame<R>(reader: &mut BufReader<R>, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    let mut skipped = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (skipped, buf.is_empty()) {
                (0, true) => Frame::Eof,
                (0, false) => Frame::Line,
                (n, _) => Frame::Oversized(n),
            });
        }

        let (chunk, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (&available[..i], i + 1),
            None => (available, available.len()),
        };
        let terminated = done > chunk.len();

        if skipped > 0 || buf.len() + chunk.len() > limit {
            skipped += buf.len() + chunk.len();
            buf.clear();
        } else {
            buf.extend_from_slice(chunk);
        }
        reader.consume(done);

        if terminated {
            return Ok(if skipped > 0 { Frame::Oversized(skipped) } else { Frame::Line });
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: BufReader<R>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        match read_frame(&mut reader, &mut buf, MAX_RESPONSE_BYTES).await {
            Ok(Frame::Line) => {}
            Ok(Frame::Oversized(bytes)) => {
                tracing::warn!(backend = %shared.label, bytes, "Oversized frame discarded");
                continue;
            }
            Ok(Frame::Eof) => {
                shared.disconnect("end of stream");
                return;
            }
            Err(e) => {
                tracing::debug!(backend = %shared.label, error = %e, "Read failed");
                shared.disconnect("read failed");
                return;
            }
        }

        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let message: JsonRpcMessage = match serde_json::from_slice(&buf) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(backend = %shared.label, error = %e, "Malformed frame discarded");
                continue;
            }
        };

        let Some(id) = message.response_id() else {
            tracing::debug!(
                backend = %shared.label,
                method = message.method.as_deref().unwrap_or(""),
                "Ignoring server-initiated message"
            );
            continue;
        };

        match shared.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(message);
            }
            None => tracing::debug!(backend = %shared.label, id, "Discarding late response"),
        }
    }
}
