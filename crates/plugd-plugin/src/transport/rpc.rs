//! Line-delimited JSON RPC over a pair of byte streams.
//!
//! Requests are `{"id", "method", "params"}` objects, one per line. Replies
//! carry the request ID and a `type` of `chunk`, `result` or `error`; a call
//! ends with its `result` or `error` frame. Calls are multiplexed by ID.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};

/// Longest accepted reply line.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Reply frames buffered per call before the reader waits for the caller.
pub const REPLY_BUFFER: usize = 16;

/// Error code a backend uses for methods it does not implement.
pub const CODE_NOT_IMPLEMENTED: &str = "not_implemented";
/// Error code a backend uses when it cannot serve requests right now.
pub const CODE_UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

/// A reply frame sent by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RpcFrame {
    /// Intermediate streamed payload.
    Chunk {
        /// Request ID.
        id: u64,
        /// Payload.
        #[serde(default)]
        data: Value,
    },
    /// Final payload.
    Result {
        /// Request ID.
        id: u64,
        /// Payload.
        #[serde(default)]
        data: Value,
    },
    /// Final failure.
    Error {
        /// Request ID.
        id: u64,
        /// Machine-readable error code.
        #[serde(default)]
        code: Option<String>,
        /// Error message.
        #[serde(default)]
        message: String,
    },
}

impl RpcFrame {
    fn id(&self) -> u64 {
        match self {
            Self::Chunk { id, .. } | Self::Result { id, .. } | Self::Error { id, .. } => *id,
        }
    }

    fn is_final(&self) -> bool {
        !matches!(self, Self::Chunk { .. })
    }

    /// Maps an error frame to a [`PluginError`].
    fn error_for(code: Option<String>, message: String) -> PluginError {
        match code.as_deref() {
            Some(CODE_NOT_IMPLEMENTED) => PluginError::MethodNotImplemented,
            Some(CODE_UNAVAILABLE) => PluginError::Unavailable,
            _ => PluginError::Backend { message },
        }
    }
}

type Pending = Arc<Mutex<HashMap<u64, mpsc::Sender<RpcFrame>>>>;
type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LinesCodec>;

/// Multiplexed RPC connection to one backend.
pub struct RpcConnection {
    writer: tokio::sync::Mutex<Option<Writer>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RpcConnection {
    /// Starts a connection reading replies from `reader` and writing requests to `writer`.
    ///
    /// Must be called inside a Tokio runtime; the reader runs as its own task
    /// and ends when `reader` reaches end-of-file.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::default();
        let closed = CancellationToken::new();

        let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
        tokio::spawn(read_loop(lines, Arc::clone(&pending), closed.clone()));

        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);

        Self {
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(writer, LinesCodec::new()))),
            pending,
            next_id: AtomicU64::new(1),
            closed,
        }
    }

    /// Whether the reply stream has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the reply stream has ended.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Sends a request and returns the stream of its reply frames.
    pub async fn call_streaming(&self, method: &str, params: Value) -> PluginResult<ReplyStream> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(REPLY_BUFFER);
        lock(&self.pending).insert(id, tx);

        let replies = ReplyStream {
            id,
            rx,
            pending: Arc::clone(&self.pending),
        };

        // Checked after registering so a concurrent close cannot strand the call.
        if self.is_closed() {
            return Err(PluginError::Unavailable);
        }

        let line = serde_json::to_string(&RpcRequest { id, method, params }).map_err(|e| {
            PluginError::Transport {
                reason: format!("failed to encode {method} request: {e}"),
            }
        })?;

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(PluginError::Unavailable)?;
        writer
            .send(line)
            .await
            .map_err(|e| PluginError::Transport {
                reason: format!("failed to write {method} request: {e}"),
            })?;

        Ok(replies)
    }

    /// Sends a request and waits for its final payload.
    pub async fn call(&self, method: &str, params: Value) -> PluginResult<Value> {
        let mut replies = self.call_streaming(method, params).await?;

        loop {
            match replies.next().await? {
                RpcFrame::Chunk { .. } => continue,
                RpcFrame::Result { data, .. } => return Ok(data),
                RpcFrame::Error { code, message, .. } => {
                    return Err(RpcFrame::error_for(code, message));
                }
            }
        }
    }

    /// Closes the request stream; the backend sees end-of-file on its input.
    pub async fn close_writer(&self) -> PluginResult<()> {
        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };

        SinkExt::<String>::close(&mut writer)
            .await
            .map_err(|e| PluginError::Transport {
                reason: format!("failed to close request stream: {e}"),
            })
    }
}

/// Reply frames of one call.
///
/// Dropping the stream abandons the call; late replies are discarded.
#[derive(Debug)]
pub struct ReplyStream {
    id: u64,
    rx: mpsc::Receiver<RpcFrame>,
    pending: Pending,
}

impl ReplyStream {
    /// Next frame of the call.
    ///
    /// Fails with [`PluginError::Unavailable`] if the connection ends first.
    pub async fn next(&mut self) -> PluginResult<RpcFrame> {
        self.rx.recv().await.ok_or(PluginError::Unavailable)
    }

    /// Next chunk payload, or `None` after the final `result` frame.
    pub async fn next_chunk(&mut self) -> PluginResult<Option<Value>> {
        match self.next().await? {
            RpcFrame::Chunk { data, .. } => Ok(Some(data)),
            RpcFrame::Result { .. } => Ok(None),
            RpcFrame::Error { code, message, .. } => Err(RpcFrame::error_for(code, message)),
        }
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<RpcFrame>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn read_loop<R>(
    mut lines: FramedRead<R, LinesCodec>,
    pending: Pending,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to read plugin reply");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame: RpcFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Discarding malformed plugin reply");
                continue;
            }
        };

        let id = frame.id();
        let is_final = frame.is_final();
        let Some(tx) = lock(&pending).get(&id).cloned() else {
            debug!(request_id = id, "Discarding reply for abandoned request");
            continue;
        };

        // Waits while the caller's buffer is full.
        let delivered = tx.send(frame).await.is_ok();
        if is_final || !delivered {
            lock(&pending).remove(&id);
        }
        if !delivered {
            debug!(request_id = id, "Discarding reply for abandoned request");
        }
    }

    closed.cancel();
    // Dropping the senders ends every outstanding call.
    lock(&pending).clear();
}
