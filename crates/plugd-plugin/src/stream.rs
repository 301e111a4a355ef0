//! Per-call resource response stream.
//!
//! A bounded channel of [`CallResourceResponse`] chunks whose send and receive
//! sides both race a cancellation token. The send side is closed explicitly by
//! the invocation; closing twice is an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{PluginError, PluginResult};
use crate::protocol::CallResourceResponse;

/// Number of chunks buffered between the plugin and the relay.
pub const STREAM_CAPACITY: usize = 1;

/// Creates a stream bound to `cancel`.
pub fn channel(cancel: CancellationToken) -> (ResourceSender, ResourceReceiver) {
    let (tx, rx) = mpsc::channel(STREAM_CAPACITY);

    let sender = ResourceSender {
        shared: Arc::new(SenderShared {
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
        }),
    };

    (sender, ResourceReceiver { rx, cancel })
}

#[derive(Debug)]
struct SenderShared {
    tx: Mutex<Option<mpsc::Sender<CallResourceResponse>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

/// Send side of a resource stream, handed to the plugin invocation.
#[derive(Debug, Clone)]
pub struct ResourceSender {
    shared: Arc<SenderShared>,
}

impl ResourceSender {
    /// Sends one chunk, waiting while the buffer is full.
    ///
    /// Fails with [`PluginError::Cancelled`] once the token is cancelled and
    /// with [`PluginError::StreamClosed`] after [`close`](Self::close) or once
    /// the receiver is gone.
    pub async fn send(&self, chunk: CallResourceResponse) -> PluginResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(PluginError::StreamClosed);
        }

        let tx = self
            .shared
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PluginError::StreamClosed)?;

        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(PluginError::Cancelled),
            res = tx.send(chunk) => res.map_err(|_| PluginError::StreamClosed),
        }
    }

    /// Closes the stream. The receiver sees end-of-stream after draining.
    ///
    /// A second close returns [`PluginError::StreamClosed`].
    pub fn close(&self) -> PluginResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(PluginError::StreamClosed);
        }

        self.shared
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        Ok(())
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// Receive side of a resource stream, drained by the relay.
#[derive(Debug)]
pub struct ResourceReceiver {
    rx: mpsc::Receiver<CallResourceResponse>,
    cancel: CancellationToken,
}

impl ResourceReceiver {
    /// Receives the next chunk; `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> PluginResult<Option<CallResourceResponse>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PluginError::Cancelled),
            chunk = self.rx.recv() => Ok(chunk),
        }
    }
}
