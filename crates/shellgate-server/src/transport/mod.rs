//! Client transport: the session-side handle and the WebSocket listener.

pub mod websocket;

use shellgate_core::ServerFrame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound frames queued per connection before senders wait.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Session-side handle to one client connection.
///
/// Frames go into a bounded queue drained by the connection's writer task,
/// so the session never writes to the socket directly. Closing is one-shot:
/// the first [`close`](Self::close) wins, later calls and sends are no-ops.
/// Once the writer reports the socket dead, sends fail without waiting.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: mpsc::Sender<ServerFrame>,
    closed: Arc<AtomicBool>,
    closing: CancellationToken,
    failed: CancellationToken,
}

impl TransportHandle {
    /// New handle plus the receiving end for the writer task.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            closing: CancellationToken::new(),
            failed: CancellationToken::new(),
        };
        (handle, rx)
    }

    /// Queue a frame. Returns `false` once the transport is closed or gone.
    pub async fn send(&self, frame: ServerFrame) -> bool {
        if self.is_closed() || self.failed.is_cancelled() {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(frame) => sent.is_ok(),
            _ = self.closing.cancelled() => false,
            _ = self.failed.cancelled() => false,
        }
    }

    /// Close from the server side. Frames already queued are still delivered.
    /// Returns `true` for the call that performed the close.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closing.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the transport has been closed.
    pub async fn closed(&self) {
        self.closing.cancelled().await
    }

    /// Mark the socket unwritable. Pending and later sends return `false`.
    pub fn mark_failed(&self) {
        self.failed.cancel();
    }

    /// Token observed by the writer task.
    pub fn closing_token(&self) -> CancellationToken {
        self.closing.clone()
    }
}
