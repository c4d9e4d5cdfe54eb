//! WebSocket listener using tokio-tungstenite.
//!
//! Authentication happens during the HTTP upgrade: a request for the wrong
//! path is answered 404 and a request without a valid token 401, so no
//! WebSocket (and no shell) ever exists for a rejected client.

use super::TransportHandle;
use crate::auth::{request_credential, TokenGate};
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use shellgate_core::{encode_server_frame, GateError, GateResult, ServerFrame};
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on a single socket write; a stalled client is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How a connection's writer task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// The transport was closed and every queued frame was written.
    Drained,
    /// A write failed or timed out; the client is gone or not reading.
    Failed,
}

/// A handle to an accepted, authenticated WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields connections which
/// passed the path and token checks.
pub async fn start_listener(
    bind_addr: &str,
    gate: Arc<TokenGate>,
    path: String,
) -> GateResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GateError::Transport(format!("WS bind failed on {bind_addr}: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, path = %path, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);
    let path = Arc::new(path);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let gate = gate.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        let callback = |request: &Request, response: Response| {
                            check_upgrade(request, response, &gate, &path, addr)
                        };
                        match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                debug!(remote = %addr, error = %e, "WebSocket handshake ended");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Upgrade callback: path first, then the token.
fn check_upgrade(
    request: &Request,
    response: Response,
    gate: &TokenGate,
    path: &str,
    remote: SocketAddr,
) -> Result<Response, ErrorResponse> {
    if request.uri().path() != path {
        debug!(remote = %remote, path = request.uri().path(), "upgrade for unknown path");
        return Err(rejection(StatusCode::NOT_FOUND, "Not Found"));
    }
    let credential = request_credential(request);
    if !gate.authorize(credential.as_deref()) {
        warn!(
            remote = %remote,
            has_token = credential.is_some(),
            "unauthorized terminal connection rejected"
        );
        return Err(rejection(StatusCode::UNAUTHORIZED, "Unauthorized"));
    }
    Ok(response)
}

fn rejection(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

/// Drain a connection's outbound queue into the socket.
///
/// Runs until the queue is closed or the transport is closed. Frames queued
/// before the close are still written, then a Close frame is sent. A failed
/// or stalled write ends the task at once with [`WriterExit::Failed`].
pub async fn run_writer<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<ServerFrame>,
    closing: CancellationToken,
) -> WriterExit
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = closing.cancelled() => break,
        };
        let Some(frame) = frame else { break };
        if !write_frame(&mut sink, &frame).await {
            return WriterExit::Failed;
        }
    }

    while let Ok(frame) = rx.try_recv() {
        if !write_frame(&mut sink, &frame).await {
            return WriterExit::Failed;
        }
    }
    let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Close(None))).await;
    let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.close()).await;
    WriterExit::Drained
}

/// Write one frame. Returns `false` once the socket is unusable.
async fn write_frame<S>(sink: &mut S, frame: &ServerFrame) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let text = match encode_server_frame(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode frame");
            return true;
        }
    };
    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "WS send failed");
            false
        }
        Err(_) => {
            warn!("WS send timed out");
            false
        }
    }
}

/// Wire a connection to a fresh transport handle and start its writer.
///
/// Returns the handle, the inbound half and the writer task.
pub fn attach(
    conn: WebSocketConnection,
    capacity: usize,
) -> (
    TransportHandle,
    SplitStream<WebSocketStream<TcpStream>>,
    tokio::task::JoinHandle<WriterExit>,
) {
    let (sink, stream) = conn.ws_stream.split();
    let (handle, rx) = TransportHandle::channel(capacity);
    let writer_handle = handle.clone();
    let writer = tokio::spawn(async move {
        let exit = run_writer(sink, rx, writer_handle.closing_token()).await;
        if exit == WriterExit::Failed {
            writer_handle.mark_failed();
        }
        exit
    });
    (handle, stream, writer)
}
