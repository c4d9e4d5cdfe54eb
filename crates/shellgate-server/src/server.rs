//! Core server: accepts authenticated connections and bridges them to shells.
//!
//! Owns the token gate and the session registry. Each WebSocket connection
//! gets exactly one session; the connection's inbound loop decodes client
//! frames and routes them to that session.

use crate::auth::TokenGate;
use crate::config::{ServerConfig, SpawnMode};
use crate::screen::CommandScreener;
use crate::session::{
    PipeSpawner, PtySpawner, RegistrySettings, SessionRegistry, ShellSpawner, Teardown,
};
use crate::transport::websocket::{self, WebSocketConnection, WriterExit};
use crate::transport::OUTBOUND_CAPACITY;
use futures_util::StreamExt;
use serde::Serialize;
use shellgate_core::{decode_client_frame, ClientFrame, GateResult, ServerFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// How long a finished connection waits for its writer to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval of the periodic health log line.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Liveness snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    #[serde(rename = "terminalSessions")]
    pub terminal_sessions: usize,
}

/// The shellgate server instance.
pub struct ShellgateServer {
    config: ServerConfig,
    gate: Arc<TokenGate>,
    registry: Arc<SessionRegistry>,
}

impl ShellgateServer {
    /// Create a server using the spawner selected by `config.mode`.
    pub fn new(config: ServerConfig) -> GateResult<Self> {
        let spawner: Arc<dyn ShellSpawner> = match config.mode {
            SpawnMode::Pty => Arc::new(PtySpawner),
            SpawnMode::Pipe => Arc::new(PipeSpawner),
        };
        Self::with_spawner(config, spawner)
    }

    /// Create a server with an explicit spawner.
    pub fn with_spawner(config: ServerConfig, spawner: Arc<dyn ShellSpawner>) -> GateResult<Self> {
        let screener = Arc::new(CommandScreener::with_extra(config.extra_patterns.as_slice())?);
        let gate = Arc::new(TokenGate::new(&config.tokens));
        if gate.is_empty() {
            warn!("no access tokens configured; every connection will be rejected");
        }

        let registry = Arc::new(SessionRegistry::new(
            spawner,
            screener.clone(),
            RegistrySettings {
                max_sessions: config.max_sessions,
                idle_timeout: config.idle_timeout,
                shell: config.shell.clone(),
            },
        ));

        info!(
            tokens = gate.len(),
            patterns = screener.len(),
            mode = ?config.mode,
            "server initialized"
        );

        Ok(Self {
            config,
            gate,
            registry,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            terminal_sessions: self.registry.count().await,
        }
    }

    /// Bind the listener. Returns the bound address and the connection queue.
    pub async fn bind(&self) -> GateResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
        websocket::start_listener(
            &self.config.listen_addr(),
            self.gate.clone(),
            self.config.path.clone(),
        )
        .await
    }

    /// Listen and serve until the listener stops.
    pub async fn run(self: Arc<Self>) -> GateResult<()> {
        let (addr, ws_rx) = self.bind().await?;

        let health_server = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
            loop {
                interval.tick().await;
                let report = health_server.health().await;
                info!(
                    status = report.status,
                    terminal_sessions = report.terminal_sessions,
                    "health"
                );
            }
        });

        info!(addr = %addr, path = %self.config.path, "shellgate-server ready");
        self.serve(ws_rx).await;
        Ok(())
    }

    /// Handle accepted connections until the queue closes.
    pub async fn serve(self: Arc<Self>, mut ws_rx: mpsc::Receiver<WebSocketConnection>) {
        while let Some(conn) = ws_rx.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                srv.handle_websocket(conn).await;
            });
        }
        info!("listener closed, shutting down");
    }

    /// Bridge one connection to a fresh shell until either side ends.
    async fn handle_websocket(&self, conn: WebSocketConnection) {
        let remote = conn.remote_addr;
        info!(remote = %remote, "terminal connection opened");

        let (transport, mut stream, mut writer) = websocket::attach(conn, OUTBOUND_CAPACITY);

        let session_id = match self.registry.create(transport.clone()).await {
            Ok(id) => id,
            Err(e) => {
                warn!(remote = %remote, error = %e, "session not created");
                let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
                return;
            }
        };

        let mut writer_done = false;
        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = transport.closed() => break None,
                exit = &mut writer => {
                    writer_done = true;
                    match exit {
                        Ok(WriterExit::Drained) => break None,
                        Ok(WriterExit::Failed) | Err(_) => {
                            debug!(session_id = %session_id, "WS writer failed");
                            break Some(Teardown::TransportError);
                        }
                    }
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    self.dispatch_text(&session_id, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break Some(Teardown::TransportClosed),
                Some(Ok(_)) => {
                    // Binary and control frames carry nothing for the terminal.
                }
                Some(Err(e)) => {
                    debug!(session_id = %session_id, error = %e, "WS receive failed");
                    break Some(Teardown::TransportError);
                }
            }
        };

        if let Some(reason) = reason {
            self.registry.destroy_with(&session_id, reason).await;
        }
        if !writer_done {
            let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
        }
        info!(remote = %remote, session_id = %session_id, "terminal connection closed");
    }

    /// Route one client text frame. Undecodable frames are dropped silently.
    async fn dispatch_text(&self, session_id: &str, text: &str) {
        let frame = match decode_client_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(session_id, error = %e, "ignoring malformed frame");
                return;
            }
        };
        let Some(session) = self.registry.lookup(session_id).await else {
            return;
        };
        match frame {
            ClientFrame::Input { data } => {
                session.submit_input(data).await;
            }
            ClientFrame::Resize { cols, rows } => {
                if let Err(e) = session.resize(cols, rows) {
                    debug!(session_id, error = %e, "resize failed");
                }
            }
            ClientFrame::Ping => {
                session.send(ServerFrame::Pong).await;
            }
        }
    }
}
