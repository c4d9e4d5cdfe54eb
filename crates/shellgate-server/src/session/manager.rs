//! Session lifecycle management.
//!
//! The registry is the only owner of the session map. A session is removed
//! from the map before any of its resources are released, and only the
//! caller that removed it performs the teardown; every other trigger finds
//! the id gone and does nothing.

use super::bridge::{ExitStatus, OutputChunks, ShellCommand, ShellHandle, ShellSpawner};
use super::idle::IdleSupervisor;
use crate::screen::CommandScreener;
use crate::transport::TransportHandle;
use shellgate_core::{clamp_dimensions, GateError, GateResult, ServerFrame, Utf8ChunkDecoder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Input chunks queued per session before the transport reader waits.
const INPUT_QUEUE_CAPACITY: usize = 64;

/// How long the exit status may lag behind the end of both output streams.
const EXIT_STATUS_GRACE: Duration = Duration::from_secs(2);

/// How long output still in the pipes may take to reach the client after exit.
const OUTPUT_FLUSH_GRACE: Duration = Duration::from_millis(200);

pub type SessionId = String;

/// Lifecycle of a session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The client closed the connection.
    TransportClosed,
    /// The connection failed.
    TransportError,
    /// The shell exited, with its code when known.
    ProcessExited(Option<i32>),
    /// No activity within the idle timeout.
    IdleTimeout,
    /// Explicit destroy by the server or an operator.
    Requested,
}

/// Outcome of submitting client input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    /// Queued for the shell's stdin.
    Forwarded,
    /// Matched the denylist; a notice was sent instead.
    Blocked,
    /// The session is shutting down.
    Dropped,
}

/// Registry-wide settings.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub shell: Option<String>,
}

/// One client-to-shell bridge.
pub struct Session {
    id: SessionId,
    created_at: SystemTime,
    state: Mutex<SessionState>,
    process: Arc<dyn ShellHandle>,
    transport: TransportHandle,
    idle: IdleSupervisor,
    screener: Arc<CommandScreener>,
    input_tx: mpsc::Sender<Vec<u8>>,
    /// Cancels the stdin writer, output pumps and exit watcher.
    cancel: CancellationToken,
}

impl Session {
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    #[cfg(test)]
    pub fn idle(&self) -> &IdleSupervisor {
        &self.idle
    }

    pub fn supports_resize(&self) -> bool {
        self.process.supports_resize()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Screen client input and queue it for the shell.
    ///
    /// Accepted input counts as activity. Blocked input never reaches the
    /// shell; the client gets one notice on the output channel.
    pub async fn submit_input(&self, data: String) -> InputOutcome {
        if self.screener.is_dangerous(&data) {
            warn!(session_id = %self.id, "blocked dangerous input");
            self.transport.send(ServerFrame::blocked_notice()).await;
            return InputOutcome::Blocked;
        }
        if self.cancel.is_cancelled() {
            return InputOutcome::Dropped;
        }
        self.idle.touch();
        tokio::select! {
            sent = self.input_tx.send(data.into_bytes()) => {
                if sent.is_ok() { InputOutcome::Forwarded } else { InputOutcome::Dropped }
            }
            _ = self.cancel.cancelled() => InputOutcome::Dropped,
        }
    }

    /// Resize the terminal, clamped to the supported range.
    /// Accepted and ignored when the shell has no terminal.
    pub fn resize(&self, cols: i64, rows: i64) -> GateResult<()> {
        if !self.supports_resize() {
            debug!(session_id = %self.id, cols, rows, "resize without PTY ignored");
            return Ok(());
        }
        let (cols, rows) = clamp_dimensions(cols, rows);
        self.process.resize(cols, rows)
    }

    /// Send a frame to this session's client.
    pub async fn send(&self, frame: ServerFrame) -> bool {
        self.transport.send(frame).await
    }

    /// Move to `Closing`. Only the first caller gets `true`.
    fn begin_closing(&self) -> bool {
        let mut state = self.lock_state();
        match *state {
            SessionState::Closing | SessionState::Closed => false,
            _ => {
                *state = SessionState::Closing;
                true
            }
        }
    }

    fn set_state(&self, next: SessionState) {
        *self.lock_state() = next;
    }

    /// Release everything exactly once: timer, tasks, process, transport.
    async fn teardown(&self, reason: Teardown) {
        if !self.begin_closing() {
            return;
        }
        self.idle.cancel();
        self.cancel.cancel();

        match reason {
            Teardown::IdleTimeout => {
                self.transport.send(ServerFrame::timeout_notice()).await;
            }
            Teardown::ProcessExited(code) => {
                self.transport
                    .send(ServerFrame::Exit {
                        code: code.unwrap_or(-1),
                    })
                    .await;
            }
            Teardown::TransportClosed | Teardown::TransportError | Teardown::Requested => {}
        }

        self.process.kill();
        self.transport.close();
        self.set_state(SessionState::Closed);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Manages all live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    spawner: Arc<dyn ShellSpawner>,
    screener: Arc<CommandScreener>,
    settings: RegistrySettings,
}

impl SessionRegistry {
    pub fn new(
        spawner: Arc<dyn ShellSpawner>,
        screener: Arc<CommandScreener>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            spawner,
            screener,
            settings,
        }
    }

    /// Spawn a shell for `transport` and register the session.
    ///
    /// The client receives `ready` with the new id before any output. On
    /// failure nothing is stored; the client gets a notice and the
    /// transport is closed.
    pub async fn create(self: &Arc<Self>, transport: TransportHandle) -> GateResult<SessionId> {
        let live = self.count().await;
        if live >= self.settings.max_sessions {
            let err = limit_reached(self.settings.max_sessions);
            warn!(live, "rejecting session: limit reached");
            reject(&transport, &err).await;
            return Err(err);
        }

        let command = ShellCommand::interactive(self.settings.shell.as_deref());
        let spawned = match self.spawner.spawn(&command) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(error = %e, shell = %command.program, "shell spawn failed");
                reject(&transport, &e).await;
                return Err(e);
            }
        };

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let session = {
            let mut sessions = self.sessions.write().await;
            // Concurrent creates may have taken the last slot while this shell spawned.
            if sessions.len() >= self.settings.max_sessions {
                drop(sessions);
                spawned.handle.kill();
                let err = limit_reached(self.settings.max_sessions);
                warn!(pid = spawned.handle.pid(), "rejecting session: limit reached during spawn");
                reject(&transport, &err).await;
                return Err(err);
            }
            let mut id = generate_session_id();
            while sessions.contains_key(&id) {
                id = generate_session_id();
            }
            let session = Arc::new(Session {
                id: id.clone(),
                created_at: SystemTime::now(),
                state: Mutex::new(SessionState::Connecting),
                process: spawned.handle,
                transport,
                idle: IdleSupervisor::new(self.settings.idle_timeout),
                screener: self.screener.clone(),
                input_tx,
                cancel: CancellationToken::new(),
            });
            sessions.insert(id, session.clone());
            session
        };

        info!(
            session_id = %session.id,
            pid = session.pid(),
            mode = self.spawner.mode_name(),
            resize = session.supports_resize(),
            "session created"
        );

        session.send(ServerFrame::ready(session.id.clone())).await;

        spawn_stdin_writer(&session, input_rx);
        let stdout = spawn_output_pump(&session, spawned.stdout, "stdout");
        let stderr = spawn_output_pump(&session, spawned.stderr, "stderr");
        self.spawn_exit_watcher(&session, spawned.exit, stdout, stderr);
        self.spawn_idle_watch(&session);

        // A trigger may already have started teardown; never move back from it.
        {
            let mut state = session.lock_state();
            if *state == SessionState::Connecting {
                *state = SessionState::Active;
            }
        }

        Ok(session.id.clone())
    }

    /// Look up a live session.
    pub async fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Destroy a session on explicit request.
    pub async fn destroy(&self, session_id: &str) -> bool {
        self.destroy_with(session_id, Teardown::Requested).await
    }

    /// Remove the session and release its resources.
    ///
    /// Returns `true` only for the call that performed the teardown.
    pub async fn destroy_with(&self, session_id: &str, reason: Teardown) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        let Some(session) = removed else {
            debug!(session_id, ?reason, "destroy: session already gone");
            return false;
        };
        session.teardown(reason).await;
        let age_secs = session
            .created_at()
            .elapsed()
            .map(|age| age.as_secs())
            .unwrap_or_default();
        info!(
            session_id,
            ?reason,
            state = ?session.state(),
            age_secs,
            "session destroyed"
        );
        true
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Ids of all live sessions.
    pub async fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Destroy every live session.
    pub async fn shutdown(&self) -> usize {
        let mut destroyed = 0;
        for id in self.ids().await {
            if self.destroy(&id).await {
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            info!(count = destroyed, "sessions shut down");
        }
        destroyed
    }

    fn spawn_exit_watcher(
        self: &Arc<Self>,
        session: &Arc<Session>,
        mut exit: ExitStatus,
        stdout: JoinHandle<()>,
        stderr: JoinHandle<()>,
    ) {
        let registry = Arc::clone(self);
        let id = session.id.clone();
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            let pumps = async {
                let _ = stdout.await;
                let _ = stderr.await;
            };
            tokio::pin!(pumps);

            let (code, drained) = tokio::select! {
                _ = cancel.cancelled() => return,
                status = &mut exit => (status.ok().flatten(), false),
                _ = &mut pumps => {
                    // Both streams closed; the status normally follows right away.
                    let code = match tokio::time::timeout(EXIT_STATUS_GRACE, &mut exit).await {
                        Ok(Ok(code)) => code,
                        _ => None,
                    };
                    (code, true)
                }
            };

            if !drained {
                let _ = tokio::time::timeout(OUTPUT_FLUSH_GRACE, &mut pumps).await;
            }

            debug!(session_id = %id, ?code, "shell finished");
            registry.destroy_with(&id, Teardown::ProcessExited(code)).await;
        });
    }

    fn spawn_idle_watch(self: &Arc<Self>, session: &Arc<Session>) {
        let registry = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            if session.idle.wait_expired().await {
                info!(session_id = %session.id, "session idle timeout");
                registry
                    .destroy_with(&session.id, Teardown::IdleTimeout)
                    .await;
            }
        });
    }
}

/// Forward queued input to the shell in arrival order.
fn spawn_stdin_writer(session: &Arc<Session>, mut input_rx: mpsc::Receiver<Vec<u8>>) {
    let process = Arc::clone(&session.process);
    let cancel = session.cancel.clone();
    let id = session.id.clone();
    tokio::spawn(async move {
        loop {
            let data = tokio::select! {
                _ = cancel.cancelled() => break,
                next = input_rx.recv() => match next {
                    Some(data) => data,
                    None => break,
                },
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = process.write(&data) => result,
            };
            if let Err(e) = result {
                debug!(session_id = %id, error = %e, "stdin write failed");
                break;
            }
        }
    });
}

/// Relay one output stream to the client. Each chunk is activity.
fn spawn_output_pump(
    session: &Arc<Session>,
    mut chunks: OutputChunks,
    stream: &'static str,
) -> JoinHandle<()> {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let mut decoder = Utf8ChunkDecoder::new();
        loop {
            let chunk = tokio::select! {
                _ = session.cancel.cancelled() => return,
                chunk = chunks.recv() => chunk,
            };
            let Some(chunk) = chunk else { break };
            session.idle.touch();
            let text = decoder.feed(&chunk);
            if !text.is_empty() {
                session.transport.send(ServerFrame::output(text)).await;
            }
        }
        let tail = decoder.finish();
        if !tail.is_empty() {
            session.transport.send(ServerFrame::output(tail)).await;
        }
        debug!(session_id = %session.id, stream, "output stream ended");
    })
}

fn limit_reached(max_sessions: usize) -> GateError {
    GateError::LimitReached(format!("max sessions ({max_sessions}) reached"))
}

/// Tell the client why no session was created, then close.
async fn reject(transport: &TransportHandle, err: &GateError) {
    transport
        .send(ServerFrame::output(format!(
            "\r\n\x1b[31m[Session unavailable: {err}]\x1b[0m\r\n"
        )))
        .await;
    transport.close();
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> SessionId {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::bridge::testing::FakeSpawner;
    use crate::transport::OUTBOUND_CAPACITY;
    use shellgate_core::messages::{BLOCKED_NOTICE, TIMEOUT_NOTICE};

    fn registry_with(spawner: Arc<FakeSpawner>, max_sessions: usize) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            spawner,
            Arc::new(CommandScreener::builtin()),
            RegistrySettings {
                max_sessions,
                idle_timeout: Duration::from_secs(600),
                shell: Some("/bin/sh".into()),
            },
        ))
    }

    fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn create_sends_ready_first_and_counts() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 10);
        let (transport, mut rx) = TransportHandle::channel(OUTBOUND_CAPACITY);

        let id = registry.create(transport).await.unwrap();
        assert_eq!(id.len(), 32);
        assert_eq!(registry.count().await, 1);
        assert_eq!(rx.recv().await, Some(ServerFrame::ready(id.clone())));

        let session = registry.lookup(&id).await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.created_at() <= SystemTime::now());
    }

    #[tokio::test]
    async fn session_ids_are_unique() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner, 10);
        let (a, _ra) = TransportHandle::channel(8);
        let (b, _rb) = TransportHandle::channel(8);
        let id_a = registry.create(a).await.unwrap();
        let id_b = registry.create(b).await.unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(registry.count().await, 2);
    }

    #[tokio::test]
    async fn spawn_failure_stores_nothing() {
        let spawner = Arc::new(FakeSpawner {
            fail: true,
            ..Default::default()
        });
        let registry = registry_with(spawner, 10);
        let (transport, mut rx) = TransportHandle::channel(8);

        let err = registry.create(transport.clone()).await.unwrap_err();
        assert!(matches!(err, GateError::Spawn(_)));
        assert_eq!(registry.count().await, 0);
        assert!(transport.is_closed());
        match rx.recv().await {
            Some(ServerFrame::Output { data }) => assert!(data.contains("unavailable")),
            other => panic!("expected notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_limit_enforced() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 1);
        let (a, _ra) = TransportHandle::channel(8);
        let (b, _rb) = TransportHandle::channel(8);
        registry.create(a).await.unwrap();
        let err = registry.create(b.clone()).await.unwrap_err();
        assert!(matches!(err, GateError::LimitReached(_)));
        assert!(b.is_closed());
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_respect_limit() {
        let spawner = Arc::new(FakeSpawner {
            spawn_delay: Duration::from_millis(50),
            ..Default::default()
        });
        let registry = registry_with(spawner.clone(), 1);

        let mut tasks = Vec::new();
        let mut transports = Vec::new();
        for _ in 0..4 {
            let (transport, rx) = TransportHandle::channel(8);
            transports.push((transport.clone(), rx));
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move { registry.create(transport).await }));
        }
        let mut created = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(matches!(e, GateError::LimitReached(_))),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(registry.count().await, 1);
        assert_eq!(
            transports.iter().filter(|(t, _)| t.is_closed()).count(),
            3
        );
        // Shells spawned for rejected sessions are killed, the winner's is not.
        let spawned = spawner.spawned.lock().unwrap();
        let running = spawned
            .iter()
            .filter(|c| c.shell.kill_count() == 0)
            .count();
        assert_eq!(running, 1);
    }

    #[tokio::test]
    async fn spawn_uses_prepared_command() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 10);
        let (transport, _rx) = TransportHandle::channel(8);
        registry.create(transport).await.unwrap();
        let commands = spawner.commands.lock().unwrap();
        assert_eq!(commands[0].program, "/bin/sh");
        assert!(commands[0].env_remove.iter().any(|v| v == "SUDO_USER"));
    }

    #[tokio::test]
    async fn input_forwarded_in_order() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 10);
        let (transport, _rx) = TransportHandle::channel(OUTBOUND_CAPACITY);
        let id = registry.create(transport).await.unwrap();
        let controls = spawner.take_last();
        let session = registry.lookup(&id).await.unwrap();

        for part in ["echo ", "hi", "\n"] {
            assert_eq!(
                session.submit_input(part.to_string()).await,
                InputOutcome::Forwarded
            );
        }
        settle().await;
        assert_eq!(controls.shell.written_text(), "echo hi\n");
    }

    #[tokio::test]
    async fn dangerous_input_never_written() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 10);
        let (transport, mut rx) = TransportHandle::channel(OUTBOUND_CAPACITY);
        let id = registry.create(transport).await.unwrap();
        let controls = spawner.take_last();
        let session = registry.lookup(&id).await.unwrap();
        let _ready = rx.recv().await;

        for bad in ["rm -rf /\n", ":(){ :|:& };:", "mkfs.ext4 /dev/sda", "dd if=x of=/dev/sda"] {
            assert_eq!(
                session.submit_input(bad.to_string()).await,
                InputOutcome::Blocked
            );
        }
        settle().await;
        assert!(controls.shell.writes.lock().unwrap().is_empty());

        let notices = drain(&mut rx);
        assert_eq!(notices.len(), 4);
        for notice in notices {
            assert_eq!(notice, ServerFrame::output(BLOCKED_NOTICE));
        }
        // Blocked input does not end the session.
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn output_streams_relayed_and_decoded() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 10);
        let (transport, mut rx) = TransportHandle::channel(OUTBOUND_CAPACITY);
        registry.create(transport).await.unwrap();
        let controls = spawner.take_last();
        let _ready = rx.recv().await;

        let bytes = "é!".as_bytes();
        controls.stdout.send(bytes[..1].to_vec()).await.unwrap();
        controls.stdout.send(bytes[1..].to_vec()).await.unwrap();
        controls.stderr.send(b"warn".to_vec()).await.unwrap();

        let mut text = String::new();
        for _ in 0..2 {
            match rx.recv().await {
                Some(ServerFrame::Output { data }) => text.push_str(&data),
                other => panic!("expected output, got {other:?}"),
            }
        }
        assert!(text.contains("é!"));
        assert!(text.contains("warn"));
    }

    #[tokio::test]
    async fn process_exit_sends_exit_then_closes() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 10);
        let (transport, mut rx) = TransportHandle::channel(OUTBOUND_CAPACITY);
        registry.create(transport.clone()).await.unwrap();
        let controls = spawner.take_last();
        let _ready = rx.recv().await;

        controls.stdout.send(b"bye\n".to_vec()).await.unwrap();
        drop(controls.stdout);
        drop(controls.stderr);
        controls.exit.send(Some(7)).unwrap();

        transport.closed().await;
        let frames = drain(&mut rx);
        assert_eq!(frames.first(), Some(&ServerFrame::output("bye\n")));
        assert_eq!(frames.last(), Some(&ServerFrame::Exit { code: 7 }));
        assert_eq!(registry.count().await, 0);
        assert_eq!(controls.shell.kill_count(), 1);
    }

    #[tokio::test]
    async fn streams_closing_without_status_reports_unknown_code() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 10);
        let (transport, mut rx) = TransportHandle::channel(OUTBOUND_CAPACITY);
        registry.create(transport.clone()).await.unwrap();
        let controls = spawner.take_last();
        let _ready = rx.recv().await;

        drop(controls.stdout);
        drop(controls.stderr);
        drop(controls.exit);

        transport.closed().await;
        assert_eq!(drain(&mut rx), vec![ServerFrame::Exit { code: -1 }]);
    }

    #[tokio::test]
    async fn concurrent_destroy_tears_down_once() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 10);
        let (transport, _rx) = TransportHandle::channel(OUTBOUND_CAPACITY);
        let id = registry.create(transport.clone()).await.unwrap();
        let controls = spawner.take_last();

        let triggers = [
            Teardown::TransportClosed,
            Teardown::ProcessExited(Some(0)),
            Teardown::TransportError,
            Teardown::Requested,
        ];
        let mut tasks = Vec::new();
        for reason in triggers {
            let registry = registry.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                registry.destroy_with(&id, reason).await
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(controls.shell.kill_count(), 1);
        assert!(transport.is_closed());
        assert!(!transport.close());
        assert_eq!(registry.count().await, 0);
        assert!(registry.lookup(&id).await.is_none());
        assert!(!registry.destroy(&id).await);
    }

    #[tokio::test]
    async fn destroyed_session_drops_input() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 10);
        let (transport, _rx) = TransportHandle::channel(OUTBOUND_CAPACITY);
        let id = registry.create(transport).await.unwrap();
        let controls = spawner.take_last();
        let session = registry.lookup(&id).await.unwrap();

        assert!(registry.destroy(&id).await);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.submit_input("ls\n".into()).await,
            InputOutcome::Dropped
        );
        settle().await;
        assert!(controls.shell.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resize_clamped_when_supported() {
        let spawner = Arc::new(FakeSpawner {
            resizable: true,
            ..Default::default()
        });
        let registry = registry_with(spawner.clone(), 10);
        let (transport, _rx) = TransportHandle::channel(8);
        let id = registry.create(transport).await.unwrap();
        let controls = spawner.take_last();
        let session = registry.lookup(&id).await.unwrap();

        assert!(session.supports_resize());
        session.resize(10_000, 10_000).unwrap();
        session.resize(0, 0).unwrap();
        assert_eq!(
            *controls.shell.resizes.lock().unwrap(),
            vec![(300, 100), (1, 1)]
        );

        // Dead process: silently ignored.
        controls.shell.kill();
        session.resize(120, 40).unwrap();
        assert_eq!(controls.shell.resizes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resize_ignored_without_pty() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 10);
        let (transport, _rx) = TransportHandle::channel(8);
        let id = registry.create(transport).await.unwrap();
        let controls = spawner.take_last();
        let session = registry.lookup(&id).await.unwrap();

        assert!(!session.supports_resize());
        assert!(session.resize(10_000, 10_000).is_ok());
        assert!(controls.shell.resizes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_tears_down_once_with_notice() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 10);
        let (transport, mut rx) = TransportHandle::channel(OUTBOUND_CAPACITY);
        let id = registry.create(transport.clone()).await.unwrap();
        let controls = spawner.take_last();
        let _ready = rx.recv().await;

        tokio::time::sleep(Duration::from_secs(601)).await;
        settle().await;

        assert!(registry.lookup(&id).await.is_none());
        assert_eq!(drain(&mut rx), vec![ServerFrame::output(TIMEOUT_NOTICE)]);
        assert!(transport.is_closed());
        assert_eq!(controls.shell.kill_count(), 1);
        // A late trigger finds nothing to do.
        assert!(!registry.destroy_with(&id, Teardown::TransportClosed).await);
        assert_eq!(controls.shell.kill_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_keeps_session_alive() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner.clone(), 10);
        let (transport, _rx) = TransportHandle::channel(OUTBOUND_CAPACITY);
        let id = registry.create(transport).await.unwrap();
        let controls = spawner.take_last();
        let session = registry.lookup(&id).await.unwrap();

        for round in 0..4 {
            tokio::time::sleep(Duration::from_secs(9 * 60)).await;
            if round % 2 == 0 {
                session.submit_input("true\n".into()).await;
            } else {
                controls.stdout.send(b"$ ".to_vec()).await.unwrap();
            }
            settle().await;
        }

        assert!(registry.lookup(&id).await.is_some());
        assert_eq!(controls.shell.kill_count(), 0);
    }

    #[tokio::test]
    async fn blocked_input_is_not_activity() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner, 10);
        let (transport, _rx) = TransportHandle::channel(OUTBOUND_CAPACITY);
        let id = registry.create(transport).await.unwrap();
        let session = registry.lookup(&id).await.unwrap();

        let before = session.idle().deadline();
        tokio::time::sleep(Duration::from_millis(5)).await;
        session.submit_input("rm -rf /".into()).await;
        assert_eq!(session.idle().deadline(), before);
    }

    #[tokio::test]
    async fn shutdown_destroys_everything() {
        let spawner = Arc::new(FakeSpawner::default());
        let registry = registry_with(spawner, 10);
        for _ in 0..3 {
            let (transport, _rx) = TransportHandle::channel(8);
            registry.create(transport).await.unwrap();
        }
        assert_eq!(registry.shutdown().await, 3);
        assert_eq!(registry.count().await, 0);
    }
}
