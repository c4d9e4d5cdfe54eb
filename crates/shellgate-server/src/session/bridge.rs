//! Process bridge: the seam between a session and its shell process.
//!
//! A [`ShellSpawner`] starts one shell and hands back a [`SpawnedShell`]:
//! a shared [`ShellHandle`] for stdin/resize/kill plus the finite output
//! sequences and the exit status. Two spawners exist, PTY and plain pipes;
//! callers check [`ShellHandle::supports_resize`] instead of caring which.

use shellgate_core::GateResult;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};

/// Buffer size for a single output read.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered per output stream before the reader waits.
pub const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Inherited variables that mark an elevated caller; removed before exec.
pub const STRIPPED_ENV: &[&str] = &[
    "SUDO_USER",
    "SUDO_UID",
    "SUDO_GID",
    "SUDO_COMMAND",
    "SUDO_ASKPASS",
];

/// Initial terminal size for PTY shells.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// A finite sequence of output chunks; ends when the stream closes.
pub type OutputChunks = mpsc::Receiver<Vec<u8>>;

/// Resolves once with the exit code, `None` when the OS gave no code.
pub type ExitStatus = oneshot::Receiver<Option<i32>>;

/// Everything needed to start one interactive shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub cwd: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Inherited variables removed before exec.
    pub env_remove: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

impl ShellCommand {
    /// The operator's interactive shell, started in their home directory.
    ///
    /// Shell resolution: `shell_override`, then `$SHELL`, then `/bin/sh`.
    pub fn interactive(shell_override: Option<&str>) -> Self {
        let program = shell_override
            .map(str::to_string)
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string());

        Self {
            program,
            cwd: working_dir(dirs::home_dir().as_deref()),
            env: vec![
                ("TERM".to_string(), "xterm-256color".to_string()),
                ("COLORTERM".to_string(), "truecolor".to_string()),
            ],
            env_remove: STRIPPED_ENV.iter().map(|s| s.to_string()).collect(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// Home directory, unless it is missing or the filesystem root.
fn working_dir(home: Option<&Path>) -> PathBuf {
    match home {
        Some(dir) if dir != Path::new("/") => dir.to_path_buf(),
        _ => std::env::temp_dir(),
    }
}

/// Live handle to a spawned shell, shared by the session's tasks.
pub trait ShellHandle: Send + Sync {
    /// Write bytes to the shell's stdin. May wait while the shell is not reading.
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + 'a>>;

    /// Resize the terminal. Dimensions are clamped to the supported range.
    /// A no-op when the process is gone or resize is unsupported.
    fn resize(&self, cols: u16, rows: u16) -> GateResult<()>;

    /// Kill the process. Safe to call any number of times, on a dead process too.
    fn kill(&self);

    /// Whether [`resize`](Self::resize) has any effect.
    fn supports_resize(&self) -> bool;

    /// Whether the process is still running.
    fn is_alive(&self) -> bool;

    /// OS process id, when known.
    fn pid(&self) -> Option<u32>;
}

/// A freshly started shell.
pub struct SpawnedShell {
    pub handle: Arc<dyn ShellHandle>,
    pub stdout: OutputChunks,
    /// Empty in PTY mode, where stderr is merged into the terminal stream.
    pub stderr: OutputChunks,
    pub exit: ExitStatus,
}

/// Starts shells for new sessions.
pub trait ShellSpawner: Send + Sync {
    fn spawn(&self, command: &ShellCommand) -> GateResult<SpawnedShell>;

    /// Name used in logs.
    fn mode_name(&self) -> &'static str;
}

/// Drain an async reader into a chunk channel until EOF, error, or the
/// receiver goes away.
pub(crate) async fn pump_output<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// A closed output sequence, for streams a spawner does not provide.
pub(crate) fn closed_chunks() -> OutputChunks {
    let (_tx, rx) = mpsc::channel(1);
    rx
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory shell used by registry and session tests.

    use super::*;
    use shellgate_core::GateError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    pub struct FakeShell {
        pub writes: Mutex<Vec<Vec<u8>>>,
        pub resizes: Mutex<Vec<(u16, u16)>>,
        pub kills: AtomicUsize,
        pub dead: AtomicBool,
        pub resizable: bool,
    }

    impl FakeShell {
        pub fn written_text(&self) -> String {
            let writes = self.writes.lock().unwrap();
            writes
                .iter()
                .map(|w| String::from_utf8_lossy(w).into_owned())
                .collect()
        }

        pub fn kill_count(&self) -> usize {
            self.kills.load(Ordering::SeqCst)
        }
    }

    impl ShellHandle for FakeShell {
        fn write<'a>(
            &'a self,
            data: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + 'a>> {
            Box::pin(async move {
                if self.dead.load(Ordering::SeqCst) {
                    return Err(GateError::Process("stdin closed".into()));
                }
                self.writes.lock().unwrap().push(data.to_vec());
                Ok(())
            })
        }

        fn resize(&self, cols: u16, rows: u16) -> GateResult<()> {
            if self.resizable && self.is_alive() {
                self.resizes.lock().unwrap().push((cols, rows));
            }
            Ok(())
        }

        fn kill(&self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.dead.store(true, Ordering::SeqCst);
        }

        fn supports_resize(&self) -> bool {
            self.resizable
        }

        fn is_alive(&self) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }

        fn pid(&self) -> Option<u32> {
            None
        }
    }

    /// Test-side ends of one fake shell.
    pub struct FakeControls {
        pub shell: Arc<FakeShell>,
        pub stdout: mpsc::Sender<Vec<u8>>,
        pub stderr: mpsc::Sender<Vec<u8>>,
        pub exit: oneshot::Sender<Option<i32>>,
    }

    #[derive(Default)]
    pub struct FakeSpawner {
        pub fail: bool,
        pub resizable: bool,
        /// Blocks the spawning thread, like a slow exec.
        pub spawn_delay: Duration,
        pub spawned: Mutex<Vec<FakeControls>>,
        pub commands: Mutex<Vec<ShellCommand>>,
    }

    impl FakeSpawner {
        /// Take the controls of the most recently spawned shell.
        pub fn take_last(&self) -> FakeControls {
            self.spawned.lock().unwrap().pop().expect("no shell spawned")
        }

        pub fn spawn_count(&self) -> usize {
            self.commands.lock().unwrap().len()
        }
    }

    impl ShellSpawner for FakeSpawner {
        fn spawn(&self, command: &ShellCommand) -> GateResult<SpawnedShell> {
            self.commands.lock().unwrap().push(command.clone());
            if !self.spawn_delay.is_zero() {
                std::thread::sleep(self.spawn_delay);
            }
            if self.fail {
                return Err(GateError::Spawn("no such shell".into()));
            }
            let shell = Arc::new(FakeShell {
                resizable: self.resizable,
                ..Default::default()
            });
            let (stdout_tx, stdout) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
            let (stderr_tx, stderr) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
            let (exit_tx, exit) = oneshot::channel();
            self.spawned.lock().unwrap().push(FakeControls {
                shell: shell.clone(),
                stdout: stdout_tx,
                stderr: stderr_tx,
                exit: exit_tx,
            });
            Ok(SpawnedShell {
                handle: shell,
                stdout,
                stderr,
                exit,
            })
        }

        fn mode_name(&self) -> &'static str {
            "fake"
        }
    }
}
