//! Pipe-backed shells using tokio::process.
//!
//! Degraded mode for hosts without a usable pseudo-terminal: stdin, stdout
//! and stderr are plain pipes. Resize requests are accepted and ignored.

use super::bridge::{
    pump_output, ShellCommand, ShellHandle, ShellSpawner, SpawnedShell, CHUNK_CHANNEL_CAPACITY,
};
use shellgate_core::{GateError, GateResult};
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

/// Spawns shells attached to plain pipes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeSpawner;

impl ShellSpawner for PipeSpawner {
    fn spawn(&self, command: &ShellCommand) -> GateResult<SpawnedShell> {
        let mut cmd = Command::new(&command.program);
        cmd.current_dir(&command.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &command.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| GateError::Spawn(format!("failed to spawn {}: {e}", command.program)))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GateError::Spawn("child stdin not captured".into()))?;
        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| GateError::Spawn("child stdout not captured".into()))?;
        let child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| GateError::Spawn("child stderr not captured".into()))?;

        let (stdout_tx, stdout) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let (stderr_tx, stderr) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(pump_output(child_stdout, stdout_tx));
        tokio::spawn(pump_output(child_stderr, stderr_tx));

        let alive = Arc::new(AtomicBool::new(true));
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit) = oneshot::channel();

        let waiter_alive = alive.clone();
        tokio::spawn(async move {
            // A dropped kill sender also ends the shell.
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "kill after exit");
                    }
                    child.wait().await
                }
            };
            waiter_alive.store(false, Ordering::SeqCst);
            let code = status.ok().and_then(|s| s.code());
            info!(?code, "piped child exited");
            let _ = exit_tx.send(code);
        });

        info!(pid, program = %command.program, "piped shell spawned");

        let handle = PipeShell {
            stdin: Mutex::new(Some(stdin)),
            kill_tx: std::sync::Mutex::new(Some(kill_tx)),
            alive,
            pid,
        };

        Ok(SpawnedShell {
            handle: Arc::new(handle),
            stdout,
            stderr,
            exit,
        })
    }

    fn mode_name(&self) -> &'static str {
        "pipe"
    }
}

/// A running piped shell.
struct PipeShell {
    stdin: Mutex<Option<ChildStdin>>,
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    alive: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl ShellHandle for PipeShell {
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut guard = self.stdin.lock().await;
            let stdin = guard
                .as_mut()
                .ok_or_else(|| GateError::Process("stdin closed".into()))?;
            if let Err(e) = stdin.write_all(data).await {
                // Broken pipe: the shell is gone, stop accepting input.
                guard.take();
                return Err(e.into());
            }
            stdin.flush().await?;
            Ok(())
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> GateResult<()> {
        debug!(cols, rows, "resize ignored in pipe mode");
        Ok(())
    }

    fn kill(&self) {
        let sender = match self.kill_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
    }

    fn supports_resize(&self) -> bool {
        false
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}
