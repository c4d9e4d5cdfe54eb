//! PTY-backed shells using portable-pty.
//!
//! Opens a pseudo-terminal, spawns the shell on its slave side, and drains
//! the master on a dedicated reader thread. Stdout and stderr share the
//! terminal, so the stderr sequence of a PTY shell is always empty.

use super::bridge::{
    closed_chunks, ShellCommand, ShellHandle, ShellSpawner, SpawnedShell,
    CHUNK_CHANNEL_CAPACITY, READ_BUFFER_SIZE,
};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use shellgate_core::{clamp_dimensions, GateError, GateResult};
use std::future::Future;
use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Spawns shells on a fresh pseudo-terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl ShellSpawner for PtySpawner {
    fn spawn(&self, command: &ShellCommand) -> GateResult<SpawnedShell> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: command.rows,
                cols: command.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| GateError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.cwd(&command.cwd);
        for key in &command.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| GateError::Spawn(format!("failed to spawn {}: {e}", command.program)))?;
        // Only the child may hold the slave, so the master reads EOF once it exits.
        drop(pair.slave);

        let pid = child.process_id();
        let mut killer = child.clone_killer();

        // From here on a setup failure must not leave the shell running.
        let reader = kill_on_error(
            killer.as_mut(),
            pair.master
                .try_clone_reader()
                .map_err(|e| GateError::Spawn(format!("failed to clone PTY reader: {e}"))),
        )?;
        let writer = kill_on_error(
            killer.as_mut(),
            pair.master
                .take_writer()
                .map_err(|e| GateError::Spawn(format!("failed to take PTY writer: {e}"))),
        )?;

        let alive = Arc::new(AtomicBool::new(true));

        let (stdout_tx, stdout) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        kill_on_error(
            killer.as_mut(),
            std::thread::Builder::new()
                .name("pty-reader".into())
                .spawn(move || read_master(reader, stdout_tx))
                .map_err(|e| GateError::Spawn(format!("failed to start PTY reader: {e}"))),
        )?;

        let (exit_tx, exit) = oneshot::channel();
        let waiter_alive = alive.clone();
        kill_on_error(
            killer.as_mut(),
            std::thread::Builder::new()
                .name("pty-waiter".into())
                .spawn(move || {
                    let code = child
                        .wait()
                        .ok()
                        .and_then(|status| i32::try_from(status.exit_code()).ok());
                    waiter_alive.store(false, Ordering::SeqCst);
                    info!(?code, "PTY child exited");
                    let _ = exit_tx.send(code);
                })
                .map_err(|e| GateError::Spawn(format!("failed to start PTY waiter: {e}"))),
        )?;

        info!(pid, cols = command.cols, rows = command.rows, "PTY spawned");

        let handle = PtyShell {
            writer: Arc::new(Mutex::new(writer)),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            alive,
            killed: AtomicBool::new(false),
            pid,
        };

        Ok(SpawnedShell {
            handle: Arc::new(handle),
            stdout,
            stderr: closed_chunks(),
            exit,
        })
    }

    fn mode_name(&self) -> &'static str {
        "pty"
    }
}

/// Kill a freshly spawned child when the rest of its setup failed.
fn kill_on_error<T>(
    killer: &mut (dyn ChildKiller + Send + Sync),
    result: GateResult<T>,
) -> GateResult<T> {
    if let Err(e) = &result {
        debug!(error = %e, "PTY setup failed after spawn, killing child");
        if let Err(kill_err) = killer.kill() {
            debug!(error = %kill_err, "kill after failed setup");
        }
    }
    result
}

/// Blocking read loop for the PTY master.
fn read_master(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            // EIO is how Linux reports a hung-up slave.
            Err(e) => {
                debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}

/// A running PTY shell.
struct PtyShell {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    /// Kept for resize; MasterPty is not Sync.
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    alive: Arc<AtomicBool>,
    killed: AtomicBool,
    pid: Option<u32>,
}

impl ShellHandle for PtyShell {
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + 'a>> {
        let writer = self.writer.clone();
        let data = data.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || -> GateResult<()> {
                let mut writer = writer
                    .lock()
                    .map_err(|_| GateError::Process("PTY writer lock poisoned".into()))?;
                writer.write_all(&data)?;
                writer.flush()?;
                Ok(())
            })
            .await
            .map_err(|e| GateError::Other(format!("join error: {e}")))?
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> GateResult<()> {
        if !self.is_alive() {
            return Ok(());
        }
        let (cols, rows) = clamp_dimensions(cols.into(), rows.into());
        let master = self
            .master
            .lock()
            .map_err(|_| GateError::Process("PTY master lock poisoned".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| GateError::Process(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) || !self.is_alive() {
            return;
        }
        let mut killer = match self.killer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // The child may exit between the liveness check and here.
        if let Err(e) = killer.kill() {
            debug!(error = %e, "PTY kill after exit");
        }
    }

    fn supports_resize(&self) -> bool {
        true
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}
