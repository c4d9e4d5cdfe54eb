//! Per-session idle countdown.
//!
//! Every recorded activity pushes the deadline out by the full timeout.
//! [`IdleSupervisor::wait_expired`] resolves `true` once the deadline passes
//! with no activity, or `false` if the supervisor is cancelled first.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default idle timeout (10 minutes).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub struct IdleSupervisor {
    timeout: Duration,
    deadline: Mutex<Instant>,
    activity: Notify,
    cancel: CancellationToken,
}

impl IdleSupervisor {
    /// Armed supervisor; the first deadline is `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Mutex::new(Instant::now() + timeout),
            activity: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Record activity: restart the countdown.
    pub fn touch(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        *self.lock_deadline() = Instant::now() + self.timeout;
        self.activity.notify_one();
    }

    /// Current deadline.
    pub fn deadline(&self) -> Instant {
        *self.lock_deadline()
    }

    /// Stop the countdown. Returns `true` for the call that actually cancelled.
    pub fn cancel(&self) -> bool {
        let first = !self.cancel.is_cancelled();
        self.cancel.cancel();
        first
    }

    /// Wait for expiry. Resolves `false` if cancelled first.
    pub async fn wait_expired(&self) -> bool {
        loop {
            let deadline = self.deadline();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = self.activity.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    // A touch can land between the timer firing and this check.
                    if self.deadline() <= Instant::now() {
                        return !self.cancel.is_cancelled();
                    }
                }
            }
        }
    }

    fn lock_deadline(&self) -> std::sync::MutexGuard<'_, Instant> {
        match self.deadline.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
