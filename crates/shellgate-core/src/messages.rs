//! Terminal bridge frame types.
//!
//! Every WebSocket text frame carries exactly one JSON object tagged by its
//! `type` field. Client frames drive the shell; server frames report output,
//! lifecycle, and diagnostics.

use serde::{Deserialize, Serialize};

/// Widest terminal a client may request.
pub const MAX_COLS: u16 = 300;
/// Tallest terminal a client may request.
pub const MAX_ROWS: u16 = 100;

/// Notice sent in place of input that matched the command denylist.
pub const BLOCKED_NOTICE: &str = "\r\n\x1b[31m[BLOCKED] Dangerous command rejected.\x1b[0m\r\n";
/// Notice sent when a session is closed for inactivity.
pub const TIMEOUT_NOTICE: &str = "\r\n\x1b[33m[Session timed out]\x1b[0m\r\n";

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Raw text for the shell's stdin.
    Input { data: String },
    /// New terminal dimensions. Accepted as wide integers and clamped later.
    Resize { cols: i64, rows: i64 },
    /// Liveness check; answered with [`ServerFrame::Pong`].
    Ping,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// The session is live; `data` is the session id.
    Ready { data: String },
    /// Process output or a diagnostic notice.
    Output { data: String },
    /// The shell exited with `code` (`-1` when no status is available).
    Exit { code: i32 },
    /// Reply to a client ping.
    Pong,
}

impl ServerFrame {
    pub fn ready(session_id: impl Into<String>) -> Self {
        ServerFrame::Ready {
            data: session_id.into(),
        }
    }

    pub fn output(data: impl Into<String>) -> Self {
        ServerFrame::Output { data: data.into() }
    }

    pub fn blocked_notice() -> Self {
        Self::output(BLOCKED_NOTICE)
    }

    pub fn timeout_notice() -> Self {
        Self::output(TIMEOUT_NOTICE)
    }
}

/// Clamp requested dimensions to `[1, MAX_COLS]` x `[1, MAX_ROWS]`.
pub fn clamp_dimensions(cols: i64, rows: i64) -> (u16, u16) {
    let cols = cols.clamp(1, MAX_COLS as i64) as u16;
    let rows = rows.clamp(1, MAX_ROWS as i64) as u16;
    (cols, rows)
}
