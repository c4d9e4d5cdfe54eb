//! shellgate-core: Shared protocol library for the shellgate terminal bridge.
//!
//! Provides the JSON frame types exchanged over the WebSocket, the frame
//! codec, a streaming UTF-8 decoder for process output, and the error type
//! shared with the server.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_client_frame, encode_server_frame, Utf8ChunkDecoder};
pub use error::{GateError, GateResult};
pub use messages::{clamp_dimensions, ClientFrame, ServerFrame, MAX_COLS, MAX_ROWS};
