//! JSON framing for the terminal WebSocket plus output text decoding.
//!
//! Wire format: one JSON object per WebSocket text frame.

use crate::error::GateResult;
use crate::messages::{ClientFrame, ServerFrame};

/// Decode a client text frame.
///
/// Non-JSON text, unknown `type` values, and missing fields all fail.
pub fn decode_client_frame(text: &str) -> GateResult<ClientFrame> {
    Ok(serde_json::from_str(text)?)
}

/// Encode a server frame as JSON text.
pub fn encode_server_frame(frame: &ServerFrame) -> GateResult<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Streaming UTF-8 decoder for process output.
///
/// Pipes and PTYs split output at arbitrary byte boundaries, so a multi-byte
/// character may straddle two reads. Incomplete trailing sequences are held
/// back until the next chunk; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Feed a chunk and return all text that is complete so far.
    pub fn feed(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&rest[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + bad..];
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            rest = &rest[valid..];
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is still held back, replacing it lossily.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }

    /// Number of bytes waiting for the rest of their character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
