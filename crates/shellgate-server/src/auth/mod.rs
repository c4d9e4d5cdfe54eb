//! Authentication for the terminal endpoint.

pub mod token_gate;

pub use token_gate::{request_credential, TokenGate};
