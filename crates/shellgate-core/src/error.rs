use thiserror::Error;

/// Errors produced by the shellgate bridge.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("limit reached: {0}")]
    LimitReached(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::Codec(e.to_string())
    }
}

pub type GateResult<T> = Result<T, GateError>;
