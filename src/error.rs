use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Handshake header exceeds {max} bytes without a terminator")]
    HeaderTooLong { max: usize },

    #[error("No handshake header received before the timeout")]
    HeaderTimeout,
}

pub type Result<T> = std::result::Result<T, Error>;
