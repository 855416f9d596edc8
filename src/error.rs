//! Error types for FleetMQ.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Consumer terminated")]
    Terminated,

    #[error("{0}")]
    Other(String),
}
