//! Error types for drishti-client

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid stream URL: {0}")]
    InvalidUrl(String),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Client has shut down")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
