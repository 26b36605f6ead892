//! Error types for drishti-server

use thiserror::Error;

use crate::transport::SessionId;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Maximum sessions ({0}) reached")]
    SessionLimit(usize),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<image::ImageError> for TransportError {
    fn from(e: image::ImageError) -> Self {
        TransportError::Encode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Startup failures of the server process
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] drishti_core::Error),

    #[error("Pipeline error: {0}")]
    Vision(#[from] drishti_eye::VisionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
