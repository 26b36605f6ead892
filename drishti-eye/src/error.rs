//! Error types for drishti-eye

use drishti_core::Error as CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Model error: {0}")]
    Model(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

pub type Result<T> = std::result::Result<T, VisionError>;
