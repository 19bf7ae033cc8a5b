//! Error types for the event detection and tracking library

use thiserror::Error;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors that can occur while detecting, tracking or persisting events
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Frame dimensions differ: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Feature vector has {actual} values, expected {expected}")]
    FeatureLength { expected: usize, actual: usize },

    #[error("Malformed event set stream: {0}")]
    MalformedStream(String),

    #[error("Classifier model error: {0}")]
    ModelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl EventError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedStream(msg.into())
    }

    pub fn model<S: Into<String>>(msg: S) -> Self {
        Self::ModelError(msg.into())
    }
}
