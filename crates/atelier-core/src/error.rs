//! Error types for the Atelier pipeline.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dataset schema error: {0}")]
    Schema(String),

    #[error("Attribute number mismatch: expected {expected}, got {actual}")]
    AttributeCountMismatch { expected: usize, actual: usize },

    #[error("Cloth type {cloth_type} expects {expected} landmarks, got {actual}")]
    LandmarkCountMismatch {
        cloth_type: i64,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid cloth type {0}")]
    UnknownClothType(i64),

    #[error("Invalid value for {option}: {value}")]
    UnknownMode { option: &'static str, value: String },

    #[error("Missing input file: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid training step transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Sample {id} failed: {source}")]
    Sample {
        id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Data loader closed before the epoch finished")]
    LoaderClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Attach the id of the sample being processed.
    pub fn for_sample(self, id: impl Into<String>) -> Self {
        Error::Sample {
            id: id.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Image(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
