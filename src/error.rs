//! Error types for the conversion engine

use thiserror::Error;

/// Result type alias for conversion operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while converting a vector document
#[derive(Error, Debug)]
pub enum Error {
    /// A rendering handle could not be created (engine unavailable)
    #[error("Rendering handle creation failed: {0}")]
    HandleCreationError(String),

    /// A single layer failed to render
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// Operation timed out
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// No layered document could be assembled
    #[error("Composition failed: {0}")]
    CompositionError(String),

    /// Remote document retrieval failed
    #[error("Failed to fetch document: {0}")]
    FetchError(String),

    /// Invalid configuration or conversion options
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// A layered document could not be decoded
    #[error("Malformed layered document: {0}")]
    DecodeError(String),

    /// The engine was shut down
    #[error("Engine is closed")]
    EngineClosed,

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error aborts a whole conversion rather than a single layer.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::HandleCreationError(_) | Error::CompositionError(_) | Error::EngineClosed | Error::Io(_)
        )
    }
}
