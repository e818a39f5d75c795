use thiserror::Error;

/// Top-level error type for the retrieval system.
///
/// Load-time structural problems surface as [`RagError::Format`] or
/// [`RagError::NotFound`]; vector length disagreements as
/// [`RagError::Dimension`]. Model lifecycle errors are kept separate so that
/// callers can tell "no model loaded" apart from a failing model.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RagError {
    #[error("Format error: {0}")]
    Format(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for RagError {
    fn from(err: toml::de::Error) -> Self {
        RagError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for RagError {
    fn from(err: toml::ser::Error) -> Self {
        RagError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        RagError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for retrieval operations.
pub type Result<T> = std::result::Result<T, RagError>;
