use thiserror::Error;

/// Top-level error type for the Noor system.
///
/// Covers the cross-cutting concerns shared by every crate (configuration,
/// session persistence, serialization). The conversation engine defines its
/// own `ChatError` and converts from this type so that `?` works across the
/// crate boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NoorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for NoorError {
    fn from(err: toml::de::Error) -> Self {
        NoorError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for NoorError {
    fn from(err: toml::ser::Error) -> Self {
        NoorError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for NoorError {
    fn from(err: serde_json::Error) -> Self {
        NoorError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Noor operations.
pub type Result<T> = std::result::Result<T, NoorError>;
