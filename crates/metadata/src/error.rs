use thiserror::Error;

/// Errors from metadata store operations.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}
