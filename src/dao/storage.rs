use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by document stores regardless of the underlying backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or rejected the request.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// Human readable summary of the failed operation.
        message: String,
        /// Backend-specific failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The backend refused access to a document or collection.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// A stored document did not match the expected shape.
    #[error("failed to decode document `{path}`")]
    Decode {
        /// Path of the offending document.
        path: String,
        /// Underlying deserialization failure.
        #[source]
        source: serde_json::Error,
    },
    /// A payload could not be turned into document fields.
    #[error("failed to encode document payload")]
    Encode(#[source] serde_json::Error),
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Construct a decode error for the document stored at `path`.
    pub fn decode(path: impl Into<String>, source: serde_json::Error) -> Self {
        StorageError::Decode {
            path: path.into(),
            source,
        }
    }
}
