//! Core error types for STRAND.

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Invalid encoding
    #[error("Invalid encoding: {reason}")]
    InvalidEncoding {
        /// Decoder message
        reason: String,
    },

    /// I/O failure while reading or writing a document
    #[error("I/O error on {path}: {reason}")]
    Io {
        /// Path involved
        path: String,
        /// Underlying message
        reason: String,
    },

    /// Validation error
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Offending field
        field: String,
        /// What is wrong with it
        reason: String,
    },

    /// Not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of entity
        kind: String,
        /// Name or id looked up
        id: String,
    },

    /// Already exists
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Kind of entity
        kind: String,
        /// Name or id that collided
        id: String,
    },

    /// Internal error (for unexpected errors)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl CoreError {
    /// Shorthand for a missing named entity
    #[must_use]
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}
