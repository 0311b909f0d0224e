//! Error types for protocol parsing.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while decoding API payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload is not valid JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field is missing.
    #[error("missing field `{field}` in {context}")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
        /// Where the field was expected.
        context: String,
    },

    /// A field has an unexpected shape.
    #[error("invalid value for `{field}`: {message}")]
    InvalidField {
        /// Name of the field.
        field: String,
        /// Description of the problem.
        message: String,
    },

    /// The payload has an unexpected top-level shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}
