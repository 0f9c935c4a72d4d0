//! Error types for token and proof operations.

/// Errors produced while decoding or operating on privacy primitives.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PrivacyError {
    #[error("invalid base64: {0}")]
    InvalidBase64(String),

    #[error("invalid {kind} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("bytes do not encode a valid ristretto point")]
    InvalidPoint,

    #[error("bytes do not encode a canonical scalar")]
    InvalidScalar,

    #[error("{0} has no value")]
    MissingValue(&'static str),

    #[error("batch has {blinded} blinded tokens but {signed} signed tokens")]
    BatchLengthMismatch { blinded: usize, signed: usize },

    #[error("batch is empty")]
    EmptyBatch,
}

/// Result alias for privacy operations.
pub type Result<T> = std::result::Result<T, PrivacyError>;
