//! Error types for the confirmations subsystem.
//!
//! Engines never surface these to their delegates. They classify failures
//! into `should_retry` / `should_backoff` flags and log the details.

use crate::endpoint::EndpointError;
use adrewards_privacy::PrivacyError;

/// Errors produced by stores, configuration and the façade.
#[derive(thiserror::Error, Debug)]
pub enum ConfirmationsError {
    /// Storage backend failed to read or write.
    #[error("storage error: {0}")]
    Storage(String),

    /// State could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Privacy(#[from] PrivacyError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// Wallet is missing a payment id or has a malformed recovery seed.
    #[error("invalid wallet: {0}")]
    InvalidWallet(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation needed catalog issuers before any were set.
    #[error("catalog issuers are not available")]
    MissingIssuers,

    #[error("not found: {0}")]
    NotFound(String),
}

impl ConfirmationsError {
    /// Returns true if repeating the operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_) | Self::Io(_) | Self::MissingIssuers => true,
            Self::Endpoint(e) => e.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn lock_poisoned(what: &str) -> Self {
        Self::Storage(format!("{} lock poisoned", what))
    }
}

/// Common result alias for confirmations operations.
pub type Result<T> = std::result::Result<T, ConfirmationsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ConfirmationsError::Storage("disk full".into()).is_retryable());
        assert!(ConfirmationsError::MissingIssuers.is_retryable());
        assert!(ConfirmationsError::Endpoint(EndpointError::Status { status: 503 }).is_retryable());
        assert!(!ConfirmationsError::Endpoint(EndpointError::Status { status: 400 }).is_retryable());
        assert!(!ConfirmationsError::InvalidWallet("empty payment id".into()).is_retryable());
        assert!(!ConfirmationsError::Privacy(PrivacyError::EmptyBatch).is_retryable());
    }

    #[test]
    fn test_lock_poisoned_message() {
        let err = ConfirmationsError::lock_poisoned("token store");
        assert_eq!(err.to_string(), "storage error: token store lock poisoned");
    }
}
