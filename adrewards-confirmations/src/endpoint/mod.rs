//! Network boundary to the confirmations backend.
//!
//! Engines talk to the backend only through [`ConfirmationsEndpoint`].
//! [`HttpConfirmationsEndpoint`] is the production implementation; tests use
//! the in-process issuer from the `testing` module.

mod http;

pub use http::{HttpConfirmationsEndpoint, HttpEndpointConfig};

use crate::confirmation::ConfirmationInfo;
use crate::tokens::UnblindedPaymentToken;
use crate::wallet::WalletInfo;
use adrewards_privacy::BlindedToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure talking to the backend.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// Connection failure, timeout or an unreadable body.
    #[error("transport error: {0}")]
    Transport(String),

    /// Backend answered with an unexpected status code.
    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },

    /// Body parsed but is missing fields or has the wrong shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Backend wants the user to solve a captcha before signing more tokens.
    #[error("captcha required: {captcha_id}")]
    CaptchaRequired { captcha_id: String },
}

impl EndpointError {
    /// Transport failures, malformed bodies, 5xx, 408 and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::InvalidResponse(_) => true,
            Self::Status { status } => *status >= 500 || *status == 408 || *status == 429,
            Self::CaptchaRequired { .. } => false,
        }
    }

    /// A 4xx answer other than 408 and 429: the request itself was refused.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Status { status } if (400..500).contains(status) && !self.is_transient())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status } => Some(*status),
            _ => None,
        }
    }
}

/// Signed tokens for a previously requested nonce.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignedTokensResponse {
    pub public_key: String,
    pub batch_proof: String,
    pub signed_tokens: Vec<String>,
}

/// Blind-signed payment token for a created confirmation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PaymentTokenResponse {
    pub id: String,
    pub public_key: String,
    pub batch_proof: String,
    pub signed_tokens: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedeemPaymentTokensResponse {
    /// Earliest time the backend accepts the next redemption.
    pub next_redemption_at: Option<DateTime<Utc>>,
}

/// Operations the engines need from the confirmations backend.
#[async_trait]
pub trait ConfirmationsEndpoint: Send + Sync {
    /// Ask the backend to sign `blinded`. Returns the nonce to poll with.
    async fn request_signed_tokens(
        &self,
        wallet: &WalletInfo,
        blinded: &[BlindedToken],
    ) -> Result<String, EndpointError>;

    async fn get_signed_tokens(
        &self,
        wallet: &WalletInfo,
        nonce: &str,
    ) -> Result<SignedTokensResponse, EndpointError>;

    /// Spend `confirmation.unblinded_token` on the confirmation. Idempotent
    /// per confirmation id.
    async fn create_confirmation(&self, confirmation: &ConfirmationInfo)
        -> Result<(), EndpointError>;

    async fn fetch_payment_token(
        &self,
        confirmation_id: &str,
    ) -> Result<PaymentTokenResponse, EndpointError>;

    async fn redeem_payment_tokens(
        &self,
        wallet: &WalletInfo,
        tokens: &[UnblindedPaymentToken],
    ) -> Result<RedeemPaymentTokensResponse, EndpointError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EndpointError::Transport("reset".into()).is_transient());
        assert!(EndpointError::InvalidResponse("missing batchProof".into()).is_transient());
        assert!(EndpointError::Status { status: 503 }.is_transient());
        assert!(EndpointError::Status { status: 429 }.is_transient());
        assert!(!EndpointError::Status { status: 409 }.is_transient());
        assert!(!EndpointError::CaptchaRequired {
            captcha_id: "abc".into()
        }
        .is_transient());
    }

    #[test]
    fn test_rejection_is_non_transient_4xx() {
        assert!(EndpointError::Status { status: 400 }.is_rejection());
        assert!(EndpointError::Status { status: 404 }.is_rejection());
        assert!(!EndpointError::Status { status: 408 }.is_rejection());
        assert!(!EndpointError::Status { status: 500 }.is_rejection());
        assert!(!EndpointError::Transport("timeout".into()).is_rejection());
        assert_eq!(EndpointError::Status { status: 404 }.status(), Some(404));
    }

    #[test]
    fn test_response_bodies_use_camel_case() {
        let parsed: SignedTokensResponse = serde_json::from_str(
            r#"{"publicKey":"pk","batchProof":"proof","signedTokens":["a","b"]}"#,
        )
        .unwrap();
        assert_eq!(parsed.public_key, "pk");
        assert_eq!(parsed.signed_tokens.len(), 2);

        let parsed: RedeemPaymentTokensResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.next_redemption_at.is_none());
    }
}
