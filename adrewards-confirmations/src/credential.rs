//! Credentials binding a request to a spent token.
//!
//! The client proves it holds an unblinded token by revealing the token
//! preimage `t` and signing the request with the token's verification key.
//! The issuer rederives the same key from `t` and checks the signature.

use crate::confirmation::{ConfirmationInfo, ConfirmationType};
use crate::tokens::UnblindedPaymentToken;
use crate::wallet::WalletInfo;
use adrewards_privacy::{
    Base64Encoding, SigningKey, TokenPreimage, UnblindedToken, VerificationSignature,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Proof of possession of one unblinded token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCredential {
    pub signature: String,
    pub t: String,
}

impl TokenCredential {
    /// Sign `message` with the verification key derived from `token`.
    pub fn sign(token: &UnblindedToken, message: &[u8]) -> Option<Self> {
        let signature = token.derive_verification_key().sign(message);
        Some(Self {
            signature: signature.encode_base64()?,
            t: token.preimage().encode_base64()?,
        })
    }

    /// Issuer side check against the signing key that issued the token.
    pub fn verify(&self, signing_key: &SigningKey, message: &[u8]) -> bool {
        let Ok(preimage) = TokenPreimage::try_decode_base64(&self.t) else {
            return false;
        };
        let Ok(signature) = VerificationSignature::try_decode_base64(&self.signature) else {
            return false;
        };
        signing_key
            .rederive_unblinded_token(&preimage)
            .map(|token| token.derive_verification_key().verify(&signature, message))
            .unwrap_or(false)
    }
}

/// Signed body of a confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationPayload {
    pub blinded_payment_token: String,
    pub creative_instance_id: String,
    pub public_key: String,
    pub transaction_id: String,
    #[serde(rename = "type")]
    pub confirmation_type: ConfirmationType,
}

/// Decoded form of the credential sent with a confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationCredential {
    /// JSON encoded [`ConfirmationPayload`], signed verbatim.
    pub payload: String,
    #[serde(flatten)]
    pub token: TokenCredential,
}

impl ConfirmationCredential {
    pub fn decode(credential: &str) -> Option<Self> {
        let json = STANDARD.decode(credential.trim()).ok()?;
        serde_json::from_slice(&json).ok()
    }

    pub fn payload(&self) -> Option<ConfirmationPayload> {
        serde_json::from_str(&self.payload).ok()
    }
}

/// Build the confirmation credential. `None` if no token has been attached
/// or any value fails to encode.
pub fn create_confirmation_credential(confirmation: &ConfirmationInfo) -> Option<String> {
    let spent = confirmation.unblinded_token.as_ref()?;
    let payload = ConfirmationPayload {
        blinded_payment_token: confirmation.blinded_payment_token.encode_base64()?,
        creative_instance_id: confirmation.creative_instance_id.clone(),
        public_key: spent.public_key.encode_base64()?,
        transaction_id: confirmation.transaction_id.clone(),
        confirmation_type: confirmation.confirmation_type,
    };
    let payload = serde_json::to_string(&payload).ok()?;
    let token = TokenCredential::sign(&spent.value, payload.as_bytes())?;
    let json = serde_json::to_vec(&ConfirmationCredential { payload, token }).ok()?;
    Some(STANDARD.encode(json))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCredential {
    pub confirmation_type: ConfirmationType,
    pub public_key: String,
    pub credential: TokenCredential,
}

/// Body of a payment token redemption.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRedemptionRequest {
    /// JSON `{"paymentId": ...}`, signed by every credential.
    pub payload: String,
    pub payment_credentials: Vec<PaymentCredential>,
}

impl PaymentRedemptionRequest {
    pub fn new(wallet: &WalletInfo, tokens: &[UnblindedPaymentToken]) -> Option<Self> {
        let payload = serde_json::json!({ "paymentId": wallet.payment_id }).to_string();
        let payment_credentials = tokens
            .iter()
            .map(|token| {
                Some(PaymentCredential {
                    confirmation_type: token.confirmation_type,
                    public_key: token.public_key.encode_base64()?,
                    credential: TokenCredential::sign(&token.value, payload.as_bytes())?,
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            payload,
            payment_credentials,
        })
    }

    /// Payment id named in the signed payload.
    pub fn payment_id(&self) -> Option<String> {
        let payload: serde_json::Value = serde_json::from_str(&self.payload).ok()?;
        payload["paymentId"].as_str().map(str::to_owned)
    }
}
