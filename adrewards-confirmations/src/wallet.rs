//! Anonymous wallet identity.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the anonymous rewards account.
///
/// `recovery_seed` is the base64 encoding of a 32 byte Ed25519 seed. It is
/// used to authenticate tokens held in local storage so that tampered entries
/// are never spent.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInfo {
    pub payment_id: String,
    pub recovery_seed: String,
}

impl WalletInfo {
    pub fn new(payment_id: impl Into<String>, recovery_seed: impl Into<String>) -> Self {
        Self {
            payment_id: payment_id.into(),
            recovery_seed: recovery_seed.into(),
        }
    }

    /// Create a wallet with a random seed.
    pub fn generate(payment_id: impl Into<String>) -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::new(payment_id, STANDARD.encode(seed))
    }

    pub fn is_valid(&self) -> bool {
        !self.payment_id.is_empty() && self.signing_key().is_some()
    }

    fn signing_key(&self) -> Option<SigningKey> {
        let bytes = STANDARD.decode(&self.recovery_seed).ok()?;
        let seed: [u8; 32] = bytes.as_slice().try_into().ok()?;
        Some(SigningKey::from_bytes(&seed))
    }

    /// Base64 Ed25519 signature over `message`, `None` for an invalid wallet.
    pub fn sign(&self, message: &[u8]) -> Option<String> {
        self.signing_key()
            .map(|key| STANDARD.encode(key.sign(message).to_bytes()))
    }

    pub fn verify(&self, message: &[u8], signature: &str) -> bool {
        let Some(key) = self.signing_key() else {
            return false;
        };
        let Ok(bytes) = STANDARD.decode(signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };
        key.verifying_key().verify(message, &signature).is_ok()
    }
}

impl fmt::Debug for WalletInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletInfo")
            .field("payment_id", &self.payment_id)
            .field("recovery_seed", &"********")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_wallet_is_valid() {
        let wallet = WalletInfo::generate("27a39b2f-9b2e-4eb0-bbb2-2f84447496e7");
        assert!(wallet.is_valid());
    }

    #[test]
    fn test_invalid_wallets() {
        assert!(!WalletInfo::default().is_valid());
        assert!(!WalletInfo::new("", STANDARD.encode([1u8; 32])).is_valid());
        assert!(!WalletInfo::new("payment", "not-base64").is_valid());
        assert!(!WalletInfo::new("payment", STANDARD.encode([1u8; 16])).is_valid());
    }

    #[test]
    fn test_sign_and_verify() {
        let wallet = WalletInfo::generate("payment");
        let signature = wallet.sign(b"token").unwrap();
        assert!(wallet.verify(b"token", &signature));
        assert!(!wallet.verify(b"other", &signature));
        assert!(!WalletInfo::generate("payment").verify(b"token", &signature));
        assert!(WalletInfo::default().sign(b"token").is_none());
    }

    #[test]
    fn test_debug_redacts_seed() {
        let wallet = WalletInfo::generate("payment");
        let debug = format!("{:?}", wallet);
        assert!(debug.contains("payment"));
        assert!(!debug.contains(&wallet.recovery_seed));
    }
}
