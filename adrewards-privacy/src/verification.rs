//! Request binding with keys derived from unblinded tokens.

use crate::encoding::{fixed_bytes, impl_encoded_traits, Base64Encoding};
use crate::error::Result;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use std::fmt;
use zeroize::ZeroizeOnDrop;

type HmacSha512 = Hmac<Sha512>;

pub const VERIFICATION_KEY_LENGTH: usize = 64;
pub const VERIFICATION_SIGNATURE_LENGTH: usize = 64;

#[derive(Clone, ZeroizeOnDrop)]
struct KeyBytes([u8; VERIFICATION_KEY_LENGTH]);

/// Shared MAC key. Both the client and the issuer can derive it once the
/// token preimage is revealed.
#[derive(Clone, Default)]
pub struct VerificationKey {
    key: Option<KeyBytes>,
}

impl VerificationKey {
    pub(crate) fn from_digest(bytes: [u8; VERIFICATION_KEY_LENGTH]) -> Self {
        Self {
            key: Some(KeyBytes(bytes)),
        }
    }

    fn mac(&self) -> Option<HmacSha512> {
        let key = self.key.as_ref()?;
        <HmacSha512 as Mac>::new_from_slice(&key.0).ok()
    }

    /// HMAC-SHA512 over `message`. Empty if the key is empty.
    pub fn sign(&self, message: &[u8]) -> VerificationSignature {
        match self.mac() {
            Some(mut mac) => {
                mac.update(message);
                let mut bytes = [0u8; VERIFICATION_SIGNATURE_LENGTH];
                bytes.copy_from_slice(&mac.finalize().into_bytes());
                VerificationSignature { bytes: Some(bytes) }
            }
            None => VerificationSignature::default(),
        }
    }

    /// Constant time check of `signature` over `message`.
    pub fn verify(&self, signature: &VerificationSignature, message: &[u8]) -> bool {
        let (Some(mut mac), Some(expected)) = (self.mac(), signature.bytes.as_ref()) else {
            return false;
        };
        mac.update(message);
        mac.verify_slice(expected).is_ok()
    }
}

impl Base64Encoding for VerificationKey {
    const KIND: &'static str = "verification key";

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_digest(fixed_bytes(Self::KIND, bytes)?))
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        self.key.as_ref().map(|key| key.0.to_vec())
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("has_value", &self.key.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct VerificationSignature {
    bytes: Option<[u8; VERIFICATION_SIGNATURE_LENGTH]>,
}

impl Base64Encoding for VerificationSignature {
    const KIND: &'static str = "verification signature";

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            bytes: Some(fixed_bytes(Self::KIND, bytes)?),
        })
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        self.bytes.map(|bytes| bytes.to_vec())
    }
}

impl fmt::Debug for VerificationSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VerificationSignature")
            .field(&self.encode_base64())
            .finish()
    }
}

impl_encoded_traits!(VerificationKey, VerificationSignature);
