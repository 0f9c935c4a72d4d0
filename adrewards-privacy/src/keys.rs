//! Issuer key pair.

use crate::encoding::{
    canonical_scalar, decompress_point, fixed_bytes, impl_encoded_traits, Base64Encoding,
};
use crate::error::{PrivacyError, Result};
use crate::token::{BlindedToken, SignedToken, TokenPreimage, UnblindedToken};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use std::fmt;
use zeroize::ZeroizeOnDrop;

#[derive(Clone, ZeroizeOnDrop)]
struct SigningSecret {
    k: Scalar,
}

/// Issuer secret `k`.
///
/// Clients never hold one of these. It exists so that the protocol can be
/// exercised end to end by an in-process issuer.
#[derive(Clone, Default)]
pub struct SigningKey {
    secret: Option<SigningSecret>,
}

impl SigningKey {
    pub fn random() -> Self {
        Self::random_from_rng(&mut rand::rngs::OsRng)
    }

    pub fn random_from_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            secret: Some(SigningSecret {
                k: Scalar::random(rng),
            }),
        }
    }

    pub(crate) fn scalar(&self) -> Option<Scalar> {
        self.secret.as_ref().map(|secret| secret.k)
    }

    /// `Y = k * G`.
    pub fn public_key(&self) -> PublicKey {
        match self.scalar() {
            Some(k) => PublicKey::from_point(RISTRETTO_BASEPOINT_POINT * k),
            None => PublicKey::default(),
        }
    }

    /// Blind-sign a token: `Q = k * P`.
    pub fn sign(&self, blinded: &BlindedToken) -> Result<SignedToken> {
        let k = self.scalar().ok_or(PrivacyError::MissingValue(Self::KIND))?;
        let p = blinded
            .point
            .ok_or(PrivacyError::MissingValue(BlindedToken::KIND))?;
        Ok(SignedToken::from_point(k * p))
    }

    /// The unblinded token a client should end up with for `preimage`.
    pub fn rederive_unblinded_token(&self, preimage: &TokenPreimage) -> Result<UnblindedToken> {
        let k = self.scalar().ok_or(PrivacyError::MissingValue(Self::KIND))?;
        let t = preimage
            .to_point()
            .ok_or(PrivacyError::MissingValue(TokenPreimage::KIND))?;
        let bytes = preimage
            .as_array()
            .ok_or(PrivacyError::MissingValue(TokenPreimage::KIND))?;
        Ok(UnblindedToken::from_parts(*bytes, k * t))
    }
}

impl Base64Encoding for SigningKey {
    const KIND: &'static str = "signing key";

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let k = canonical_scalar(fixed_bytes(Self::KIND, bytes)?)?;
        Ok(Self {
            secret: Some(SigningSecret { k }),
        })
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        self.scalar().map(|k| k.to_bytes().to_vec())
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("public_key", &self.public_key().encode_base64())
            .finish_non_exhaustive()
    }
}

/// Issuer public key `Y`.
#[derive(Clone, Default)]
pub struct PublicKey {
    pub(crate) point: Option<RistrettoPoint>,
}

impl PublicKey {
    pub(crate) fn from_point(point: RistrettoPoint) -> Self {
        Self { point: Some(point) }
    }
}

impl Base64Encoding for PublicKey {
    const KIND: &'static str = "public key";

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_point(decompress_point(fixed_bytes(Self::KIND, bytes)?)?))
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        self.point.map(|p| p.compress().to_bytes().to_vec())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey")
            .field(&self.encode_base64())
            .finish()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode_base64() {
            Some(encoded) => f.write_str(&encoded),
            None => f.write_str("<empty>"),
        }
    }
}

impl_encoded_traits!(SigningKey, PublicKey);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Token;

    #[test]
    fn test_public_key_survives_encoding() {
        let key = SigningKey::random();
        let encoded = key.public_key().encode_base64().unwrap();
        assert_eq!(PublicKey::decode_base64(&encoded), key.public_key());
        assert_eq!(key.public_key().to_string(), encoded);
    }

    #[test]
    fn test_signing_key_survives_encoding() {
        let key = SigningKey::random();
        let restored = SigningKey::decode_base64(&key.encode_base64().unwrap());
        assert_eq!(restored.public_key(), key.public_key());
    }

    #[test]
    fn test_empty_key_cannot_sign() {
        let blinded = Token::random().blind();
        assert_eq!(
            SigningKey::default().sign(&blinded).unwrap_err(),
            PrivacyError::MissingValue("signing key")
        );
        assert!(!SigningKey::default().public_key().has_value());
    }

    #[test]
    fn test_sign_rejects_empty_blinded_token() {
        let key = SigningKey::random();
        assert!(key.sign(&BlindedToken::default()).is_err());
    }
}
