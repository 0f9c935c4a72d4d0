//! Client side token types.
//!
//! A [`Token`] is a random preimage together with a blinding scalar. Blinding
//! it yields a [`BlindedToken`] that is sent to the issuer, which answers with
//! a [`SignedToken`]. Unblinding the signed token recovers an
//! [`UnblindedToken`] that the issuer cannot link to the request.

use crate::encoding::{
    canonical_scalar, decompress_point, fixed_bytes, impl_encoded_traits, Base64Encoding,
};
use crate::error::{PrivacyError, Result};
use crate::verification::VerificationKey;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use std::fmt;
use zeroize::ZeroizeOnDrop;

pub const TOKEN_PREIMAGE_LENGTH: usize = 64;
pub const TOKEN_LENGTH: usize = TOKEN_PREIMAGE_LENGTH + 32;
pub const BLINDED_TOKEN_LENGTH: usize = 32;
pub const SIGNED_TOKEN_LENGTH: usize = 32;
pub const UNBLINDED_TOKEN_LENGTH: usize = TOKEN_PREIMAGE_LENGTH + 32;

/// Random 64 byte value whose hash to the group is the point being signed.
#[derive(Clone, Default)]
pub struct TokenPreimage {
    bytes: Option<[u8; TOKEN_PREIMAGE_LENGTH]>,
}

impl TokenPreimage {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; TOKEN_PREIMAGE_LENGTH];
        rng.fill_bytes(&mut bytes);
        Self { bytes: Some(bytes) }
    }

    pub(crate) fn from_array(bytes: [u8; TOKEN_PREIMAGE_LENGTH]) -> Self {
        Self { bytes: Some(bytes) }
    }

    pub(crate) fn as_array(&self) -> Option<&[u8; TOKEN_PREIMAGE_LENGTH]> {
        self.bytes.as_ref()
    }

    /// `T = H(t)` hashed to the Ristretto group.
    pub(crate) fn to_point(&self) -> Option<RistrettoPoint> {
        self.bytes
            .as_ref()
            .map(|bytes| RistrettoPoint::hash_from_bytes::<Sha512>(bytes))
    }
}

impl Base64Encoding for TokenPreimage {
    const KIND: &'static str = "token preimage";

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_array(fixed_bytes(Self::KIND, bytes)?))
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        self.bytes.map(|bytes| bytes.to_vec())
    }
}

impl fmt::Debug for TokenPreimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TokenPreimage")
            .field(&self.encode_base64())
            .finish()
    }
}

#[derive(Clone, ZeroizeOnDrop)]
struct TokenSecret {
    preimage: [u8; TOKEN_PREIMAGE_LENGTH],
    blind: Scalar,
}

/// Client generated token. Lives only for the duration of one request.
#[derive(Clone, Default)]
pub struct Token {
    secret: Option<TokenSecret>,
}

impl Token {
    /// Generate a token from the operating system RNG.
    pub fn random() -> Self {
        Self::random_from_rng(&mut rand::rngs::OsRng)
    }

    pub fn random_from_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut preimage = [0u8; TOKEN_PREIMAGE_LENGTH];
        rng.fill_bytes(&mut preimage);
        Self {
            secret: Some(TokenSecret {
                preimage,
                blind: Scalar::random(rng),
            }),
        }
    }

    pub fn preimage(&self) -> TokenPreimage {
        match &self.secret {
            Some(secret) => TokenPreimage::from_array(secret.preimage),
            None => TokenPreimage::default(),
        }
    }

    /// Blind the token. Returns an empty value if the token itself is empty.
    pub fn blind(&self) -> BlindedToken {
        match &self.secret {
            Some(secret) => {
                let t = RistrettoPoint::hash_from_bytes::<Sha512>(&secret.preimage);
                BlindedToken::from_point(secret.blind * t)
            }
            None => BlindedToken::default(),
        }
    }

    /// Remove the blinding factor from an issuer signature.
    ///
    /// This does not check the signature. Callers go through
    /// [`crate::BatchDleqProof::verify_and_unblind`] instead.
    pub(crate) fn unblind(&self, signed: &SignedToken) -> Result<UnblindedToken> {
        let secret = self
            .secret
            .as_ref()
            .ok_or(PrivacyError::MissingValue(Self::KIND))?;
        let q = signed
            .point
            .ok_or(PrivacyError::MissingValue(SignedToken::KIND))?;
        let w = secret.blind.invert() * q;
        Ok(UnblindedToken::from_parts(secret.preimage, w))
    }
}

impl Base64Encoding for Token {
    const KIND: &'static str = "token";

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; TOKEN_LENGTH] = fixed_bytes(Self::KIND, bytes)?;
        let mut preimage = [0u8; TOKEN_PREIMAGE_LENGTH];
        preimage.copy_from_slice(&bytes[..TOKEN_PREIMAGE_LENGTH]);
        let blind = canonical_scalar(fixed_bytes(Self::KIND, &bytes[TOKEN_PREIMAGE_LENGTH..])?)?;
        Ok(Self {
            secret: Some(TokenSecret { preimage, blind }),
        })
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        self.secret.as_ref().map(|secret| {
            let mut bytes = Vec::with_capacity(TOKEN_LENGTH);
            bytes.extend_from_slice(&secret.preimage);
            bytes.extend_from_slice(secret.blind.as_bytes());
            bytes
        })
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("has_value", &self.secret.is_some())
            .finish_non_exhaustive()
    }
}

/// `P = r * T`, the value sent to the issuer.
#[derive(Clone, Default)]
pub struct BlindedToken {
    pub(crate) point: Option<RistrettoPoint>,
}

impl BlindedToken {
    pub(crate) fn from_point(point: RistrettoPoint) -> Self {
        Self { point: Some(point) }
    }
}

impl Base64Encoding for BlindedToken {
    const KIND: &'static str = "blinded token";

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_point(decompress_point(fixed_bytes(Self::KIND, bytes)?)?))
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        self.point.map(|p| p.compress().to_bytes().to_vec())
    }
}

impl fmt::Debug for BlindedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlindedToken")
            .field(&self.encode_base64())
            .finish()
    }
}

/// `Q = k * P`, the issuer's blind signature.
#[derive(Clone, Default)]
pub struct SignedToken {
    pub(crate) point: Option<RistrettoPoint>,
}

impl SignedToken {
    pub(crate) fn from_point(point: RistrettoPoint) -> Self {
        Self { point: Some(point) }
    }
}

impl Base64Encoding for SignedToken {
    const KIND: &'static str = "signed token";

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_point(decompress_point(fixed_bytes(Self::KIND, bytes)?)?))
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        self.point.map(|p| p.compress().to_bytes().to_vec())
    }
}

impl fmt::Debug for SignedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SignedToken")
            .field(&self.encode_base64())
            .finish()
    }
}

#[derive(Clone, ZeroizeOnDrop)]
struct UnblindedSecret {
    preimage: [u8; TOKEN_PREIMAGE_LENGTH],
    point: RistrettoPoint,
}

/// Preimage plus `W = k * T`. Spendable exactly once.
#[derive(Clone, Default)]
pub struct UnblindedToken {
    secret: Option<UnblindedSecret>,
}

impl UnblindedToken {
    pub(crate) fn from_parts(preimage: [u8; TOKEN_PREIMAGE_LENGTH], point: RistrettoPoint) -> Self {
        Self {
            secret: Some(UnblindedSecret { preimage, point }),
        }
    }

    pub fn preimage(&self) -> TokenPreimage {
        match &self.secret {
            Some(secret) => TokenPreimage::from_array(secret.preimage),
            None => TokenPreimage::default(),
        }
    }

    /// Derive the shared MAC key used to bind a request to this token.
    pub fn derive_verification_key(&self) -> VerificationKey {
        match &self.secret {
            Some(secret) => {
                let digest = Sha512::new()
                    .chain_update(b"hash_derive_key")
                    .chain_update(secret.preimage)
                    .chain_update(secret.point.compress().as_bytes())
                    .finalize();
                let mut bytes = [0u8; 64];
                bytes.copy_from_slice(&digest);
                VerificationKey::from_digest(bytes)
            }
            None => VerificationKey::default(),
        }
    }
}

impl Base64Encoding for UnblindedToken {
    const KIND: &'static str = "unblinded token";

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; UNBLINDED_TOKEN_LENGTH] = fixed_bytes(Self::KIND, bytes)?;
        let mut preimage = [0u8; TOKEN_PREIMAGE_LENGTH];
        preimage.copy_from_slice(&bytes[..TOKEN_PREIMAGE_LENGTH]);
        let point = decompress_point(fixed_bytes(Self::KIND, &bytes[TOKEN_PREIMAGE_LENGTH..])?)?;
        Ok(Self::from_parts(preimage, point))
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        self.secret.as_ref().map(|secret| {
            let mut bytes = Vec::with_capacity(UNBLINDED_TOKEN_LENGTH);
            bytes.extend_from_slice(&secret.preimage);
            bytes.extend_from_slice(secret.point.compress().as_bytes());
            bytes
        })
    }
}

impl fmt::Debug for UnblindedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnblindedToken")
            .field("preimage", &self.preimage().encode_base64())
            .finish_non_exhaustive()
    }
}

impl_encoded_traits!(TokenPreimage, Token, BlindedToken, SignedToken, UnblindedToken);
