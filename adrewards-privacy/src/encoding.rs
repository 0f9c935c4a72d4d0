//! Base64 codec shared by every wrapper type.
//!
//! Decoding comes in two flavours. [`Base64Encoding::try_decode_base64`]
//! reports why a value was rejected, while [`Base64Encoding::decode_base64`]
//! never fails and yields an empty value instead. Empty values encode to
//! `None` and are rejected by every cryptographic operation.

use crate::error::{PrivacyError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;

/// Fixed-length binary value with a canonical base64 form.
pub trait Base64Encoding: Sized + Default {
    /// Human readable type name used in errors.
    const KIND: &'static str;

    /// Parse the raw bytes, validating length and group membership.
    fn from_bytes(bytes: &[u8]) -> Result<Self>;

    /// Raw bytes, or `None` when the value is empty.
    fn to_bytes(&self) -> Option<Vec<u8>>;

    /// Strict decode.
    fn try_decode_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| PrivacyError::InvalidBase64(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Lenient decode. Malformed input produces an empty value.
    fn decode_base64(encoded: &str) -> Self {
        match Self::try_decode_base64(encoded) {
            Ok(value) => value,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(kind = Self::KIND, error = %_e, "Failed to decode base64");
                Self::default()
            }
        }
    }

    fn encode_base64(&self) -> Option<String> {
        self.to_bytes().map(|bytes| STANDARD.encode(bytes))
    }

    fn has_value(&self) -> bool {
        self.to_bytes().is_some()
    }
}

pub(crate) fn fixed_bytes<const N: usize>(kind: &'static str, bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| PrivacyError::InvalidLength {
        kind,
        expected: N,
        actual: bytes.len(),
    })
}

pub(crate) fn decompress_point(bytes: [u8; 32]) -> Result<RistrettoPoint> {
    CompressedRistretto(bytes)
        .decompress()
        .ok_or(PrivacyError::InvalidPoint)
}

pub(crate) fn canonical_scalar(bytes: [u8; 32]) -> Result<Scalar> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(bytes)).ok_or(PrivacyError::InvalidScalar)
}

/// Equality, hashing and serde for wrapper types, all defined over the encoding.
macro_rules! impl_encoded_traits {
    ($($ty:ty),+ $(,)?) => {$(
        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                use subtle::ConstantTimeEq;
                match (self.to_bytes(), other.to_bytes()) {
                    (Some(a), Some(b)) => bool::from(a.as_slice().ct_eq(b.as_slice())),
                    (None, None) => true,
                    _ => false,
                }
            }
        }

        impl Eq for $ty {}

        impl std::hash::Hash for $ty {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                self.to_bytes().hash(state);
            }
        }

        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                match self.encode_base64() {
                    Some(encoded) => serializer.serialize_str(&encoded),
                    None => Err(serde::ser::Error::custom(concat!(
                        stringify!($ty),
                        " has no value"
                    ))),
                }
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let encoded = String::deserialize(deserializer)?;
                Self::try_decode_base64(&encoded).map_err(serde::de::Error::custom)
            }
        }
    )+};
}

pub(crate) use impl_encoded_traits;
