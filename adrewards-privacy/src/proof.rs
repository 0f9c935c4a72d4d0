//! Batch discrete-log-equivalence proofs.
//!
//! The issuer proves that every signed token in a batch was produced with the
//! secret behind its published key, without revealing the key. Individual
//! pairs are folded into one composite pair using weights derived from a hash
//! of the whole batch, and a single Chaum-Pedersen proof is given over the
//! composites.

use crate::encoding::{canonical_scalar, fixed_bytes, impl_encoded_traits, Base64Encoding};
use crate::error::{PrivacyError, Result};
use crate::keys::{PublicKey, SigningKey};
use crate::token::{BlindedToken, SignedToken, Token, UnblindedToken};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use std::fmt;
use subtle::ConstantTimeEq;

pub const BATCH_DLEQ_PROOF_LENGTH: usize = 64;

#[derive(Clone, Copy)]
struct DleqProof {
    c: Scalar,
    s: Scalar,
}

impl DleqProof {
    fn new<R: RngCore + CryptoRng>(
        rng: &mut R,
        m: &RistrettoPoint,
        z: &RistrettoPoint,
        k: &Scalar,
        y: &RistrettoPoint,
    ) -> Self {
        let r = Scalar::random(rng);
        let a = RISTRETTO_BASEPOINT_POINT * r;
        let b = m * r;
        let c = challenge(y, m, z, &a, &b);
        Self { c, s: r - c * k }
    }

    fn verify(&self, m: &RistrettoPoint, z: &RistrettoPoint, y: &RistrettoPoint) -> bool {
        let a = RISTRETTO_BASEPOINT_POINT * self.s + y * self.c;
        let b = m * self.s + z * self.c;
        let c = challenge(y, m, z, &a, &b);
        bool::from(c.ct_eq(&self.c))
    }
}

fn challenge(
    y: &RistrettoPoint,
    m: &RistrettoPoint,
    z: &RistrettoPoint,
    a: &RistrettoPoint,
    b: &RistrettoPoint,
) -> Scalar {
    let mut hasher = Sha512::new();
    for point in [&RISTRETTO_BASEPOINT_POINT, y, m, z, a, b] {
        hasher.update(point.compress().as_bytes());
    }
    Scalar::from_hash(hasher)
}

/// Fold `(P_i, Q_i)` into `(M, Z) = (sum c_i * P_i, sum c_i * Q_i)`.
fn composites(
    y: &RistrettoPoint,
    blinded: &[RistrettoPoint],
    signed: &[RistrettoPoint],
) -> (RistrettoPoint, RistrettoPoint) {
    let mut seed = Sha512::new();
    seed.update(RISTRETTO_BASEPOINT_POINT.compress().as_bytes());
    seed.update(y.compress().as_bytes());
    for (p, q) in blinded.iter().zip(signed) {
        seed.update(p.compress().as_bytes());
        seed.update(q.compress().as_bytes());
    }
    let seed = seed.finalize();

    let mut m = RistrettoPoint::identity();
    let mut z = RistrettoPoint::identity();
    for (index, (p, q)) in blinded.iter().zip(signed).enumerate() {
        let weight = Scalar::from_hash(
            Sha512::new()
                .chain_update(seed.as_slice())
                .chain_update((index as u64).to_le_bytes()),
        );
        m += weight * p;
        z += weight * q;
    }
    (m, z)
}

fn blinded_points(tokens: &[BlindedToken]) -> Option<Vec<RistrettoPoint>> {
    tokens.iter().map(|t| t.point).collect()
}

fn signed_points(tokens: &[SignedToken]) -> Option<Vec<RistrettoPoint>> {
    tokens.iter().map(|t| t.point).collect()
}

/// Proof that a batch of signed tokens shares one signing key.
#[derive(Clone, Default)]
pub struct BatchDleqProof {
    proof: Option<DleqProof>,
}

impl BatchDleqProof {
    /// Issuer side. Proves `signed[i] = k * blinded[i]` for every `i`.
    pub fn new(
        blinded: &[BlindedToken],
        signed: &[SignedToken],
        signing_key: &SigningKey,
    ) -> Result<Self> {
        Self::new_from_rng(&mut rand::rngs::OsRng, blinded, signed, signing_key)
    }

    pub fn new_from_rng<R: RngCore + CryptoRng>(
        rng: &mut R,
        blinded: &[BlindedToken],
        signed: &[SignedToken],
        signing_key: &SigningKey,
    ) -> Result<Self> {
        if blinded.len() != signed.len() {
            return Err(PrivacyError::BatchLengthMismatch {
                blinded: blinded.len(),
                signed: signed.len(),
            });
        }
        if blinded.is_empty() {
            return Err(PrivacyError::EmptyBatch);
        }
        let k = signing_key
            .scalar()
            .ok_or(PrivacyError::MissingValue(SigningKey::KIND))?;
        let y = RISTRETTO_BASEPOINT_POINT * k;
        let p = blinded_points(blinded).ok_or(PrivacyError::MissingValue(BlindedToken::KIND))?;
        let q = signed_points(signed).ok_or(PrivacyError::MissingValue(SignedToken::KIND))?;

        let (m, z) = composites(&y, &p, &q);
        Ok(Self {
            proof: Some(DleqProof::new(rng, &m, &z, &k, &y)),
        })
    }

    /// Check the proof against `public_key`.
    ///
    /// Returns `false` for empty batches, empty values or a failed proof.
    /// The two slices must have the same length.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(batch = blinded.len())))]
    pub fn verify(
        &self,
        blinded: &[BlindedToken],
        signed: &[SignedToken],
        public_key: &PublicKey,
    ) -> bool {
        debug_assert_eq!(
            blinded.len(),
            signed.len(),
            "blinded and signed token batches must have equal length"
        );
        if blinded.len() != signed.len() || blinded.is_empty() {
            return false;
        }
        let (Some(proof), Some(y)) = (self.proof, public_key.point) else {
            return false;
        };
        let (Some(p), Some(q)) = (blinded_points(blinded), signed_points(signed)) else {
            return false;
        };

        let (m, z) = composites(&y, &p, &q);
        let verified = proof.verify(&m, &z, &y);
        #[cfg(feature = "tracing")]
        {
            if !verified {
                tracing::warn!("Batch DLEQ proof verification failed");
            }
        }
        verified
    }

    /// Verify the batch and unblind every signed token.
    ///
    /// All or nothing: `None` unless the whole batch verifies and every token
    /// unblinds. The three slices must have the same length.
    pub fn verify_and_unblind(
        &self,
        tokens: &[Token],
        blinded: &[BlindedToken],
        signed: &[SignedToken],
        public_key: &PublicKey,
    ) -> Option<Vec<UnblindedToken>> {
        debug_assert_eq!(
            tokens.len(),
            blinded.len(),
            "tokens and blinded tokens must have equal length"
        );
        if tokens.len() != blinded.len() {
            return None;
        }
        if !self.verify(blinded, signed, public_key) {
            return None;
        }
        tokens
            .iter()
            .zip(signed)
            .map(|(token, signed)| token.unblind(signed))
            .collect::<Result<Vec<_>>>()
            .ok()
    }
}

impl Base64Encoding for BatchDleqProof {
    const KIND: &'static str = "batch dleq proof";

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; BATCH_DLEQ_PROOF_LENGTH] = fixed_bytes(Self::KIND, bytes)?;
        let c = canonical_scalar(fixed_bytes(Self::KIND, &bytes[..32])?)?;
        let s = canonical_scalar(fixed_bytes(Self::KIND, &bytes[32..])?)?;
        Ok(Self {
            proof: Some(DleqProof { c, s }),
        })
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        self.proof.map(|proof| {
            let mut bytes = Vec::with_capacity(BATCH_DLEQ_PROOF_LENGTH);
            bytes.extend_from_slice(proof.c.as_bytes());
            bytes.extend_from_slice(proof.s.as_bytes());
            bytes
        })
    }
}

impl fmt::Debug for BatchDleqProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BatchDleqProof")
            .field(&self.encode_base64())
            .finish()
    }
}

impl_encoded_traits!(BatchDleqProof);

#[cfg(test)]
mod tests {
    use super::*;

    struct Batch {
        key: SigningKey,
        tokens: Vec<Token>,
        blinded: Vec<BlindedToken>,
        signed: Vec<SignedToken>,
        proof: BatchDleqProof,
    }

    fn issue(count: usize) -> Batch {
        let key = SigningKey::random();
        let tokens: Vec<Token> = (0..count).map(|_| Token::random()).collect();
        let blinded: Vec<BlindedToken> = tokens.iter().map(Token::blind).collect();
        let signed: Vec<SignedToken> = blinded.iter().map(|b| key.sign(b).unwrap()).collect();
        let proof = BatchDleqProof::new(&blinded, &signed, &key).unwrap();
        Batch {
            key,
            tokens,
            blinded,
            signed,
            proof,
        }
    }

    #[test]
    fn test_valid_batch_verifies() {
        let batch = issue(10);
        assert!(batch
            .proof
            .verify(&batch.blinded, &batch.signed, &batch.key.public_key()));
    }

    #[test]
    fn test_unblinded_tokens_match_issuer_rederivation() {
        let batch = issue(5);
        let unblinded = batch
            .proof
            .verify_and_unblind(
                &batch.tokens,
                &batch.blinded,
                &batch.signed,
                &batch.key.public_key(),
            )
            .unwrap();

        assert_eq!(unblinded.len(), 5);
        for (token, unblinded) in batch.tokens.iter().zip(&unblinded) {
            let expected = batch.key.rederive_unblinded_token(&token.preimage()).unwrap();
            assert_eq!(unblinded, &expected);
        }
    }

    #[test]
    fn test_wrong_public_key_fails() {
        let batch = issue(3);
        let other = SigningKey::random().public_key();
        assert!(!batch.proof.verify(&batch.blinded, &batch.signed, &other));
        assert!(batch
            .proof
            .verify_and_unblind(&batch.tokens, &batch.blinded, &batch.signed, &other)
            .is_none());
    }

    #[test]
    fn test_one_forged_signature_rejects_whole_batch() {
        let mut batch = issue(4);
        batch.signed[2] = SigningKey::random().sign(&batch.blinded[2]).unwrap();
        assert!(batch
            .proof
            .verify_and_unblind(
                &batch.tokens,
                &batch.blinded,
                &batch.signed,
                &batch.key.public_key()
            )
            .is_none());
    }

    #[test]
    fn test_reordered_signatures_fail() {
        let mut batch = issue(3);
        batch.signed.swap(0, 1);
        assert!(!batch
            .proof
            .verify(&batch.blinded, &batch.signed, &batch.key.public_key()));
    }

    #[test]
    fn test_empty_inputs_fail() {
        let batch = issue(2);
        let public_key = batch.key.public_key();
        assert!(!batch.proof.verify(&[], &[], &public_key));
        assert!(!BatchDleqProof::default().verify(&batch.blinded, &batch.signed, &public_key));
        assert!(!batch
            .proof
            .verify(&batch.blinded, &batch.signed, &PublicKey::default()));

        let mut blinded = batch.blinded.clone();
        blinded[0] = BlindedToken::default();
        assert!(!batch.proof.verify(&blinded, &batch.signed, &public_key));
    }

    #[test]
    fn test_proof_round_trips_through_base64() {
        let batch = issue(2);
        let decoded = BatchDleqProof::decode_base64(&batch.proof.encode_base64().unwrap());
        assert_eq!(decoded, batch.proof);
        assert!(decoded.verify(&batch.blinded, &batch.signed, &batch.key.public_key()));
    }

    #[test]
    fn test_issuer_rejects_mismatched_batch() {
        let batch = issue(2);
        assert_eq!(
            BatchDleqProof::new(&batch.blinded, &batch.signed[..1], &batch.key).unwrap_err(),
            PrivacyError::BatchLengthMismatch {
                blinded: 2,
                signed: 1
            }
        );
        assert_eq!(
            BatchDleqProof::new(&[], &[], &batch.key).unwrap_err(),
            PrivacyError::EmptyBatch
        );
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "equal length")]
    fn test_mismatched_lengths_are_a_programming_error() {
        let batch = issue(3);
        batch.proof.verify_and_unblind(
            &batch.tokens[..2],
            &batch.blinded,
            &batch.signed,
            &batch.key.public_key(),
        );
    }
}
