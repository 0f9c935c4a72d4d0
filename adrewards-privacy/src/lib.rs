//! Privacy pass style tokens over Ristretto255.
//!
//! This crate holds the value types used by the confirmations subsystem to
//! obtain issuer signatures on tokens without the issuer learning which token
//! it signed:
//!
//! - [`Token`] and [`TokenPreimage`]: client secrets, discarded after use
//! - [`BlindedToken`] / [`SignedToken`]: what travels to and from the issuer
//! - [`UnblindedToken`]: the spendable result
//! - [`BatchDleqProof`]: one proof covering a whole signed batch
//! - [`VerificationKey`] / [`VerificationSignature`]: bind a request to a token
//!
//! Every type implements [`Base64Encoding`]. Equality is equality of the
//! encoded bytes.
//!
//! # Example
//!
//! ```
//! use adrewards_privacy::{Base64Encoding, BatchDleqProof, SigningKey, Token};
//!
//! let issuer = SigningKey::random();
//! let tokens = vec![Token::random(), Token::random()];
//! let blinded: Vec<_> = tokens.iter().map(Token::blind).collect();
//!
//! // Issuer side
//! let signed: Vec<_> = blinded.iter().map(|b| issuer.sign(b)).collect::<Result<_, _>>()?;
//! let proof = BatchDleqProof::new(&blinded, &signed, &issuer)?;
//!
//! // Client side
//! let unblinded = proof
//!     .verify_and_unblind(&tokens, &blinded, &signed, &issuer.public_key())
//!     .expect("valid batch");
//! assert_eq!(unblinded.len(), 2);
//! assert!(unblinded[0].encode_base64().is_some());
//! # Ok::<(), adrewards_privacy::PrivacyError>(())
//! ```

mod encoding;
pub mod error;
mod generator;
mod keys;
mod proof;
mod token;
mod verification;

pub use encoding::Base64Encoding;
pub use error::{PrivacyError, Result};
pub use generator::{RandomTokenGenerator, TokenGenerator};
pub use keys::{PublicKey, SigningKey};
pub use proof::{BatchDleqProof, BATCH_DLEQ_PROOF_LENGTH};
pub use token::{
    BlindedToken, SignedToken, Token, TokenPreimage, UnblindedToken, BLINDED_TOKEN_LENGTH,
    SIGNED_TOKEN_LENGTH, TOKEN_LENGTH, TOKEN_PREIMAGE_LENGTH, UNBLINDED_TOKEN_LENGTH,
};
pub use verification::{
    VerificationKey, VerificationSignature, VERIFICATION_KEY_LENGTH,
    VERIFICATION_SIGNATURE_LENGTH,
};
