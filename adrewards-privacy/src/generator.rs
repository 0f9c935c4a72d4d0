//! Token generation seam.

use crate::token::Token;

/// Produces fresh tokens for a signing request.
pub trait TokenGenerator: Send + Sync {
    fn generate(&self, count: usize) -> Vec<Token>;
}

/// Generates tokens from the operating system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomTokenGenerator;

impl TokenGenerator for RandomTokenGenerator {
    fn generate(&self, count: usize) -> Vec<Token> {
        (0..count).map(|_| Token::random()).collect()
    }
}
