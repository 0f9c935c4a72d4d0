//! Verify-proof command - batch DLEQ proof round trip and rejection

use adrewards_privacy::{Base64Encoding, BatchDleqProof, SigningKey, Token};
use anyhow::{ensure, Context, Result};

use crate::ui;

/// Sign a batch, accept its proof, then reject a proof made with another key
pub fn run(batch: usize, verbose: bool) -> Result<()> {
    ensure!(batch > 0, "Batch size must be at least 1");
    ui::header("Batch DLEQ Proof");

    let issuer = SigningKey::random();
    let public_key = issuer.public_key();
    let tokens: Vec<Token> = (0..batch).map(|_| Token::random()).collect();
    let blinded: Vec<_> = tokens.iter().map(Token::blind).collect();
    let signed = blinded
        .iter()
        .map(|token| issuer.sign(token))
        .collect::<Result<Vec<_>, _>>()
        .context("Issuer failed to sign the batch")?;
    let proof = BatchDleqProof::new(&blinded, &signed, &issuer).context("Failed to build proof")?;

    if verbose {
        ui::key_value("Issuer key", &public_key.to_string());
        ui::key_value("Proof", &proof.encode_base64().unwrap_or_default());
    }

    let unblinded = proof
        .verify_and_unblind(&tokens, &blinded, &signed, &public_key)
        .context("Valid proof was rejected")?;
    ensure!(unblinded.len() == batch, "Unblinded batch has the wrong size");
    ui::success(&format!("Verified and unblinded {} token(s)", unblinded.len()));

    // The issuer must re-derive the same token from its preimage.
    for (token, unblinded) in tokens.iter().zip(&unblinded) {
        let rederived = issuer
            .rederive_unblinded_token(&token.preimage())
            .context("Issuer failed to re-derive token")?;
        ensure!(&rederived == unblinded, "Re-derived token does not match");
    }
    ui::success("Issuer re-derives every unblinded token from its preimage");

    let other = SigningKey::random();
    let forged = BatchDleqProof::new(&blinded, &signed, &other).context("Failed to build proof")?;
    ensure!(
        forged
            .verify_and_unblind(&tokens, &blinded, &signed, &public_key)
            .is_none(),
        "Proof from another key was accepted"
    );
    ui::success("Rejected a proof made with another key");

    if batch > 1 {
        let mut swapped = signed.clone();
        swapped[0] = other.sign(&blinded[0]).context("Failed to sign token")?;
        ensure!(
            !proof.verify(&blinded, &swapped, &public_key),
            "Batch with a substituted token was accepted"
        );
        ui::success("Rejected a batch with one token signed by another key");
    }

    Ok(())
}
