//! Property-based tests for token encoding and batch proofs

#[cfg(test)]
mod property_tests {
    use adrewards_privacy::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn issue(
        key: &SigningKey,
        tokens: &[Token],
    ) -> (Vec<BlindedToken>, Vec<SignedToken>, BatchDleqProof) {
        let blinded: Vec<_> = tokens.iter().map(Token::blind).collect();
        let signed: Vec<_> = blinded.iter().map(|b| key.sign(b).unwrap()).collect();
        let proof = BatchDleqProof::new(&blinded, &signed, key).unwrap();
        (blinded, signed, proof)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Unblind(Sign(Blind(t))) equals the issuer's direct derivation for t
        #[test]
        fn prop_unblinding_matches_rederivation(seed in any::<u64>(), count in 1usize..8) {
            let mut rng = StdRng::seed_from_u64(seed);
            let key = SigningKey::random_from_rng(&mut rng);
            let tokens: Vec<_> = (0..count).map(|_| Token::random_from_rng(&mut rng)).collect();
            let (blinded, signed, proof) = issue(&key, &tokens);

            let unblinded = proof
                .verify_and_unblind(&tokens, &blinded, &signed, &key.public_key())
                .expect("valid proof");

            prop_assert_eq!(unblinded.len(), count);
            for (token, unblinded) in tokens.iter().zip(&unblinded) {
                let expected = key.rederive_unblinded_token(&token.preimage()).unwrap();
                prop_assert_eq!(unblinded, &expected);
            }
        }

        /// A batch with any single substituted signature yields nothing
        #[test]
        fn prop_proof_rejection_is_all_or_nothing(
            seed in any::<u64>(),
            count in 1usize..8,
            victim in any::<prop::sample::Index>(),
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let key = SigningKey::random_from_rng(&mut rng);
            let tokens: Vec<_> = (0..count).map(|_| Token::random_from_rng(&mut rng)).collect();
            let (blinded, mut signed, proof) = issue(&key, &tokens);

            let i = victim.index(count);
            let forger = SigningKey::random_from_rng(&mut rng);
            signed[i] = forger.sign(&blinded[i]).unwrap();

            prop_assert!(proof
                .verify_and_unblind(&tokens, &blinded, &signed, &key.public_key())
                .is_none());
        }

        /// Decoding then encoding a valid value is the identity
        #[test]
        fn prop_encoding_is_idempotent(seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let token = Token::random_from_rng(&mut rng);

            let encoded = token.encode_base64().unwrap();
            prop_assert_eq!(Token::decode_base64(&encoded).encode_base64(), Some(encoded.clone()));

            let blinded = token.blind().encode_base64().unwrap();
            prop_assert_eq!(BlindedToken::decode_base64(&blinded).encode_base64(), Some(blinded));
        }

        /// Arbitrary strings never panic and never produce a partially valid value
        #[test]
        fn prop_lenient_decode_never_panics(input in ".{0,200}") {
            let signed = SignedToken::decode_base64(&input);
            if signed.has_value() {
                prop_assert_eq!(signed.encode_base64().map(|e| e.len()), Some(44));
            }
            let _ = BatchDleqProof::decode_base64(&input);
            let _ = UnblindedToken::decode_base64(&input);
        }
    }
}
