//! In-process confirmations issuer.

use crate::confirmation::{AdType, ConfirmationInfo, ConfirmationType};
use crate::credential::{ConfirmationCredential, PaymentRedemptionRequest};
use crate::endpoint::{
    ConfirmationsEndpoint, EndpointError, PaymentTokenResponse, RedeemPaymentTokensResponse,
    SignedTokensResponse,
};
use crate::issuers::{CatalogIssuers, IssuerInfo};
use crate::tokens::{UnblindedPaymentToken, UnblindedTokenInfo};
use crate::wallet::WalletInfo;
use adrewards_privacy::{Base64Encoding, BatchDleqProof, BlindedToken, PublicKey, SigningKey, Token};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Endpoint operations, for scripting failures and counting calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    RequestSignedTokens,
    GetSignedTokens,
    CreateConfirmation,
    FetchPaymentToken,
    RedeemPaymentTokens,
}

#[derive(Default)]
struct MockState {
    calls: HashMap<Operation, usize>,
    failures: HashMap<Operation, VecDeque<EndpointError>>,
    nonces: HashMap<String, Vec<BlindedToken>>,
    requested_blinded_tokens: HashSet<BlindedToken>,
    /// Confirmation id to the blinded payment token it asked for.
    confirmations: HashMap<String, BlindedToken>,
    /// Preimages of spent confirmation tokens.
    spent_tokens: HashSet<String>,
    redeemed_payment_tokens: HashSet<String>,
    double_spend_attempts: usize,
    corrupt_next_proof: bool,
    unknown_key_next: bool,
    lose_next_create_response: bool,
    next_redemption_at: Option<DateTime<Utc>>,
}

/// Issuer that signs with a real key and checks every credential it is sent.
pub struct MockConfirmationsServer {
    signing_key: SigningKey,
    state: Mutex<MockState>,
    redemption_gate: Mutex<Option<Arc<Notify>>>,
}

impl Default for MockConfirmationsServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConfirmationsServer {
    pub fn new() -> Self {
        Self::with_signing_key(SigningKey::random())
    }

    pub fn with_signing_key(signing_key: SigningKey) -> Self {
        Self {
            signing_key,
            state: Mutex::new(MockState::default()),
            redemption_gate: Mutex::new(None),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.signing_key.public_key()
    }

    /// Issuers listing this server's key at 0.05 per token.
    pub fn catalog_issuers(&self) -> CatalogIssuers {
        let public_key = self.public_key().to_string();
        CatalogIssuers {
            public_key: public_key.clone(),
            issuers: vec![IssuerInfo {
                name: "0.05BAT".to_string(),
                public_key,
            }],
        }
    }

    /// Fail the next call to `operation` with `error`. Failures queue up.
    pub fn fail_next(&self, operation: Operation, error: EndpointError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self, operation: Operation) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Sign the next batch with a proof from the wrong key.
    pub fn corrupt_next_proof(&self) {
        self.state.lock().unwrap().corrupt_next_proof = true;
    }

    /// Record the next confirmation, then answer with a transport error as
    /// if the response never arrived.
    pub fn lose_next_create_response(&self) {
        self.state.lock().unwrap().lose_next_create_response = true;
    }

    /// Sign the next batch with a key missing from the catalog issuers.
    pub fn sign_with_unknown_key_next(&self) {
        self.state.lock().unwrap().unknown_key_next = true;
    }

    pub fn set_next_redemption_at(&self, at: Option<DateTime<Utc>>) {
        self.state.lock().unwrap().next_redemption_at = at;
    }

    /// Make payment redemptions wait until [`release_redemptions`](Self::release_redemptions).
    pub fn hold_redemptions(&self) {
        *self.redemption_gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    pub fn release_redemptions(&self) {
        if let Some(gate) = self.redemption_gate.lock().unwrap().take() {
            gate.notify_one();
        }
    }

    /// Every blinded token seen across all signing requests.
    pub fn distinct_blinded_tokens_requested(&self) -> usize {
        self.state.lock().unwrap().requested_blinded_tokens.len()
    }

    /// Confirmations submitted with a token that was already spent.
    pub fn double_spend_attempts(&self) -> usize {
        self.state.lock().unwrap().double_spend_attempts
    }

    pub fn spent_token_count(&self) -> usize {
        self.state.lock().unwrap().spent_tokens.len()
    }

    pub fn redeemed_payment_token_count(&self) -> usize {
        self.state.lock().unwrap().redeemed_payment_tokens.len()
    }

    /// Unblinded tokens as a successful refill would store them.
    pub fn issue_unblinded_tokens(&self, count: usize, wallet: &WalletInfo) -> Vec<UnblindedTokenInfo> {
        (0..count)
            .map(|_| {
                let value = self
                    .signing_key
                    .rederive_unblinded_token(&Token::random().preimage())
                    .expect("issuer key signs fresh preimages");
                UnblindedTokenInfo::signed(value, self.public_key(), wallet)
                    .expect("wallet is valid")
            })
            .collect()
    }

    /// Payment tokens as successful confirmations would store them.
    pub fn issue_payment_tokens(&self, count: usize) -> Vec<UnblindedPaymentToken> {
        (0..count)
            .map(|_| UnblindedPaymentToken {
                value: self
                    .signing_key
                    .rederive_unblinded_token(&Token::random().preimage())
                    .expect("issuer key signs fresh preimages"),
                public_key: self.public_key(),
                confirmation_type: ConfirmationType::View,
                ad_type: AdType::AdNotification,
            })
            .collect()
    }

    /// Count the call and return any scripted failure.
    fn begin(&self, operation: Operation) -> Result<(), EndpointError> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(operation).or_default() += 1;
        match state
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Sign `blinded` and prove it, honouring the corruption switches.
    fn sign(&self, blinded: &[BlindedToken]) -> Result<(String, String, Vec<String>), EndpointError> {
        let (corrupt, unknown_key) = {
            let mut state = self.state.lock().unwrap();
            (
                std::mem::take(&mut state.corrupt_next_proof),
                std::mem::take(&mut state.unknown_key_next),
            )
        };
        let key = if unknown_key {
            SigningKey::random()
        } else {
            self.signing_key.clone()
        };
        let bad_request = |_| EndpointError::Status { status: 400 };

        let signed = blinded
            .iter()
            .map(|token| key.sign(token))
            .collect::<Result<Vec<_>, _>>()
            .map_err(bad_request)?;
        let proof = if corrupt {
            BatchDleqProof::new(blinded, &signed, &SigningKey::random())
        } else {
            BatchDleqProof::new(blinded, &signed, &key)
        }
        .map_err(bad_request)?;

        let encode = |value: Option<String>| value.ok_or(EndpointError::Status { status: 500 });
        Ok((
            encode(key.public_key().encode_base64())?,
            encode(proof.encode_base64())?,
            signed
                .iter()
                .map(|token| encode(token.encode_base64()))
                .collect::<Result<_, _>>()?,
        ))
    }
}

#[async_trait]
impl ConfirmationsEndpoint for MockConfirmationsServer {
    async fn request_signed_tokens(
        &self,
        _wallet: &WalletInfo,
        blinded: &[BlindedToken],
    ) -> Result<String, EndpointError> {
        self.state
            .lock()
            .unwrap()
            .requested_blinded_tokens
            .extend(blinded.iter().cloned());
        self.begin(Operation::RequestSignedTokens)?;
        if blinded.is_empty() {
            return Err(EndpointError::Status { status: 400 });
        }
        let nonce = uuid::Uuid::new_v4().to_string();
        self.state
            .lock()
            .unwrap()
            .nonces
            .insert(nonce.clone(), blinded.to_vec());
        Ok(nonce)
    }

    async fn get_signed_tokens(
        &self,
        _wallet: &WalletInfo,
        nonce: &str,
    ) -> Result<SignedTokensResponse, EndpointError> {
        self.begin(Operation::GetSignedTokens)?;
        let blinded = self
            .state
            .lock()
            .unwrap()
            .nonces
            .remove(nonce)
            .ok_or(EndpointError::Status { status: 404 })?;
        let (public_key, batch_proof, signed_tokens) = self.sign(&blinded)?;
        Ok(SignedTokensResponse {
            public_key,
            batch_proof,
            signed_tokens,
        })
    }

    async fn create_confirmation(
        &self,
        confirmation: &ConfirmationInfo,
    ) -> Result<(), EndpointError> {
        self.begin(Operation::CreateConfirmation)?;
        let bad_request = EndpointError::Status { status: 400 };

        let credential = confirmation
            .credential
            .as_deref()
            .and_then(ConfirmationCredential::decode)
            .ok_or_else(|| bad_request.clone())?;
        if !credential
            .token
            .verify(&self.signing_key, credential.payload.as_bytes())
        {
            return Err(bad_request);
        }
        let payload = credential.payload().ok_or_else(|| bad_request.clone())?;
        let blinded = BlindedToken::try_decode_base64(&payload.blinded_payment_token)
            .map_err(|_| bad_request.clone())?;

        let mut state = self.state.lock().unwrap();
        if state.confirmations.contains_key(&confirmation.id) {
            return Ok(());
        }
        if !state.spent_tokens.insert(credential.token.t.clone()) {
            state.double_spend_attempts += 1;
            return Err(bad_request);
        }
        state.confirmations.insert(confirmation.id.clone(), blinded);
        if std::mem::take(&mut state.lose_next_create_response) {
            return Err(EndpointError::Transport("response lost".into()));
        }
        Ok(())
    }

    async fn fetch_payment_token(
        &self,
        confirmation_id: &str,
    ) -> Result<PaymentTokenResponse, EndpointError> {
        self.begin(Operation::FetchPaymentToken)?;
        let blinded = self
            .state
            .lock()
            .unwrap()
            .confirmations
            .get(confirmation_id)
            .cloned()
            .ok_or(EndpointError::Status { status: 404 })?;
        let (public_key, batch_proof, signed_tokens) = self.sign(&[blinded])?;
        Ok(PaymentTokenResponse {
            id: confirmation_id.to_string(),
            public_key,
            batch_proof,
            signed_tokens,
        })
    }

    async fn redeem_payment_tokens(
        &self,
        wallet: &WalletInfo,
        tokens: &[UnblindedPaymentToken],
    ) -> Result<RedeemPaymentTokensResponse, EndpointError> {
        self.begin(Operation::RedeemPaymentTokens)?;
        let gate = self.redemption_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let bad_request = EndpointError::Status { status: 400 };
        let request =
            PaymentRedemptionRequest::new(wallet, tokens).ok_or_else(|| bad_request.clone())?;
        if request.payment_id().as_deref() != Some(wallet.payment_id.as_str()) {
            return Err(bad_request);
        }
        for credential in &request.payment_credentials {
            if !credential
                .credential
                .verify(&self.signing_key, request.payload.as_bytes())
            {
                return Err(bad_request);
            }
        }

        let mut state = self.state.lock().unwrap();
        if request
            .payment_credentials
            .iter()
            .any(|credential| state.redeemed_payment_tokens.contains(&credential.credential.t))
        {
            return Err(EndpointError::Status { status: 409 });
        }
        state.redeemed_payment_tokens.extend(
            request
                .payment_credentials
                .into_iter()
                .map(|credential| credential.credential.t),
        );
        Ok(RedeemPaymentTokensResponse {
            next_redemption_at: state.next_redemption_at,
        })
    }
}
