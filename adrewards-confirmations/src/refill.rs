//! Keeps the unblinded token pool above its low-water mark.
//!
//! A refill generates fresh tokens, blinds them, asks the backend to sign
//! them, and only stores the result if the batch proof verifies against a
//! known issuer key. Failed attempts never reuse their tokens.

use crate::config::ConfirmationsConfig;
use crate::delegate::RefillUnblindedTokensDelegate;
use crate::endpoint::{ConfirmationsEndpoint, EndpointError, SignedTokensResponse};
use crate::issuers::CatalogIssuersStore;
use crate::store::UnblindedTokenStore;
use crate::timer::{BackoffTimer, Timer};
use crate::tokens::UnblindedTokenInfo;
use crate::wallet::WalletInfo;
use adrewards_privacy::{
    Base64Encoding, BatchDleqProof, BlindedToken, PublicKey, SignedToken, Token, TokenGenerator,
};
use std::sync::{Arc, Mutex, Weak};

/// Where the refill state machine is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefillState {
    Idle,
    Refilling,
    /// Waiting for the backoff timer to retry.
    Backoff,
}

/// Result of one [`RefillUnblindedTokens::maybe_refill`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefillOutcome {
    /// Already refilling, waiting to retry, or the pool is full enough.
    Skipped,
    Refilled { count: usize },
    Failed { should_retry: bool },
}

/// Why an attempt failed, before it is collapsed into `should_retry`.
enum RefillFailure {
    Retry(String),
    NoRetry(String),
    Captcha(String),
}

impl From<EndpointError> for RefillFailure {
    fn from(e: EndpointError) -> Self {
        match e {
            EndpointError::CaptchaRequired { captcha_id } => Self::Captcha(captcha_id),
            other => Self::Retry(other.to_string()),
        }
    }
}

struct RefillInner {
    config: ConfirmationsConfig,
    token_store: Arc<dyn UnblindedTokenStore>,
    endpoint: Arc<dyn ConfirmationsEndpoint>,
    issuers: Arc<CatalogIssuersStore>,
    generator: Arc<dyn TokenGenerator>,
    delegate: Option<Arc<dyn RefillUnblindedTokensDelegate>>,
    state: Mutex<RefillState>,
    wallet: Mutex<Option<WalletInfo>>,
    retry_timer: BackoffTimer,
    check_timer: Timer,
}

/// Refill engine. Dropping it cancels pending retries and checks.
pub struct RefillUnblindedTokens {
    inner: Arc<RefillInner>,
}

/// Weak handle for other engines to trigger a refill. Does nothing once the
/// engine has been dropped.
#[derive(Clone)]
pub struct RefillHandle {
    inner: Weak<RefillInner>,
}

impl RefillHandle {
    pub async fn maybe_refill(&self) -> RefillOutcome {
        match self.inner.upgrade() {
            Some(inner) => inner.maybe_refill().await,
            None => RefillOutcome::Skipped,
        }
    }
}

impl RefillUnblindedTokens {
    pub fn new(
        config: ConfirmationsConfig,
        token_store: Arc<dyn UnblindedTokenStore>,
        endpoint: Arc<dyn ConfirmationsEndpoint>,
        issuers: Arc<CatalogIssuersStore>,
        generator: Arc<dyn TokenGenerator>,
        delegate: Option<Arc<dyn RefillUnblindedTokensDelegate>>,
    ) -> Self {
        let retry_timer = BackoffTimer::new(config.max_backoff_delay());
        Self {
            inner: Arc::new(RefillInner {
                config,
                token_store,
                endpoint,
                issuers,
                generator,
                delegate,
                state: Mutex::new(RefillState::Idle),
                wallet: Mutex::new(None),
                retry_timer,
                check_timer: Timer::new(),
            }),
        }
    }

    /// Refill if the pool is below the minimum and no refill is underway.
    pub async fn maybe_refill(&self, wallet: &WalletInfo) -> RefillOutcome {
        self.inner.set_wallet(wallet.clone());
        self.inner.maybe_refill().await
    }

    pub fn handle(&self) -> RefillHandle {
        RefillHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> RefillState {
        self.inner.state()
    }

    pub fn is_retrying(&self) -> bool {
        self.inner.retry_timer.is_running()
    }

    /// When the pending retry fires, if one is scheduled.
    pub fn retry_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.inner.retry_timer.fires_at()
    }
}

impl RefillInner {
    fn state(&self) -> RefillState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: RefillState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Move from `Idle` to `Refilling`. False if another refill owns the state.
    fn try_begin(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != RefillState::Idle {
            return false;
        }
        *state = RefillState::Refilling;
        true
    }

    fn set_wallet(&self, wallet: WalletInfo) {
        *self.wallet.lock().unwrap_or_else(|e| e.into_inner()) = Some(wallet);
    }

    fn wallet(&self) -> Option<WalletInfo> {
        self.wallet.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn maybe_refill(self: &Arc<Self>) -> RefillOutcome {
        if !self.try_begin() {
            tracing::debug!(state = ?self.state(), "Refill already in progress");
            return RefillOutcome::Skipped;
        }

        let count = match self.token_store.count().await {
            Ok(count) => count,
            Err(e) => {
                return self.failed(RefillFailure::Retry(format!(
                    "failed to count unblinded tokens: {}",
                    e
                )))
            }
        };
        if count >= self.config.minimum_unblinded_tokens {
            tracing::debug!(
                count,
                minimum = self.config.minimum_unblinded_tokens,
                "No need to refill unblinded tokens"
            );
            self.set_state(RefillState::Idle);
            self.schedule_next_check();
            return RefillOutcome::Skipped;
        }

        let needed = self.config.maximum_unblinded_tokens.saturating_sub(count);
        tracing::info!(count, needed, "Refilling unblinded tokens");

        match self.refill(needed).await {
            Ok(added) => self.succeeded(added),
            Err(failure) => self.failed(failure),
        }
    }

    async fn refill(&self, needed: usize) -> Result<usize, RefillFailure> {
        let wallet = match self.wallet() {
            Some(wallet) if wallet.is_valid() => wallet,
            _ => return Err(RefillFailure::NoRetry("invalid wallet".into())),
        };
        if !self.issuers.has_issuers() {
            return Err(RefillFailure::NoRetry("missing catalog issuers".into()));
        }

        let tokens = self.generator.generate(needed);
        let blinded: Vec<BlindedToken> = tokens.iter().map(Token::blind).collect();

        let nonce = self.endpoint.request_signed_tokens(&wallet, &blinded).await?;
        tracing::debug!(count = blinded.len(), "Requested signed tokens");

        let response = self.endpoint.get_signed_tokens(&wallet, &nonce).await?;
        let (public_key, unblinded) = self.unblind(&tokens, &blinded, &response)?;

        let records = unblinded
            .into_iter()
            .map(|value| UnblindedTokenInfo::signed(value, public_key.clone(), &wallet))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| RefillFailure::NoRetry("failed to sign unblinded tokens".into()))?;

        self.token_store
            .put(records)
            .await
            .map_err(|e| RefillFailure::Retry(format!("failed to store unblinded tokens: {}", e)))
    }

    /// Check the signed batch and unblind it. Nothing is kept unless every
    /// token in the batch verifies.
    fn unblind(
        &self,
        tokens: &[Token],
        blinded: &[BlindedToken],
        response: &SignedTokensResponse,
    ) -> Result<(PublicKey, Vec<adrewards_privacy::UnblindedToken>), RefillFailure> {
        let public_key = PublicKey::try_decode_base64(&response.public_key)
            .map_err(|e| RefillFailure::Retry(format!("invalid public key: {}", e)))?;
        if !self.issuers.is_known_public_key(&public_key) {
            return Err(RefillFailure::NoRetry(
                "public key is not a known catalog issuer".into(),
            ));
        }

        let proof = BatchDleqProof::try_decode_base64(&response.batch_proof)
            .map_err(|e| RefillFailure::Retry(format!("invalid batch proof: {}", e)))?;
        let signed = response
            .signed_tokens
            .iter()
            .map(|token| SignedToken::try_decode_base64(token))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RefillFailure::Retry(format!("invalid signed token: {}", e)))?;
        if signed.len() != blinded.len() {
            return Err(RefillFailure::Retry(format!(
                "expected {} signed tokens, got {}",
                blinded.len(),
                signed.len()
            )));
        }

        let unblinded = proof
            .verify_and_unblind(tokens, blinded, &signed, &public_key)
            .ok_or_else(|| RefillFailure::Retry("batch proof verification failed".into()))?;
        Ok((public_key, unblinded))
    }

    fn succeeded(self: &Arc<Self>, added: usize) -> RefillOutcome {
        tracing::info!(count = added, "Successfully refilled unblinded tokens");
        self.set_state(RefillState::Idle);
        self.retry_timer.stop();
        self.retry_timer.reset();
        if let Some(delegate) = &self.delegate {
            delegate.on_did_refill_unblinded_tokens();
        }
        self.schedule_next_check();
        RefillOutcome::Refilled { count: added }
    }

    fn failed(self: &Arc<Self>, failure: RefillFailure) -> RefillOutcome {
        let should_retry = match failure {
            RefillFailure::Retry(reason) => {
                tracing::warn!(reason = %reason, "Failed to refill unblinded tokens");
                true
            }
            RefillFailure::NoRetry(reason) => {
                tracing::error!(reason = %reason, "Failed to refill unblinded tokens");
                false
            }
            RefillFailure::Captcha(captcha_id) => {
                tracing::info!("Captcha required to refill unblinded tokens");
                if let Some(delegate) = &self.delegate {
                    delegate.on_captcha_required_to_refill_unblinded_tokens(&captcha_id);
                }
                false
            }
        };

        if let Some(delegate) = &self.delegate {
            delegate.on_failed_to_refill_unblinded_tokens(should_retry);
        }

        if should_retry {
            self.set_state(RefillState::Backoff);
            self.schedule_retry();
        } else {
            self.set_state(RefillState::Idle);
        }
        RefillOutcome::Failed { should_retry }
    }

    fn schedule_retry(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let retry_at = self.retry_timer.start(self.config.retry_delay(), move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.retry().await;
            }
        });
        tracing::info!(retry_at = %retry_at, "Retry refilling unblinded tokens");
        if let Some(delegate) = &self.delegate {
            delegate.on_will_retry_refilling_unblinded_tokens(retry_at);
        }
    }

    async fn retry(self: Arc<Self>) {
        if let Some(delegate) = &self.delegate {
            delegate.on_did_retry_refilling_unblinded_tokens();
        }
        self.set_state(RefillState::Idle);
        self.maybe_refill().await;
    }

    fn schedule_next_check(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.check_timer
            .start(self.config.refill_check_interval(), move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.maybe_refill().await;
                }
            });
    }
}
