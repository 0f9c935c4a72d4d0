//! Spends one unblinded token on a confirmation and collects the payment token.
//!
//! The spent token is reserved before the confirmation is submitted. A
//! retryable submission failure releases it back to the pool, where it stays
//! held for the resend of the same confirmation. A rejection or a successful
//! submission consumes it, so it is never offered twice.

use crate::confirmation::{ConfirmationInfo, RewardConfirmation};
use crate::credential::create_confirmation_credential;
use crate::delegate::RedeemUnblindedTokenDelegate;
use crate::endpoint::{ConfirmationsEndpoint, EndpointError, PaymentTokenResponse};
use crate::issuers::CatalogIssuersStore;
use crate::store::{PaymentTokenStore, PendingConfirmationStore, UnblindedTokenStore};
use crate::tokens::{UnblindedPaymentToken, UnblindedTokenInfo};
use crate::wallet::WalletInfo;
use adrewards_privacy::{Base64Encoding, BatchDleqProof, PublicKey, SignedToken};
use std::sync::Arc;

/// Result of one redemption attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedeemOutcome {
    Redeemed(UnblindedPaymentToken),
    Failed {
        should_retry: bool,
        should_backoff: bool,
    },
}

impl RedeemOutcome {
    fn retry(should_backoff: bool) -> Self {
        Self::Failed {
            should_retry: true,
            should_backoff,
        }
    }

    fn no_retry() -> Self {
        Self::Failed {
            should_retry: false,
            should_backoff: false,
        }
    }
}

/// Confirmation redeemer.
///
/// Every confirmation is stored as pending, keyed by transaction id, before
/// it is first submitted. A retry resends the same confirmation id with the
/// same token, so a confirmation the server recorded before its answer was
/// lost is recognised instead of being rejected as a double spend. Once
/// created, a retry picks up at the payment token fetch.
pub struct RedeemUnblindedToken {
    token_store: Arc<dyn UnblindedTokenStore>,
    payment_token_store: Arc<dyn PaymentTokenStore>,
    pending: Arc<dyn PendingConfirmationStore>,
    endpoint: Arc<dyn ConfirmationsEndpoint>,
    issuers: Arc<CatalogIssuersStore>,
    delegate: Option<Arc<dyn RedeemUnblindedTokenDelegate>>,
}

impl RedeemUnblindedToken {
    pub fn new(
        token_store: Arc<dyn UnblindedTokenStore>,
        payment_token_store: Arc<dyn PaymentTokenStore>,
        pending: Arc<dyn PendingConfirmationStore>,
        endpoint: Arc<dyn ConfirmationsEndpoint>,
        issuers: Arc<CatalogIssuersStore>,
        delegate: Option<Arc<dyn RedeemUnblindedTokenDelegate>>,
    ) -> Self {
        Self {
            token_store,
            payment_token_store,
            pending,
            endpoint,
            issuers,
            delegate,
        }
    }

    /// Number of confirmations submitted, or about to be, and not resolved.
    pub async fn pending_confirmations(&self) -> crate::Result<usize> {
        self.pending.pending_count().await
    }

    /// Confirm `reward` and fetch its payment token.
    #[tracing::instrument(skip_all, fields(transaction_id = %reward.transaction_id))]
    pub async fn redeem(&self, wallet: &WalletInfo, reward: &RewardConfirmation) -> RedeemOutcome {
        let pending = match self.pending.get_pending(&reward.transaction_id).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load pending confirmation");
                let confirmation = ConfirmationInfo::new(uuid::Uuid::new_v4().to_string(), reward);
                return self.failed(&confirmation, RedeemOutcome::retry(true));
            }
        };

        let confirmation = match pending {
            Some(confirmation) if confirmation.was_created => {
                tracing::debug!(confirmation_id = %confirmation.id, "Resuming at payment token fetch");
                confirmation
            }
            Some(mut confirmation) => {
                tracing::debug!(confirmation_id = %confirmation.id, "Resending pending confirmation");
                if let Err(outcome) = self.resend(&mut confirmation).await {
                    return self.failed(&confirmation, outcome);
                }
                confirmation
            }
            None => {
                let mut confirmation =
                    ConfirmationInfo::new(uuid::Uuid::new_v4().to_string(), reward);
                if let Err(outcome) = self.create(wallet, &mut confirmation).await {
                    return self.failed(&confirmation, outcome);
                }
                confirmation
            }
        };

        match self.fetch(&confirmation).await {
            Ok(payment_token) => {
                self.forget(&confirmation).await;
                tracing::info!(
                    confirmation_id = %confirmation.id,
                    confirmation_type = %confirmation.confirmation_type,
                    "Successfully redeemed unblinded token"
                );
                if let Some(delegate) = &self.delegate {
                    delegate.on_did_redeem_unblinded_token(&confirmation, &payment_token);
                }
                RedeemOutcome::Redeemed(payment_token)
            }
            Err(outcome) => {
                if matches!(outcome, RedeemOutcome::Failed { should_retry: false, .. }) {
                    self.forget(&confirmation).await;
                }
                self.failed(&confirmation, outcome)
            }
        }
    }

    /// Reserve a token, build the credential, store the confirmation as
    /// pending and submit it.
    async fn create(
        &self,
        wallet: &WalletInfo,
        confirmation: &mut ConfirmationInfo,
    ) -> Result<(), RedeemOutcome> {
        if !wallet.is_valid() {
            tracing::warn!("Cannot redeem unblinded token without a valid wallet");
            return Err(RedeemOutcome::retry(false));
        }
        if !self.issuers.has_issuers() {
            tracing::warn!("Cannot redeem unblinded token without catalog issuers");
            return Err(RedeemOutcome::retry(true));
        }

        let token = match self.token_store.reserve().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                tracing::info!("No unblinded tokens to redeem");
                return Err(RedeemOutcome::retry(false));
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to reserve unblinded token");
                return Err(RedeemOutcome::retry(true));
            }
        };

        if !token.is_signed_by(wallet) {
            tracing::error!("Discarding unblinded token with an invalid wallet signature");
            self.consume(&token).await;
            return Err(RedeemOutcome::retry(false));
        }

        confirmation.unblinded_token = Some(token.clone());
        confirmation.credential = create_confirmation_credential(confirmation);
        if confirmation.credential.is_none() {
            tracing::error!("Failed to create confirmation credential");
            self.release(&token).await;
            return Err(RedeemOutcome::retry(true));
        }

        if let Err(e) = self.pending.put_pending(confirmation.clone()).await {
            tracing::error!(error = %e, "Failed to store pending confirmation");
            self.release(&token).await;
            return Err(RedeemOutcome::retry(true));
        }

        self.submit(confirmation, &token).await
    }

    /// Submit a pending confirmation again, unchanged.
    async fn resend(&self, confirmation: &mut ConfirmationInfo) -> Result<(), RedeemOutcome> {
        let Some(token) = confirmation.unblinded_token.clone() else {
            tracing::error!("Pending confirmation has no unblinded token");
            self.forget(confirmation).await;
            return Err(RedeemOutcome::no_retry());
        };

        match self.token_store.reclaim(&token).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Pending confirmation token is no longer in the pool"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to reclaim unblinded token");
                return Err(RedeemOutcome::retry(true));
            }
        }

        self.submit(confirmation, &token).await
    }

    async fn submit(
        &self,
        confirmation: &mut ConfirmationInfo,
        token: &UnblindedTokenInfo,
    ) -> Result<(), RedeemOutcome> {
        match self.endpoint.create_confirmation(confirmation).await {
            Ok(()) => {
                tracing::info!(confirmation_id = %confirmation.id, "Created confirmation");
                // Consume before recording creation, so the token is never
                // back in the pool while the record says it is spent.
                self.consume(token).await;
                confirmation.was_created = true;
                if let Err(e) = self.pending.put_pending(confirmation.clone()).await {
                    tracing::error!(error = %e, "Failed to record created confirmation");
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "Failed to create confirmation");
                self.release(token).await;
                Err(RedeemOutcome::retry(true))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Confirmation rejected, discarding unblinded token");
                self.consume(token).await;
                self.forget(confirmation).await;
                Err(RedeemOutcome::no_retry())
            }
        }
    }

    async fn forget(&self, confirmation: &ConfirmationInfo) {
        if let Err(e) = self.pending.remove_pending(&confirmation.transaction_id).await {
            tracing::error!(error = %e, "Failed to remove pending confirmation");
        }
    }

    /// Fetch, verify and store the payment token for a created confirmation.
    async fn fetch(
        &self,
        confirmation: &ConfirmationInfo,
    ) -> Result<UnblindedPaymentToken, RedeemOutcome> {
        let response = match self.endpoint.fetch_payment_token(&confirmation.id).await {
            Ok(response) => response,
            Err(e) => return Err(classify_fetch_error(&e)),
        };

        if response.id != confirmation.id {
            tracing::error!(
                confirmation_id = %confirmation.id,
                response_id = %response.id,
                "Payment token response is for another confirmation"
            );
            return Err(RedeemOutcome::no_retry());
        }

        let payment_token = self.unblind(confirmation, &response)?;
        if let Err(e) = self
            .payment_token_store
            .add(vec![payment_token.clone()])
            .await
        {
            tracing::error!(error = %e, "Failed to store payment token");
            return Err(RedeemOutcome::retry(true));
        }
        Ok(payment_token)
    }

    fn unblind(
        &self,
        confirmation: &ConfirmationInfo,
        response: &PaymentTokenResponse,
    ) -> Result<UnblindedPaymentToken, RedeemOutcome> {
        let invalid = |what: &str| {
            tracing::error!(confirmation_id = %confirmation.id, "Invalid payment token response: {}", what);
            RedeemOutcome::retry(true)
        };

        let public_key =
            PublicKey::try_decode_base64(&response.public_key).map_err(|_| invalid("public key"))?;
        if !self.issuers.is_known_public_key(&public_key) {
            tracing::warn!("Payment token public key is not a known catalog issuer");
            return Err(RedeemOutcome::retry(true));
        }
        let proof = BatchDleqProof::try_decode_base64(&response.batch_proof)
            .map_err(|_| invalid("batch proof"))?;
        let signed = match response.signed_tokens.as_slice() {
            [signed] => {
                SignedToken::try_decode_base64(signed).map_err(|_| invalid("signed token"))?
            }
            _ => return Err(invalid("expected exactly one signed token")),
        };

        let mut unblinded = proof
            .verify_and_unblind(
                std::slice::from_ref(&confirmation.payment_token),
                std::slice::from_ref(&confirmation.blinded_payment_token),
                &[signed],
                &public_key,
            )
            .ok_or_else(|| invalid("batch proof verification failed"))?;

        let value = unblinded.pop().ok_or_else(|| invalid("no unblinded token"))?;
        Ok(UnblindedPaymentToken {
            value,
            public_key,
            confirmation_type: confirmation.confirmation_type,
            ad_type: confirmation.ad_type,
        })
    }

    async fn release(&self, token: &UnblindedTokenInfo) {
        if let Err(e) = self.token_store.release(token).await {
            tracing::error!(error = %e, "Failed to release unblinded token");
        }
    }

    async fn consume(&self, token: &UnblindedTokenInfo) {
        if let Err(e) = self.token_store.consume(token).await {
            tracing::error!(error = %e, "Failed to consume unblinded token");
        }
    }

    fn failed(&self, confirmation: &ConfirmationInfo, outcome: RedeemOutcome) -> RedeemOutcome {
        if let RedeemOutcome::Failed {
            should_retry,
            should_backoff,
        } = outcome
        {
            tracing::info!(
                confirmation_id = %confirmation.id,
                should_retry,
                should_backoff,
                "Failed to redeem unblinded token"
            );
            if let Some(delegate) = &self.delegate {
                delegate.on_failed_to_redeem_unblinded_token(
                    confirmation,
                    should_retry,
                    should_backoff,
                );
            }
        }
        outcome
    }
}

/// 404 and 202 mean the payment token is not ready yet. Other 4xx answers
/// are final. Everything else is worth retrying with backoff.
fn classify_fetch_error(error: &EndpointError) -> RedeemOutcome {
    tracing::warn!(error = %error, "Failed to fetch payment token");
    match error.status() {
        Some(404) | Some(202) => RedeemOutcome::retry(false),
        _ if error.is_rejection() => RedeemOutcome::no_retry(),
        _ if matches!(error, EndpointError::CaptchaRequired { .. }) => RedeemOutcome::no_retry(),
        _ => RedeemOutcome::retry(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::{AdType, ConfirmationType};
    use crate::store::ConfirmationsStateStore;
    use crate::testing::{DelegateEvent, MockConfirmationsServer, Operation, RecordingDelegate};

    struct Fixture {
        server: Arc<MockConfirmationsServer>,
        store: Arc<ConfirmationsStateStore>,
        delegate: Arc<RecordingDelegate>,
        redeemer: RedeemUnblindedToken,
        wallet: WalletInfo,
    }

    async fn fixture(tokens: usize) -> Fixture {
        let server = Arc::new(MockConfirmationsServer::new());
        let store = Arc::new(ConfirmationsStateStore::in_memory());
        let issuers = Arc::new(CatalogIssuersStore::new());
        issuers.set(server.catalog_issuers()).unwrap();
        let wallet = WalletInfo::generate("payment");
        store
            .put(server.issue_unblinded_tokens(tokens, &wallet))
            .await
            .unwrap();
        let delegate = Arc::new(RecordingDelegate::new());
        let redeemer = RedeemUnblindedToken::new(
            store.clone(),
            store.clone(),
            store.clone(),
            server.clone(),
            issuers,
            Some(delegate.clone()),
        );
        Fixture {
            server,
            store,
            delegate,
            redeemer,
            wallet,
        }
    }

    fn reward() -> RewardConfirmation {
        RewardConfirmation::new(
            "creative",
            "placement",
            ConfirmationType::View,
            AdType::AdNotification,
        )
    }

    #[tokio::test]
    async fn test_redeems_token_for_payment_token() {
        let f = fixture(3).await;
        let outcome = f.redeemer.redeem(&f.wallet, &reward()).await;

        let RedeemOutcome::Redeemed(payment_token) = outcome else {
            panic!("expected redemption, got {:?}", outcome);
        };
        assert_eq!(payment_token.confirmation_type, ConfirmationType::View);
        assert_eq!(UnblindedTokenStore::count(&*f.store).await.unwrap(), 2);
        assert_eq!(f.store.in_flight_count().await.unwrap(), 0);
        assert_eq!(
            PaymentTokenStore::get_all(&*f.store).await.unwrap(),
            vec![payment_token]
        );
        assert!(matches!(
            f.delegate.events().last(),
            Some(DelegateEvent::DidRedeemUnblindedToken { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_confirmation_discards_token() {
        let f = fixture(2).await;
        let spent = f.store.get().await.unwrap().unwrap();
        f.server
            .fail_next(Operation::CreateConfirmation, EndpointError::Status { status: 400 });

        let outcome = f.redeemer.redeem(&f.wallet, &reward()).await;
        assert_eq!(outcome, RedeemOutcome::no_retry());
        assert!(!UnblindedTokenStore::get_all(&*f.store)
            .await
            .unwrap()
            .contains(&spent));
        assert_eq!(f.store.in_flight_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_not_ready_payment_token_resumes_without_spending_again() {
        let f = fixture(2).await;
        let reward = reward();
        f.server
            .fail_next(Operation::FetchPaymentToken, EndpointError::Status { status: 404 });

        let outcome = f.redeemer.redeem(&f.wallet, &reward).await;
        assert_eq!(outcome, RedeemOutcome::retry(false));
        assert_eq!(f.redeemer.pending_confirmations().await.unwrap(), 1);
        assert_eq!(UnblindedTokenStore::count(&*f.store).await.unwrap(), 1);

        let outcome = f.redeemer.redeem(&f.wallet, &reward).await;
        assert!(matches!(outcome, RedeemOutcome::Redeemed(_)));
        assert_eq!(f.server.calls(Operation::CreateConfirmation), 1);
        assert_eq!(UnblindedTokenStore::count(&*f.store).await.unwrap(), 1);
        assert_eq!(f.redeemer.pending_confirmations().await.unwrap(), 0);
    }

    #[test]
    fn test_fetch_classification() {
        let cases = [
            (EndpointError::Status { status: 202 }, RedeemOutcome::retry(false)),
            (EndpointError::Status { status: 400 }, RedeemOutcome::no_retry()),
            (EndpointError::Status { status: 500 }, RedeemOutcome::retry(true)),
            (
                EndpointError::InvalidResponse("not json".into()),
                RedeemOutcome::retry(true),
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(classify_fetch_error(&error), expected, "{:?}", error);
        }
    }

    #[tokio::test]
    async fn test_forged_payment_token_proof_is_retried_with_backoff() {
        let f = fixture(1).await;
        f.server.corrupt_next_proof();

        let outcome = f.redeemer.redeem(&f.wallet, &reward()).await;
        assert_eq!(outcome, RedeemOutcome::retry(true));
        assert_eq!(PaymentTokenStore::count(&*f.store).await.unwrap(), 0);
        assert!(f.delegate.events().contains(&DelegateEvent::FailedToRedeemUnblindedToken {
            should_retry: true,
            should_backoff: true,
        }));
    }

    #[tokio::test]
    async fn test_token_with_bad_wallet_signature_is_discarded() {
        let f = fixture(1).await;
        let other_wallet = WalletInfo::generate("payment");

        let outcome = f.redeemer.redeem(&other_wallet, &reward()).await;
        assert_eq!(outcome, RedeemOutcome::retry(false));
        assert_eq!(UnblindedTokenStore::count(&*f.store).await.unwrap(), 0);
        assert_eq!(f.store.in_flight_count().await.unwrap(), 0);
        assert_eq!(f.server.calls(Operation::CreateConfirmation), 0);
    }

    #[tokio::test]
    async fn test_empty_pool_retries_without_backoff() {
        let f = fixture(0).await;
        let outcome = f.redeemer.redeem(&f.wallet, &reward()).await;
        assert_eq!(outcome, RedeemOutcome::retry(false));
        assert_eq!(f.server.calls(Operation::CreateConfirmation), 0);
    }
}
