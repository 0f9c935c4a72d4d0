//! Entry point owning the stores, issuers and engines.

use crate::config::ConfirmationsConfig;
use crate::confirmation::RewardConfirmation;
use crate::delegate::ConfirmationsDelegates;
use crate::endpoint::ConfirmationsEndpoint;
use crate::errors::{ConfirmationsError, Result};
use crate::issuers::{CatalogIssuers, CatalogIssuersStore};
use crate::redeem_payment_tokens::{RedeemPaymentsOutcome, RedeemUnblindedPaymentTokens};
use crate::redeem_reward_confirmation::{ProcessSummary, RedeemRewardConfirmation};
use crate::redeem_unblinded_token::RedeemUnblindedToken;
use crate::refill::{RefillOutcome, RefillUnblindedTokens};
use crate::store::{
    ConfirmationQueue, ConfirmationsStateStore, PaymentTokenStore, PendingConfirmationStore,
    RedemptionScheduleStore, UnblindedTokenStore,
};
use crate::wallet::WalletInfo;
use adrewards_privacy::{RandomTokenGenerator, TokenGenerator};
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};

/// Point-in-time view of the confirmations state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfirmationsStatus {
    pub unblinded_tokens: usize,
    pub in_flight_unblinded_tokens: usize,
    pub unblinded_payment_tokens: usize,
    pub queued_confirmations: usize,
    /// Confirmations submitted, or about to be, whose payment token is not stored yet.
    pub pending_confirmations: usize,
    pub next_token_redemption_at: Option<DateTime<Utc>>,
    /// Sum of issuer values for the payment tokens waiting to be redeemed.
    pub estimated_pending_rewards: f64,
}

/// The confirmations subsystem.
///
/// Create one per profile, call [`initialize`](Self::initialize) once, then
/// [`set_wallet`](Self::set_wallet) and
/// [`set_catalog_issuers`](Self::set_catalog_issuers) before
/// [`start`](Self::start). Dropping it cancels every scheduled retry.
pub struct Confirmations {
    config: ConfirmationsConfig,
    store: Arc<ConfirmationsStateStore>,
    issuers: Arc<CatalogIssuersStore>,
    wallet: RwLock<Option<WalletInfo>>,
    refill: RefillUnblindedTokens,
    queue: RedeemRewardConfirmation,
    payments: RedeemUnblindedPaymentTokens,
}

impl Confirmations {
    pub fn new(
        config: ConfirmationsConfig,
        store: Arc<ConfirmationsStateStore>,
        endpoint: Arc<dyn ConfirmationsEndpoint>,
        delegates: ConfirmationsDelegates,
    ) -> Result<Self> {
        Self::with_token_generator(
            config,
            store,
            endpoint,
            Arc::new(RandomTokenGenerator),
            delegates,
        )
    }

    pub fn with_token_generator(
        config: ConfirmationsConfig,
        store: Arc<ConfirmationsStateStore>,
        endpoint: Arc<dyn ConfirmationsEndpoint>,
        generator: Arc<dyn TokenGenerator>,
        delegates: ConfirmationsDelegates,
    ) -> Result<Self> {
        config.validate()?;
        let issuers = Arc::new(CatalogIssuersStore::new());

        let refill = RefillUnblindedTokens::new(
            config.clone(),
            store.clone(),
            endpoint.clone(),
            issuers.clone(),
            generator,
            delegates.refill.clone(),
        );
        let redeemer = RedeemUnblindedToken::new(
            store.clone(),
            store.clone(),
            store.clone(),
            endpoint.clone(),
            issuers.clone(),
            delegates.redeem_unblinded_token.clone(),
        );
        let queue = RedeemRewardConfirmation::new(
            config.clone(),
            store.clone(),
            redeemer,
            Some(refill.handle()),
        );
        let payments = RedeemUnblindedPaymentTokens::new(
            config.clone(),
            store.clone(),
            store.clone(),
            endpoint,
            delegates.redeem_payment_tokens.clone(),
        );

        Ok(Self {
            config,
            store,
            issuers,
            wallet: RwLock::new(None),
            refill,
            queue,
            payments,
        })
    }

    /// Return tokens left in flight by an interrupted run to the pool.
    ///
    /// A token that belongs to a pending confirmation stays held for it, so
    /// the confirmation is resent with the same id and token.
    pub async fn initialize(&self) -> Result<usize> {
        let recovered = self.store.recover_in_flight().await?;
        if recovered > 0 {
            tracing::warn!(count = recovered, "Recovered in-flight unblinded tokens");
        }
        Ok(recovered)
    }

    pub fn config(&self) -> &ConfirmationsConfig {
        &self.config
    }

    pub fn set_wallet(&self, wallet: WalletInfo) -> Result<()> {
        if !wallet.is_valid() {
            return Err(ConfirmationsError::InvalidWallet(
                "missing payment id or malformed recovery seed".into(),
            ));
        }
        self.queue.set_wallet(wallet.clone());
        *self
            .wallet
            .write()
            .map_err(|_| ConfirmationsError::lock_poisoned("wallet"))? = Some(wallet);
        Ok(())
    }

    pub fn set_catalog_issuers(&self, issuers: CatalogIssuers) -> Result<()> {
        tracing::debug!(count = issuers.issuers.len(), "Updated catalog issuers");
        self.issuers.set(issuers)
    }

    fn wallet(&self) -> Result<WalletInfo> {
        self.wallet
            .read()
            .map_err(|_| ConfirmationsError::lock_poisoned("wallet"))?
            .clone()
            .ok_or_else(|| ConfirmationsError::InvalidWallet("wallet has not been set".into()))
    }

    /// Top up tokens, drain queued confirmations and schedule payment redemption.
    pub async fn start(&self) -> Result<()> {
        let wallet = self.wallet()?;
        self.refill.maybe_refill(&wallet).await;
        self.queue.process().await;
        let redeem_at = self.payments.maybe_redeem_after_delay(&wallet).await?;
        tracing::info!(redeem_at = %redeem_at, "Confirmations started");
        Ok(())
    }

    /// Queue a reward confirmation and process the queue.
    pub async fn confirm(&self, reward: RewardConfirmation) -> Result<String> {
        self.wallet()?;
        let id = self.queue.add(reward).await?;
        self.queue.process().await;
        Ok(id)
    }

    pub async fn refill_unblinded_tokens(&self) -> Result<RefillOutcome> {
        let wallet = self.wallet()?;
        Ok(self.refill.maybe_refill(&wallet).await)
    }

    /// Run a queue pass now. `None` if one is already running.
    pub async fn process_confirmations(&self) -> Option<ProcessSummary> {
        self.queue.process().await
    }

    /// Redeem payment tokens now instead of waiting for the schedule.
    pub async fn redeem_payment_tokens(&self) -> Result<RedeemPaymentsOutcome> {
        let wallet = self.wallet()?;
        Ok(self.payments.redeem(&wallet).await)
    }

    pub fn refill(&self) -> &RefillUnblindedTokens {
        &self.refill
    }

    pub fn queue(&self) -> &RedeemRewardConfirmation {
        &self.queue
    }

    pub fn payments(&self) -> &RedeemUnblindedPaymentTokens {
        &self.payments
    }

    pub async fn unblinded_token_count(&self) -> Result<usize> {
        UnblindedTokenStore::count(&*self.store).await
    }

    pub async fn payment_token_count(&self) -> Result<usize> {
        PaymentTokenStore::count(&*self.store).await
    }

    /// Value of the payment tokens not yet redeemed, by issuer name.
    pub async fn estimated_pending_rewards(&self) -> Result<f64> {
        let tokens = PaymentTokenStore::get_all(&*self.store).await?;
        let Some(issuers) = self.issuers.get() else {
            return Ok(0.0);
        };
        Ok(tokens
            .iter()
            .filter_map(|token| issuers.redemption_value(&token.public_key))
            .sum())
    }

    pub async fn status(&self) -> Result<ConfirmationsStatus> {
        Ok(ConfirmationsStatus {
            unblinded_tokens: UnblindedTokenStore::count(&*self.store).await?,
            in_flight_unblinded_tokens: self.store.in_flight_count().await?,
            unblinded_payment_tokens: PaymentTokenStore::count(&*self.store).await?,
            queued_confirmations: ConfirmationQueue::len(&*self.store).await?,
            pending_confirmations: self.store.pending_count().await?,
            next_token_redemption_at: self.store.next_token_redemption_at().await?,
            estimated_pending_rewards: self.estimated_pending_rewards().await?,
        })
    }
}
