//! Periodic batch redemption of earned payment tokens.

use crate::config::ConfirmationsConfig;
use crate::delegate::RedeemUnblindedPaymentTokensDelegate;
use crate::endpoint::ConfirmationsEndpoint;
use crate::errors::Result;
use crate::store::{PaymentTokenStore, RedemptionScheduleStore};
use crate::timer::{self, BackoffTimer, Timer};
use crate::wallet::WalletInfo;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Result of one [`RedeemUnblindedPaymentTokens::redeem`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedeemPaymentsOutcome {
    /// Another redemption was in flight; this call did nothing.
    AlreadyProcessing,
    /// No payment tokens were waiting. The next pass is scheduled.
    NothingToRedeem,
    Redeemed { count: usize },
    Failed { should_retry: bool },
}

struct PaymentsInner {
    config: ConfirmationsConfig,
    payment_token_store: Arc<dyn PaymentTokenStore>,
    schedule: Arc<dyn RedemptionScheduleStore>,
    endpoint: Arc<dyn ConfirmationsEndpoint>,
    delegate: Option<Arc<dyn RedeemUnblindedPaymentTokensDelegate>>,
    wallet: Mutex<Option<WalletInfo>>,
    is_processing: AtomicBool,
    timer: Timer,
    backoff_timer: BackoffTimer,
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Payment redeemer. Dropping it cancels the scheduled redemption.
pub struct RedeemUnblindedPaymentTokens {
    inner: Arc<PaymentsInner>,
}

impl RedeemUnblindedPaymentTokens {
    pub fn new(
        config: ConfirmationsConfig,
        payment_token_store: Arc<dyn PaymentTokenStore>,
        schedule: Arc<dyn RedemptionScheduleStore>,
        endpoint: Arc<dyn ConfirmationsEndpoint>,
        delegate: Option<Arc<dyn RedeemUnblindedPaymentTokensDelegate>>,
    ) -> Self {
        let backoff_timer = BackoffTimer::new(config.max_backoff_delay());
        Self {
            inner: Arc::new(PaymentsInner {
                config,
                payment_token_store,
                schedule,
                endpoint,
                delegate,
                wallet: Mutex::new(None),
                is_processing: AtomicBool::new(false),
                timer: Timer::new(),
                backoff_timer,
            }),
        }
    }

    /// Schedule the next redemption from the stored date, creating one if
    /// none exists. Returns when the redemption will run.
    pub async fn maybe_redeem_after_delay(&self, wallet: &WalletInfo) -> Result<DateTime<Utc>> {
        self.inner.set_wallet(wallet.clone());
        if self.inner.is_processing.load(Ordering::Acquire) || self.inner.timer.is_running() {
            if let Some(fires_at) = self.inner.timer.fires_at() {
                return Ok(fires_at);
            }
        }
        let next = match self.inner.schedule.next_token_redemption_at().await? {
            Some(next) => next,
            None => self.inner.store_next_redemption_at(None).await?,
        };
        Ok(self.inner.schedule_at(next))
    }

    /// Redeem every stored payment token now.
    pub async fn redeem(&self, wallet: &WalletInfo) -> RedeemPaymentsOutcome {
        self.inner.set_wallet(wallet.clone());
        self.inner.redeem().await
    }

    pub fn is_processing(&self) -> bool {
        self.inner.is_processing.load(Ordering::Acquire)
    }

    pub fn is_retrying(&self) -> bool {
        self.inner.backoff_timer.is_running()
    }

    /// When the next scheduled or retried redemption runs.
    pub fn next_redemption_at(&self) -> Option<DateTime<Utc>> {
        self.inner
            .backoff_timer
            .fires_at()
            .or_else(|| self.inner.timer.fires_at())
    }
}

impl PaymentsInner {
    fn set_wallet(&self, wallet: WalletInfo) {
        *self.wallet.lock().unwrap_or_else(|e| e.into_inner()) = Some(wallet);
    }

    fn wallet(&self) -> Option<WalletInfo> {
        self.wallet.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    #[tracing::instrument(skip_all)]
    async fn redeem(self: &Arc<Self>) -> RedeemPaymentsOutcome {
        if self.is_processing.swap(true, Ordering::AcqRel) {
            tracing::debug!("Already redeeming unblinded payment tokens");
            return RedeemPaymentsOutcome::AlreadyProcessing;
        }
        let _guard = ProcessingGuard(&self.is_processing);

        let wallet = match self.wallet() {
            Some(wallet) if wallet.is_valid() => wallet,
            _ => {
                tracing::error!("Cannot redeem payment tokens without a valid wallet");
                return self.failed(false);
            }
        };

        let tokens = match self.payment_token_store.get_all().await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load unblinded payment tokens");
                return self.failed(true);
            }
        };
        if tokens.is_empty() {
            tracing::info!("No unblinded payment tokens to redeem");
            self.schedule_next(None).await;
            return RedeemPaymentsOutcome::NothingToRedeem;
        }

        tracing::info!(count = tokens.len(), "Redeeming unblinded payment tokens");
        let response = match self.endpoint.redeem_payment_tokens(&wallet, &tokens).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to redeem unblinded payment tokens");
                let should_retry = e.is_transient();
                let outcome = self.failed(should_retry);
                if !should_retry {
                    self.schedule_next(None).await;
                }
                return outcome;
            }
        };

        // Tokens earned while the request was in flight stay for the next pass.
        let count = match self.payment_token_store.remove(&tokens).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, "Failed to remove redeemed payment tokens");
                return self.failed(true);
            }
        };

        tracing::info!(count, "Successfully redeemed unblinded payment tokens");
        self.backoff_timer.stop();
        self.backoff_timer.reset();
        if let Some(delegate) = &self.delegate {
            delegate.on_did_redeem_unblinded_payment_tokens(count);
        }
        self.schedule_next(response.next_redemption_at).await;
        RedeemPaymentsOutcome::Redeemed { count }
    }

    fn failed(self: &Arc<Self>, should_retry: bool) -> RedeemPaymentsOutcome {
        if let Some(delegate) = &self.delegate {
            delegate.on_failed_to_redeem_unblinded_payment_tokens(should_retry);
        }
        if should_retry {
            let weak = Arc::downgrade(self);
            let retry_at = self
                .backoff_timer
                .start(self.config.retry_delay(), move || async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.redeem().await;
                    }
                });
            tracing::info!(retry_at = %retry_at, "Retry redeeming unblinded payment tokens");
        }
        RedeemPaymentsOutcome::Failed { should_retry }
    }

    /// Persist the next redemption date, `now + interval` when the server gave none.
    async fn store_next_redemption_at(&self, at: Option<DateTime<Utc>>) -> Result<DateTime<Utc>> {
        let next = at.unwrap_or_else(|| timer::after(self.config.token_redemption_interval()));
        self.schedule.set_next_token_redemption_at(Some(next)).await?;
        Ok(next)
    }

    async fn schedule_next(self: &Arc<Self>, at: Option<DateTime<Utc>>) {
        match self.store_next_redemption_at(at).await {
            Ok(next) => {
                self.schedule_at(next);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to store next payment token redemption");
                self.schedule_after(self.config.token_redemption_interval());
            }
        }
    }

    /// Start the timer for a stored date. Dates in the past use the short
    /// expired delay.
    fn schedule_at(self: &Arc<Self>, at: DateTime<Utc>) -> DateTime<Utc> {
        let delay = (at - Utc::now())
            .to_std()
            .ok()
            .filter(|delay| !delay.is_zero())
            .unwrap_or_else(|| self.config.expired_token_redemption_delay());
        let redeem_at = self.schedule_after(delay);
        if let Some(delegate) = &self.delegate {
            delegate.on_did_schedule_next_unblinded_payment_tokens_redemption(redeem_at);
        }
        redeem_at
    }

    fn schedule_after(self: &Arc<Self>, delay: Duration) -> DateTime<Utc> {
        let weak = Arc::downgrade(self);
        let task = move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.redeem().await;
            }
        };
        let redeem_at = if self.config.use_privacy_jitter {
            self.timer.start_with_privacy(delay, task)
        } else {
            self.timer.start(delay, task)
        };
        tracing::info!(redeem_at = %redeem_at, "Scheduled next unblinded payment tokens redemption");
        redeem_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointError;
    use crate::store::ConfirmationsStateStore;
    use crate::testing::{DelegateEvent, MockConfirmationsServer, Operation, RecordingDelegate};

    struct Fixture {
        server: Arc<MockConfirmationsServer>,
        store: Arc<ConfirmationsStateStore>,
        delegate: Arc<RecordingDelegate>,
        payments: RedeemUnblindedPaymentTokens,
        wallet: WalletInfo,
    }

    async fn fixture(tokens: usize) -> Fixture {
        let server = Arc::new(MockConfirmationsServer::new());
        let store = Arc::new(ConfirmationsStateStore::in_memory());
        store
            .add(server.issue_payment_tokens(tokens))
            .await
            .unwrap();
        let delegate = Arc::new(RecordingDelegate::new());
        let payments = RedeemUnblindedPaymentTokens::new(
            ConfirmationsConfig::default()
                .with_privacy_jitter(false)
                .with_retry_delay(Duration::from_secs(15)),
            store.clone(),
            store.clone(),
            server.clone(),
            Some(delegate.clone()),
        );
        Fixture {
            server,
            store,
            delegate,
            payments,
            wallet: WalletInfo::generate("payment"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_redeems_whole_batch_and_schedules_server_date() {
        let f = fixture(3).await;
        let next = Utc::now() + chrono::Duration::hours(12);
        f.server.set_next_redemption_at(Some(next));

        let outcome = f.payments.redeem(&f.wallet).await;
        assert_eq!(outcome, RedeemPaymentsOutcome::Redeemed { count: 3 });
        assert_eq!(PaymentTokenStore::count(&*f.store).await.unwrap(), 0);
        assert_eq!(f.store.next_token_redemption_at().await.unwrap(), Some(next));
        assert!(f
            .delegate
            .events()
            .contains(&DelegateEvent::DidRedeemPaymentTokens { count: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_far_future_server_date_is_clamped() {
        let server = Arc::new(MockConfirmationsServer::new());
        let store = Arc::new(ConfirmationsStateStore::in_memory());
        let payments = RedeemUnblindedPaymentTokens::new(
            ConfirmationsConfig::default(),
            store.clone(),
            store.clone(),
            server.clone(),
            None,
        );
        let wallet = WalletInfo::generate("payment");
        server.set_next_redemption_at(Some(DateTime::<Utc>::MAX_UTC - chrono::Duration::days(1)));

        for _ in 0..40 {
            store
                .add(server.issue_payment_tokens(1))
                .await
                .unwrap();
            let outcome = payments.redeem(&wallet).await;
            assert_eq!(outcome, RedeemPaymentsOutcome::Redeemed { count: 1 });

            let redeem_at = payments.next_redemption_at().unwrap();
            let ceiling = timer::after(timer::MAX_TIMER_DELAY) + chrono::Duration::seconds(1);
            assert!(redeem_at <= ceiling);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_keeps_tokens_and_backs_off() {
        let f = fixture(2).await;
        f.server
            .fail_next(Operation::RedeemPaymentTokens, EndpointError::Status { status: 502 });

        let outcome = f.payments.redeem(&f.wallet).await;
        assert_eq!(outcome, RedeemPaymentsOutcome::Failed { should_retry: true });
        assert_eq!(PaymentTokenStore::count(&*f.store).await.unwrap(), 2);
        assert!(f.payments.is_retrying());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(PaymentTokenStore::count(&*f.store).await.unwrap(), 0);
        assert_eq!(f.server.calls(Operation::RedeemPaymentTokens), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_leaves_batch_for_next_pass() {
        let f = fixture(2).await;
        f.server
            .fail_next(Operation::RedeemPaymentTokens, EndpointError::Status { status: 400 });

        let outcome = f.payments.redeem(&f.wallet).await;
        assert_eq!(outcome, RedeemPaymentsOutcome::Failed { should_retry: false });
        assert_eq!(PaymentTokenStore::count(&*f.store).await.unwrap(), 2);
        assert!(!f.payments.is_retrying());
        assert!(f.store.next_token_redemption_at().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_store_skips_network() {
        let f = fixture(0).await;
        let outcome = f.payments.redeem(&f.wallet).await;
        assert_eq!(outcome, RedeemPaymentsOutcome::NothingToRedeem);
        assert_eq!(f.server.calls(Operation::RedeemPaymentTokens), 0);
        assert!(f.payments.next_redemption_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_date_uses_short_delay() {
        let f = fixture(1).await;
        f.store
            .set_next_token_redemption_at(Some(Utc::now() - chrono::Duration::days(2)))
            .await
            .unwrap();

        let redeem_at = f.payments.maybe_redeem_after_delay(&f.wallet).await.unwrap();
        assert!(redeem_at - Utc::now() <= chrono::Duration::seconds(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(f.server.calls(Operation::RedeemPaymentTokens), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_schedule_uses_redemption_interval() {
        let f = fixture(1).await;
        let redeem_at = f.payments.maybe_redeem_after_delay(&f.wallet).await.unwrap();

        let stored = f.store.next_token_redemption_at().await.unwrap().unwrap();
        assert!(stored - Utc::now() > chrono::Duration::hours(23));
        assert!(redeem_at - Utc::now() > chrono::Duration::hours(23));
        assert_eq!(f.server.calls(Operation::RedeemPaymentTokens), 0);
    }
}
