//! Durable queue of reward confirmations.
//!
//! Items are redeemed oldest first. A retryable failure leaves the item at
//! the head of the queue and stops the pass until the retry timer fires.

use crate::config::ConfirmationsConfig;
use crate::confirmation::RewardConfirmation;
use crate::errors::Result;
use crate::queue::QueueItem;
use crate::redeem_unblinded_token::{RedeemOutcome, RedeemUnblindedToken};
use crate::refill::RefillHandle;
use crate::store::ConfirmationQueue;
use crate::timer::{BackoffTimer, Timer};
use crate::wallet::WalletInfo;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Summary of one pass over the queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub redeemed: usize,
    /// Items dropped after a failure that will not be retried.
    pub discarded: usize,
    /// Items still queued when the pass ended.
    pub remaining: usize,
    pub retry_at: Option<DateTime<Utc>>,
}

struct QueueInner {
    config: ConfirmationsConfig,
    queue: Arc<dyn ConfirmationQueue>,
    redeemer: RedeemUnblindedToken,
    refill: Option<RefillHandle>,
    wallet: Mutex<Option<WalletInfo>>,
    is_processing: AtomicBool,
    /// Items already redeemed or discarded whose removal from the queue failed.
    resolved: Mutex<HashSet<String>>,
    backoff_timer: BackoffTimer,
    retry_timer: Timer,
}

/// Clears the processing flag when a pass ends, however it ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Reward confirmation queue. Dropping it cancels scheduled retries.
pub struct RedeemRewardConfirmation {
    inner: Arc<QueueInner>,
}

impl RedeemRewardConfirmation {
    pub fn new(
        config: ConfirmationsConfig,
        queue: Arc<dyn ConfirmationQueue>,
        redeemer: RedeemUnblindedToken,
        refill: Option<RefillHandle>,
    ) -> Self {
        let backoff_timer = BackoffTimer::new(config.max_backoff_delay());
        Self {
            inner: Arc::new(QueueInner {
                config,
                queue,
                redeemer,
                refill,
                wallet: Mutex::new(None),
                is_processing: AtomicBool::new(false),
                resolved: Mutex::new(HashSet::new()),
                backoff_timer,
                retry_timer: Timer::new(),
            }),
        }
    }

    pub fn set_wallet(&self, wallet: WalletInfo) {
        *self.inner.wallet.lock().unwrap_or_else(|e| e.into_inner()) = Some(wallet);
    }

    /// Queue `reward`. Returns the queue item id.
    pub async fn add(&self, reward: RewardConfirmation) -> Result<String> {
        let item = QueueItem::new(reward);
        let id = item.id.clone();
        tracing::debug!(
            id = %id,
            confirmation_type = %item.value.confirmation_type,
            "Queued reward confirmation"
        );
        self.inner.queue.push(item).await?;
        Ok(id)
    }

    /// Redeem queued confirmations until the queue is empty or an item has
    /// to wait for a retry. Returns `None` if a pass is already running.
    pub async fn process(&self) -> Option<ProcessSummary> {
        self.inner.process().await
    }

    pub fn redeemer(&self) -> &RedeemUnblindedToken {
        &self.inner.redeemer
    }

    pub fn is_retrying(&self) -> bool {
        self.inner.backoff_timer.is_running() || self.inner.retry_timer.is_running()
    }

    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        self.inner
            .backoff_timer
            .fires_at()
            .or_else(|| self.inner.retry_timer.fires_at())
    }
}

impl QueueInner {
    fn wallet(&self) -> Option<WalletInfo> {
        self.wallet.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn process(self: &Arc<Self>) -> Option<ProcessSummary> {
        if self.is_processing.swap(true, Ordering::AcqRel) {
            tracing::debug!("Already processing reward confirmations");
            return None;
        }
        let _guard = ProcessingGuard(&self.is_processing);

        let mut summary = ProcessSummary::default();
        match self.wallet() {
            Some(wallet) => self.drain(&wallet, &mut summary).await,
            None => tracing::warn!("Cannot process reward confirmations without a wallet"),
        }
        summary.remaining = self.queue.len().await.unwrap_or_default();

        tracing::info!(
            redeemed = summary.redeemed,
            discarded = summary.discarded,
            remaining = summary.remaining,
            "Processed reward confirmations"
        );

        if let Some(refill) = &self.refill {
            refill.maybe_refill().await;
        }
        Some(summary)
    }

    async fn drain(self: &Arc<Self>, wallet: &WalletInfo, summary: &mut ProcessSummary) {
        loop {
            let item = match self.queue.front().await {
                Ok(Some(item)) => item,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read confirmation queue");
                    summary.retry_at = Some(self.schedule_retry(true));
                    return;
                }
            };

            if self.is_resolved(&item.id) {
                if !self.remove(&item.id).await {
                    summary.retry_at = Some(self.schedule_retry(true));
                    return;
                }
                continue;
            }

            match self.redeemer.redeem(wallet, &item.value).await {
                RedeemOutcome::Redeemed(_) => {
                    summary.redeemed += 1;
                    self.backoff_timer.reset();
                }
                RedeemOutcome::Failed {
                    should_retry: false,
                    ..
                } => summary.discarded += 1,
                RedeemOutcome::Failed {
                    should_retry: true,
                    should_backoff,
                } => {
                    let retry_count = self
                        .queue
                        .increment_retry_count(&item.id)
                        .await
                        .ok()
                        .flatten();
                    summary.retry_at = Some(self.schedule_retry(should_backoff));
                    tracing::info!(
                        id = %item.id,
                        retry_count,
                        retry_at = ?summary.retry_at,
                        "Retry redeeming reward confirmation"
                    );
                    return;
                }
            }

            // The item must never be redeemed again, even if removing it fails.
            self.mark_resolved(&item.id);
            if !self.remove(&item.id).await {
                summary.retry_at = Some(self.schedule_retry(true));
                return;
            }
        }
    }

    fn is_resolved(&self, id: &str) -> bool {
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    fn mark_resolved(&self, id: &str) {
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string());
    }

    /// Remove a resolved item. Returns false if the queue could not be updated.
    async fn remove(&self, id: &str) -> bool {
        match self.queue.remove(id).await {
            Ok(_) => {
                self.resolved
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(id);
                true
            }
            Err(e) => {
                tracing::error!(id = %id, error = %e, "Failed to remove reward confirmation");
                false
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, should_backoff: bool) -> DateTime<Utc> {
        let weak = Arc::downgrade(self);
        let task = move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.process().await;
            }
        };
        if should_backoff {
            self.retry_timer.stop();
            self.backoff_timer.start(self.config.retry_delay(), task)
        } else {
            self.backoff_timer.stop();
            self.retry_timer
                .start(self.config.retry_confirmation_delay(), task)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::{AdType, ConfirmationType};
    use crate::endpoint::EndpointError;
    use crate::errors::ConfirmationsError;
    use crate::issuers::CatalogIssuersStore;
    use crate::store::{ConfirmationsStateStore, PaymentTokenStore, UnblindedTokenStore};
    use crate::testing::{MockConfirmationsServer, Operation};
    use std::time::Duration;

    struct Fixture {
        server: Arc<MockConfirmationsServer>,
        store: Arc<ConfirmationsStateStore>,
        wallet: WalletInfo,
        queue: RedeemRewardConfirmation,
    }

    async fn fixture(tokens: usize, config: ConfirmationsConfig) -> Fixture {
        let server = Arc::new(MockConfirmationsServer::new());
        let store = Arc::new(ConfirmationsStateStore::in_memory());
        let issuers = Arc::new(CatalogIssuersStore::new());
        issuers.set(server.catalog_issuers()).unwrap();
        let wallet = WalletInfo::generate("payment");
        store
            .put(server.issue_unblinded_tokens(tokens, &wallet))
            .await
            .unwrap();
        let redeemer = RedeemUnblindedToken::new(
            store.clone(),
            store.clone(),
            store.clone(),
            server.clone(),
            issuers,
            None,
        );
        let queue = RedeemRewardConfirmation::new(config, store.clone(), redeemer, None);
        queue.set_wallet(wallet.clone());
        Fixture {
            server,
            store,
            wallet,
            queue,
        }
    }

    /// Queue over the state store whose next `remove` fails.
    struct FailingRemoveQueue {
        store: Arc<ConfirmationsStateStore>,
        fail_next_remove: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ConfirmationQueue for FailingRemoveQueue {
        async fn push(&self, item: QueueItem<RewardConfirmation>) -> Result<()> {
            ConfirmationQueue::push(&*self.store, item).await
        }

        async fn front(&self) -> Result<Option<QueueItem<RewardConfirmation>>> {
            ConfirmationQueue::front(&*self.store).await
        }

        async fn all(&self) -> Result<Vec<QueueItem<RewardConfirmation>>> {
            ConfirmationQueue::all(&*self.store).await
        }

        async fn remove(&self, id: &str) -> Result<bool> {
            if self.fail_next_remove.swap(false, Ordering::SeqCst) {
                return Err(ConfirmationsError::Storage("disk full".into()));
            }
            ConfirmationQueue::remove(&*self.store, id).await
        }

        async fn increment_retry_count(&self, id: &str) -> Result<Option<u32>> {
            ConfirmationQueue::increment_retry_count(&*self.store, id).await
        }

        async fn len(&self) -> Result<usize> {
            ConfirmationQueue::len(&*self.store).await
        }
    }

    fn reward(confirmation_type: ConfirmationType) -> RewardConfirmation {
        RewardConfirmation::new("creative", "placement", confirmation_type, AdType::AdNotification)
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_queue_in_order() {
        let f = fixture(5, ConfirmationsConfig::default()).await;
        f.queue.add(reward(ConfirmationType::View)).await.unwrap();
        f.queue.add(reward(ConfirmationType::Click)).await.unwrap();

        let summary = f.queue.process().await.unwrap();
        assert_eq!(summary.redeemed, 2);
        assert_eq!(summary.remaining, 0);

        let types: Vec<_> = PaymentTokenStore::get_all(&*f.store)
            .await
            .unwrap()
            .into_iter()
            .map(|token| token.confirmation_type)
            .collect();
        assert_eq!(types, vec![ConfirmationType::View, ConfirmationType::Click]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_keeps_item_at_head_and_retries() {
        let f = fixture(
            5,
            ConfirmationsConfig::default().with_retry_delay(Duration::from_secs(15)),
        )
        .await;
        let id = f.queue.add(reward(ConfirmationType::View)).await.unwrap();
        f.queue.add(reward(ConfirmationType::Click)).await.unwrap();
        f.server
            .fail_next(Operation::CreateConfirmation, EndpointError::Status { status: 503 });

        let summary = f.queue.process().await.unwrap();
        assert_eq!(summary.redeemed, 0);
        assert_eq!(summary.remaining, 2);
        assert!(f.queue.is_retrying());

        let head = f.store.front().await.unwrap().unwrap();
        assert_eq!(head.id, id);
        assert_eq!(head.retry_count, 1);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(f.store.len().await.unwrap(), 0);
        assert_eq!(PaymentTokenStore::count(&*f.store).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_drops_item() {
        let f = fixture(5, ConfirmationsConfig::default()).await;
        f.queue.add(reward(ConfirmationType::View)).await.unwrap();
        f.server
            .fail_next(Operation::CreateConfirmation, EndpointError::Status { status: 400 });

        let summary = f.queue.process().await.unwrap();
        assert_eq!(summary.discarded, 1);
        assert_eq!(summary.remaining, 0);
        assert!(!f.queue.is_retrying());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_payment_token_uses_fixed_retry_delay() {
        let f = fixture(
            5,
            ConfirmationsConfig::default().with_retry_confirmation_delay(Duration::from_secs(300)),
        )
        .await;
        f.queue.add(reward(ConfirmationType::View)).await.unwrap();
        f.server
            .fail_next(Operation::FetchPaymentToken, EndpointError::Status { status: 404 });

        let summary = f.queue.process().await.unwrap();
        let retry_in = summary.retry_at.unwrap() - Utc::now();
        assert!(retry_in > chrono::Duration::seconds(290));

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(f.store.len().await.unwrap(), 0);
        assert_eq!(f.server.calls(Operation::CreateConfirmation), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_removal_never_redeems_the_item_twice() {
        let f = fixture(5, ConfirmationsConfig::default()).await;
        let flaky = Arc::new(FailingRemoveQueue {
            store: f.store.clone(),
            fail_next_remove: AtomicBool::new(true),
        });
        let issuers = Arc::new(CatalogIssuersStore::new());
        issuers.set(f.server.catalog_issuers()).unwrap();
        let redeemer = RedeemUnblindedToken::new(
            f.store.clone(),
            f.store.clone(),
            f.store.clone(),
            f.server.clone(),
            issuers,
            None,
        );
        let queue = RedeemRewardConfirmation::new(
            ConfirmationsConfig::default().with_retry_delay(Duration::from_secs(15)),
            flaky,
            redeemer,
            None,
        );
        queue.set_wallet(f.wallet.clone());
        queue.add(reward(ConfirmationType::View)).await.unwrap();
        queue.add(reward(ConfirmationType::Click)).await.unwrap();

        let summary = queue.process().await.unwrap();
        assert_eq!(summary.redeemed, 1);
        assert_eq!(summary.remaining, 2);
        assert!(queue.is_retrying());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(f.store.len().await.unwrap(), 0);
        assert_eq!(f.server.calls(Operation::CreateConfirmation), 2);
        assert_eq!(PaymentTokenStore::count(&*f.store).await.unwrap(), 2);
        assert_eq!(UnblindedTokenStore::count(&*f.store).await.unwrap(), 3);
    }
}
