//! Persistence boundary.
//!
//! The engines only see these traits. [`ConfirmationsStateStore`] implements
//! all of them over a single JSON document, either in memory or on disk.

mod state;

pub use state::{ConfirmationsState, ConfirmationsStateStore};

use crate::confirmation::{ConfirmationInfo, RewardConfirmation};
use crate::errors::Result;
use crate::queue::QueueItem;
use crate::tokens::{UnblindedPaymentToken, UnblindedTokenInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Pool of unblinded tokens waiting to be spent on confirmations.
///
/// Tokens are either available or in flight. Spending goes through
/// [`reserve`](Self::reserve), which moves the oldest available token to the
/// in-flight set in one durable write, followed by exactly one of
/// [`release`](Self::release) or [`consume`](Self::consume).
#[async_trait]
pub trait UnblindedTokenStore: Send + Sync {
    /// Number of available tokens. In-flight tokens are not counted.
    async fn count(&self) -> Result<usize>;

    /// Oldest available token, without reserving it.
    async fn get(&self) -> Result<Option<UnblindedTokenInfo>>;

    async fn get_all(&self) -> Result<Vec<UnblindedTokenInfo>>;

    /// Append tokens, skipping any already present. Returns how many were added.
    async fn put(&self, tokens: Vec<UnblindedTokenInfo>) -> Result<usize>;

    /// Remove an available token. Returns false if it was not present.
    async fn remove(&self, token: &UnblindedTokenInfo) -> Result<bool>;

    /// Pop the oldest available token and mark it in flight. Tokens held by
    /// a pending confirmation that is not created yet are skipped.
    async fn reserve(&self) -> Result<Option<UnblindedTokenInfo>>;

    /// Mark a specific token in flight again so a pending confirmation can be
    /// resent with it. Returns false if the token is neither available nor
    /// already in flight.
    async fn reclaim(&self, token: &UnblindedTokenInfo) -> Result<bool>;

    /// Return an in-flight token to the front of the pool.
    async fn release(&self, token: &UnblindedTokenInfo) -> Result<()>;

    /// Permanently drop an in-flight token.
    async fn consume(&self, token: &UnblindedTokenInfo) -> Result<()>;

    async fn in_flight_count(&self) -> Result<usize>;

    /// Return every in-flight token to the pool. Called once at startup.
    async fn recover_in_flight(&self) -> Result<usize>;
}

/// Payment tokens earned by confirmations, waiting to be redeemed.
#[async_trait]
pub trait PaymentTokenStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<UnblindedPaymentToken>>;

    async fn count(&self) -> Result<usize>;

    async fn add(&self, tokens: Vec<UnblindedPaymentToken>) -> Result<()>;

    /// Remove the given tokens. Returns how many were found.
    async fn remove(&self, tokens: &[UnblindedPaymentToken]) -> Result<usize>;

    async fn remove_all(&self) -> Result<()>;
}

/// FIFO of reward confirmations, ordered by `created_at`.
#[async_trait]
pub trait ConfirmationQueue: Send + Sync {
    async fn push(&self, item: QueueItem<RewardConfirmation>) -> Result<()>;

    async fn front(&self) -> Result<Option<QueueItem<RewardConfirmation>>>;

    async fn all(&self) -> Result<Vec<QueueItem<RewardConfirmation>>>;

    async fn remove(&self, id: &str) -> Result<bool>;

    /// Bump the retry count in place. Returns the new count.
    async fn increment_retry_count(&self, id: &str) -> Result<Option<u32>>;

    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Confirmations that were submitted, or are about to be, and are not
/// resolved yet. Keyed by the reward's transaction id.
#[async_trait]
pub trait PendingConfirmationStore: Send + Sync {
    async fn get_pending(&self, transaction_id: &str) -> Result<Option<ConfirmationInfo>>;

    /// Insert or replace the pending confirmation for its transaction id.
    async fn put_pending(&self, confirmation: ConfirmationInfo) -> Result<()>;

    async fn remove_pending(&self, transaction_id: &str) -> Result<bool>;

    async fn pending_count(&self) -> Result<usize>;
}

/// When the next payment token redemption is due.
#[async_trait]
pub trait RedemptionScheduleStore: Send + Sync {
    async fn next_token_redemption_at(&self) -> Result<Option<DateTime<Utc>>>;

    async fn set_next_token_redemption_at(&self, at: Option<DateTime<Utc>>) -> Result<()>;
}
