//! # Anonymous Ad Confirmations
//!
//! Token lifecycle for confirming ad events without linking them to payments:
//!
//! 1. [`RefillUnblindedTokens`] keeps a pool of issuer-signed tokens.
//! 2. [`RedeemRewardConfirmation`] queues ad events and spends one token per
//!    event through [`RedeemUnblindedToken`], earning a payment token.
//! 3. [`RedeemUnblindedPaymentTokens`] periodically redeems payment tokens
//!    in one batch.
//!
//! [`Confirmations`] wires the three engines to one
//! [`ConfirmationsStateStore`] and a [`ConfirmationsEndpoint`].
//!
//! ## Guarantees
//! - A token is never spent twice: it is reserved in the same durable write
//!   that removes it from the pool
//! - A token is never lost on a transient failure: it is released back to
//!   the pool, and tokens left in flight by a crash are recovered at startup
//! - A signed batch is either fully accepted or fully discarded

pub mod config;
pub mod confirmation;
pub mod confirmations;
pub mod credential;
pub mod delegate;
pub mod endpoint;
pub mod errors;
pub mod issuers;
pub mod queue;
pub mod redeem_payment_tokens;
pub mod redeem_reward_confirmation;
pub mod redeem_unblinded_token;
pub mod refill;
pub mod store;
pub mod timer;
pub mod tokens;
pub mod wallet;

/// Mock issuer and recording delegates.
///
/// Only available with the `test-utils` feature or in test builds.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::ConfirmationsConfig;
pub use confirmation::{AdType, ConfirmationInfo, ConfirmationType, RewardConfirmation};
pub use confirmations::{Confirmations, ConfirmationsStatus};
pub use delegate::{
    ConfirmationsDelegates, RedeemUnblindedPaymentTokensDelegate, RedeemUnblindedTokenDelegate,
    RefillUnblindedTokensDelegate,
};
pub use endpoint::{
    ConfirmationsEndpoint, EndpointError, HttpConfirmationsEndpoint, HttpEndpointConfig,
    PaymentTokenResponse, RedeemPaymentTokensResponse, SignedTokensResponse,
};
pub use errors::{ConfirmationsError, Result};
pub use issuers::{CatalogIssuers, CatalogIssuersStore, IssuerInfo};
pub use queue::QueueItem;
pub use redeem_payment_tokens::{RedeemPaymentsOutcome, RedeemUnblindedPaymentTokens};
pub use redeem_reward_confirmation::{ProcessSummary, RedeemRewardConfirmation};
pub use redeem_unblinded_token::{RedeemOutcome, RedeemUnblindedToken};
pub use refill::{RefillHandle, RefillOutcome, RefillState, RefillUnblindedTokens};
pub use store::{
    ConfirmationQueue, ConfirmationsState, ConfirmationsStateStore, PaymentTokenStore,
    PendingConfirmationStore, RedemptionScheduleStore, UnblindedTokenStore,
};
pub use timer::{backoff_delay, privacy_delay, BackoffTimer, Timer, MAX_TIMER_DELAY};
pub use tokens::{UnblindedPaymentToken, UnblindedTokenInfo};
pub use wallet::WalletInfo;
