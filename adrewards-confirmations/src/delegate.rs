//! Upward notifications from the engines.
//!
//! Every method has an empty default so observers implement only what they
//! need. An engine built without a delegate stays silent.

use crate::confirmation::ConfirmationInfo;
use crate::tokens::UnblindedPaymentToken;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Notifications from [`RefillUnblindedTokens`](crate::RefillUnblindedTokens).
pub trait RefillUnblindedTokensDelegate: Send + Sync {
    fn on_did_refill_unblinded_tokens(&self) {}

    fn on_failed_to_refill_unblinded_tokens(&self, _should_retry: bool) {}

    fn on_will_retry_refilling_unblinded_tokens(&self, _retry_at: DateTime<Utc>) {}

    fn on_did_retry_refilling_unblinded_tokens(&self) {}

    fn on_captcha_required_to_refill_unblinded_tokens(&self, _captcha_id: &str) {}
}

/// Notifications from [`RedeemUnblindedToken`](crate::RedeemUnblindedToken).
pub trait RedeemUnblindedTokenDelegate: Send + Sync {
    fn on_did_redeem_unblinded_token(
        &self,
        _confirmation: &ConfirmationInfo,
        _payment_token: &UnblindedPaymentToken,
    ) {
    }

    fn on_failed_to_redeem_unblinded_token(
        &self,
        _confirmation: &ConfirmationInfo,
        _should_retry: bool,
        _should_backoff: bool,
    ) {
    }
}

/// Notifications from
/// [`RedeemUnblindedPaymentTokens`](crate::RedeemUnblindedPaymentTokens).
pub trait RedeemUnblindedPaymentTokensDelegate: Send + Sync {
    fn on_did_redeem_unblinded_payment_tokens(&self, _count: usize) {}

    fn on_failed_to_redeem_unblinded_payment_tokens(&self, _should_retry: bool) {}

    fn on_did_schedule_next_unblinded_payment_tokens_redemption(&self, _redeem_at: DateTime<Utc>) {
    }
}

/// Observers handed to [`Confirmations`](crate::Confirmations) at construction.
#[derive(Clone, Default)]
pub struct ConfirmationsDelegates {
    pub refill: Option<Arc<dyn RefillUnblindedTokensDelegate>>,
    pub redeem_unblinded_token: Option<Arc<dyn RedeemUnblindedTokenDelegate>>,
    pub redeem_payment_tokens: Option<Arc<dyn RedeemUnblindedPaymentTokensDelegate>>,
}

impl ConfirmationsDelegates {
    pub fn new() -> Self {
        Self::default()
    }

    /// One observer for every engine.
    pub fn all<D>(delegate: Arc<D>) -> Self
    where
        D: RefillUnblindedTokensDelegate
            + RedeemUnblindedTokenDelegate
            + RedeemUnblindedPaymentTokensDelegate
            + 'static,
    {
        Self {
            refill: Some(delegate.clone()),
            redeem_unblinded_token: Some(delegate.clone()),
            redeem_payment_tokens: Some(delegate),
        }
    }

    pub fn with_refill(mut self, delegate: Arc<dyn RefillUnblindedTokensDelegate>) -> Self {
        self.refill = Some(delegate);
        self
    }

    pub fn with_redeem_unblinded_token(
        mut self,
        delegate: Arc<dyn RedeemUnblindedTokenDelegate>,
    ) -> Self {
        self.redeem_unblinded_token = Some(delegate);
        self
    }

    pub fn with_redeem_payment_tokens(
        mut self,
        delegate: Arc<dyn RedeemUnblindedPaymentTokensDelegate>,
    ) -> Self {
        self.redeem_payment_tokens = Some(delegate);
        self
    }
}

impl std::fmt::Debug for ConfirmationsDelegates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationsDelegates")
            .field("refill", &self.refill.is_some())
            .field("redeem_unblinded_token", &self.redeem_unblinded_token.is_some())
            .field("redeem_payment_tokens", &self.redeem_payment_tokens.is_some())
            .finish()
    }
}
