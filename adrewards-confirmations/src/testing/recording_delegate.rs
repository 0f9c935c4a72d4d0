//! Delegate that records every notification for later assertions.

use crate::confirmation::{ConfirmationInfo, ConfirmationType};
use crate::delegate::{
    RedeemUnblindedPaymentTokensDelegate, RedeemUnblindedTokenDelegate,
    RefillUnblindedTokensDelegate,
};
use crate::tokens::UnblindedPaymentToken;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DelegateEvent {
    DidRefill,
    FailedToRefill {
        should_retry: bool,
    },
    WillRetryRefill {
        retry_at: DateTime<Utc>,
    },
    DidRetryRefill,
    CaptchaRequired(String),
    DidRedeemUnblindedToken {
        confirmation_id: String,
        confirmation_type: ConfirmationType,
    },
    FailedToRedeemUnblindedToken {
        should_retry: bool,
        should_backoff: bool,
    },
    DidRedeemPaymentTokens {
        count: usize,
    },
    FailedToRedeemPaymentTokens {
        should_retry: bool,
    },
    DidScheduleRedemption {
        redeem_at: DateTime<Utc>,
    },
}

/// Observer for all three engines.
#[derive(Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<DelegateEvent>>,
}

impl RecordingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DelegateEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&DelegateEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| matches(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Poll until an event satisfies `matches` or `timeout` elapses.
    pub async fn wait_for(
        &self,
        matches: impl Fn(&DelegateEvent) -> bool,
        timeout: Duration,
    ) -> Option<DelegateEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.events.lock().unwrap().iter().find(|e| matches(e)).cloned() {
                return Some(event);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn record(&self, event: DelegateEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RefillUnblindedTokensDelegate for RecordingDelegate {
    fn on_did_refill_unblinded_tokens(&self) {
        self.record(DelegateEvent::DidRefill);
    }

    fn on_failed_to_refill_unblinded_tokens(&self, should_retry: bool) {
        self.record(DelegateEvent::FailedToRefill { should_retry });
    }

    fn on_will_retry_refilling_unblinded_tokens(&self, retry_at: DateTime<Utc>) {
        self.record(DelegateEvent::WillRetryRefill { retry_at });
    }

    fn on_did_retry_refilling_unblinded_tokens(&self) {
        self.record(DelegateEvent::DidRetryRefill);
    }

    fn on_captcha_required_to_refill_unblinded_tokens(&self, captcha_id: &str) {
        self.record(DelegateEvent::CaptchaRequired(captcha_id.to_string()));
    }
}

impl RedeemUnblindedTokenDelegate for RecordingDelegate {
    fn on_did_redeem_unblinded_token(
        &self,
        confirmation: &ConfirmationInfo,
        _payment_token: &UnblindedPaymentToken,
    ) {
        self.record(DelegateEvent::DidRedeemUnblindedToken {
            confirmation_id: confirmation.id.clone(),
            confirmation_type: confirmation.confirmation_type,
        });
    }

    fn on_failed_to_redeem_unblinded_token(
        &self,
        _confirmation: &ConfirmationInfo,
        should_retry: bool,
        should_backoff: bool,
    ) {
        self.record(DelegateEvent::FailedToRedeemUnblindedToken {
            should_retry,
            should_backoff,
        });
    }
}

impl RedeemUnblindedPaymentTokensDelegate for RecordingDelegate {
    fn on_did_redeem_unblinded_payment_tokens(&self, count: usize) {
        self.record(DelegateEvent::DidRedeemPaymentTokens { count });
    }

    fn on_failed_to_redeem_unblinded_payment_tokens(&self, should_retry: bool) {
        self.record(DelegateEvent::FailedToRedeemPaymentTokens { should_retry });
    }

    fn on_did_schedule_next_unblinded_payment_tokens_redemption(&self, redeem_at: DateTime<Utc>) {
        self.record(DelegateEvent::DidScheduleRedemption { redeem_at });
    }
}
