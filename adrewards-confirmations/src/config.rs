//! Configuration for the confirmation engines.

use crate::errors::{ConfirmationsError, Result};
use crate::timer::MAX_TIMER_DELAY;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables shared by the refill, confirmation and payment engines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationsConfig {
    /// Refill when fewer than this many unblinded tokens remain.
    pub minimum_unblinded_tokens: usize,

    /// Refill up to this many unblinded tokens.
    pub maximum_unblinded_tokens: usize,

    /// Delay before checking the token pool again after a successful refill.
    pub refill_check_interval_secs: u64,

    /// First retry delay; doubles on each consecutive failure.
    pub retry_delay_secs: u64,

    /// Ceiling for exponential backoff.
    pub max_backoff_delay_secs: u64,

    /// Fixed delay for confirmation retries that do not back off.
    pub retry_confirmation_delay_secs: u64,

    /// Interval between payment token redemptions when the server gives no date.
    pub token_redemption_interval_secs: u64,

    /// Delay used when the stored redemption date has already passed.
    pub expired_token_redemption_delay_secs: u64,

    /// Randomise scheduled delays so redemptions cannot be correlated by time.
    pub use_privacy_jitter: bool,
}

fn default_minimum_unblinded_tokens() -> usize {
    20
}

fn default_maximum_unblinded_tokens() -> usize {
    50
}

impl Default for ConfirmationsConfig {
    fn default() -> Self {
        Self {
            minimum_unblinded_tokens: default_minimum_unblinded_tokens(),
            maximum_unblinded_tokens: default_maximum_unblinded_tokens(),
            refill_check_interval_secs: 60 * 60,
            retry_delay_secs: 15,
            max_backoff_delay_secs: 60 * 60,
            retry_confirmation_delay_secs: 5 * 60,
            token_redemption_interval_secs: 24 * 60 * 60,
            expired_token_redemption_delay_secs: 60,
            use_privacy_jitter: true,
        }
    }
}

impl ConfirmationsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the refill low-water mark and target.
    pub fn with_token_thresholds(mut self, minimum: usize, maximum: usize) -> Self {
        self.minimum_unblinded_tokens = minimum;
        self.maximum_unblinded_tokens = maximum;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_secs = delay.as_secs();
        self
    }

    pub fn with_max_backoff_delay(mut self, delay: Duration) -> Self {
        self.max_backoff_delay_secs = delay.as_secs();
        self
    }

    pub fn with_refill_check_interval(mut self, interval: Duration) -> Self {
        self.refill_check_interval_secs = interval.as_secs();
        self
    }

    pub fn with_retry_confirmation_delay(mut self, delay: Duration) -> Self {
        self.retry_confirmation_delay_secs = delay.as_secs();
        self
    }

    pub fn with_token_redemption_interval(mut self, interval: Duration) -> Self {
        self.token_redemption_interval_secs = interval.as_secs();
        self
    }

    pub fn with_expired_token_redemption_delay(mut self, delay: Duration) -> Self {
        self.expired_token_redemption_delay_secs = delay.as_secs();
        self
    }

    pub fn with_privacy_jitter(mut self, enabled: bool) -> Self {
        self.use_privacy_jitter = enabled;
        self
    }

    pub fn refill_check_interval(&self) -> Duration {
        Duration::from_secs(self.refill_check_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn max_backoff_delay(&self) -> Duration {
        Duration::from_secs(self.max_backoff_delay_secs)
    }

    pub fn retry_confirmation_delay(&self) -> Duration {
        Duration::from_secs(self.retry_confirmation_delay_secs)
    }

    pub fn token_redemption_interval(&self) -> Duration {
        Duration::from_secs(self.token_redemption_interval_secs)
    }

    pub fn expired_token_redemption_delay(&self) -> Duration {
        Duration::from_secs(self.expired_token_redemption_delay_secs)
    }

    /// Reject configurations the engines cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.minimum_unblinded_tokens == 0 {
            return Err(ConfirmationsError::InvalidConfig(
                "minimum_unblinded_tokens must be positive".into(),
            ));
        }
        if self.maximum_unblinded_tokens == 0 {
            return Err(ConfirmationsError::InvalidConfig(
                "maximum_unblinded_tokens must be positive".into(),
            ));
        }
        if self.retry_delay_secs == 0 {
            return Err(ConfirmationsError::InvalidConfig(
                "retry_delay_secs must be positive".into(),
            ));
        }
        let max_secs = MAX_TIMER_DELAY.as_secs();
        for (name, secs) in [
            ("refill_check_interval_secs", self.refill_check_interval_secs),
            ("max_backoff_delay_secs", self.max_backoff_delay_secs),
            ("retry_confirmation_delay_secs", self.retry_confirmation_delay_secs),
            ("token_redemption_interval_secs", self.token_redemption_interval_secs),
            (
                "expired_token_redemption_delay_secs",
                self.expired_token_redemption_delay_secs,
            ),
        ] {
            if secs > max_secs {
                return Err(ConfirmationsError::InvalidConfig(format!(
                    "{} ({}) exceeds {} seconds",
                    name, secs, max_secs
                )));
            }
        }
        if self.minimum_unblinded_tokens > self.maximum_unblinded_tokens {
            return Err(ConfirmationsError::InvalidConfig(format!(
                "minimum_unblinded_tokens ({}) exceeds maximum_unblinded_tokens ({})",
                self.minimum_unblinded_tokens, self.maximum_unblinded_tokens
            )));
        }
        if self.retry_delay_secs > self.max_backoff_delay_secs {
            return Err(ConfirmationsError::InvalidConfig(
                "retry_delay_secs exceeds max_backoff_delay_secs".into(),
            ));
        }
        Ok(())
    }
}
