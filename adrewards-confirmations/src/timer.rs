//! One-shot and exponential backoff timers.
//!
//! A [`Timer`] holds at most one pending callback. Starting it again cancels
//! whatever was pending, and dropping it cancels the pending callback. The
//! callback runs on a spawned tokio task, so `start` must be called from
//! within a runtime.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

struct Pending {
    id: u64,
    cancel: oneshot::Sender<()>,
    fires_at: DateTime<Utc>,
}

type Slot = Arc<Mutex<Option<Pending>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<Pending>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Longest delay a timer waits. Longer delays, including jittered ones, are
/// clamped to it.
pub const MAX_TIMER_DELAY: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Wall-clock time `delay` from now, saturating at the latest representable time.
pub(crate) fn after(delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Randomise `delay` around its mean so scheduled requests cannot be
/// correlated with the event that scheduled them. Never exceeds [`MAX_TIMER_DELAY`].
pub fn privacy_delay(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let uniform: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
    Duration::try_from_secs_f64(-uniform.ln() * delay.as_secs_f64())
        .unwrap_or(MAX_TIMER_DELAY)
        .min(MAX_TIMER_DELAY)
}

/// Single pending deferred callback, last start wins.
#[derive(Default)]
pub struct Timer {
    slot: Slot,
    next_id: AtomicU64,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing any pending callback. Delays past
    /// [`MAX_TIMER_DELAY`] are clamped.
    ///
    /// Returns the time the callback is due.
    pub fn start<F, Fut>(&self, delay: Duration, task: F) -> DateTime<Utc>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = delay.min(MAX_TIMER_DELAY);
        let mut slot = lock(&self.slot);
        if let Some(previous) = slot.take() {
            let _ = previous.cancel.send(());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let fires_at = after(delay);
        let shared = Arc::clone(&self.slot);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel_rx => {}
                _ = tokio::time::sleep(delay) => {
                    let fired = {
                        let mut slot = lock(&shared);
                        if slot.as_ref().map(|pending| pending.id) == Some(id) {
                            slot.take();
                            true
                        } else {
                            false
                        }
                    };
                    if fired {
                        task().await;
                    }
                }
            }
        });

        *slot = Some(Pending {
            id,
            cancel: cancel_tx,
            fires_at,
        });
        fires_at
    }

    /// Like [`Timer::start`] with the delay passed through [`privacy_delay`].
    pub fn start_with_privacy<F, Fut>(&self, delay: Duration, task: F) -> DateTime<Utc>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start(privacy_delay(delay), task)
    }

    /// Cancel the pending callback. Returns false if nothing was pending.
    pub fn stop(&self) -> bool {
        match lock(&self.slot).take() {
            Some(pending) => {
                let _ = pending.cancel.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.slot).is_some()
    }

    pub fn fires_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.slot).as_ref().map(|pending| pending.fires_at)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `base * 2^attempts`, capped at `max`.
pub fn backoff_delay(base: Duration, attempts: u32, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// [`Timer`] whose delay doubles on every start until [`BackoffTimer::reset`].
pub struct BackoffTimer {
    timer: Timer,
    attempts: AtomicU32,
    max_delay: Duration,
}

impl BackoffTimer {
    pub fn new(max_delay: Duration) -> Self {
        Self {
            timer: Timer::new(),
            attempts: AtomicU32::new(0),
            max_delay,
        }
    }

    /// Delay the next start would use for `base`.
    pub fn current_delay(&self, base: Duration) -> Duration {
        backoff_delay(base, self.attempts.load(Ordering::Relaxed), self.max_delay)
    }

    pub fn start<F, Fut>(&self, base: Duration, task: F) -> DateTime<Utc>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.next_delay(base);
        tracing::debug!(delay_secs = delay.as_secs(), "Backing off");
        self.timer.start(delay, task)
    }

    pub fn start_with_privacy<F, Fut>(&self, base: Duration, task: F) -> DateTime<Utc>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.next_delay(base);
        self.timer.start_with_privacy(delay, task)
    }

    fn next_delay(&self, base: Duration) -> Duration {
        let attempts = self.attempts.fetch_add(1, Ordering::Relaxed);
        backoff_delay(base, attempts, self.max_delay)
    }

    /// Cancel the pending callback, keeping the backoff state.
    pub fn stop(&self) -> bool {
        self.timer.stop()
    }

    /// Return the delay to its floor.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    pub fn fires_at(&self) -> Option<DateTime<Utc>> {
        self.timer.fires_at()
    }
}
