use super::{
    ConfirmationQueue, PaymentTokenStore, PendingConfirmationStore, RedemptionScheduleStore,
    UnblindedTokenStore,
};
use crate::confirmation::{ConfirmationInfo, RewardConfirmation};
use crate::errors::{ConfirmationsError, Result};
use crate::queue::QueueItem;
use crate::tokens::{UnblindedPaymentToken, UnblindedTokenInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Everything the confirmations subsystem persists.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationsState {
    pub unblinded_tokens: Vec<UnblindedTokenInfo>,
    pub in_flight_unblinded_tokens: Vec<UnblindedTokenInfo>,
    pub unblinded_payment_tokens: Vec<UnblindedPaymentToken>,
    pub confirmations_queue: Vec<QueueItem<RewardConfirmation>>,
    pub pending_confirmations: Vec<ConfirmationInfo>,
    pub next_token_redemption_at: Option<DateTime<Utc>>,
}

impl ConfirmationsState {
    /// Whether a pending confirmation that is not created yet holds `token`.
    fn is_held(&self, token: &UnblindedTokenInfo) -> bool {
        self.pending_confirmations.iter().any(|confirmation| {
            !confirmation.was_created
                && confirmation
                    .unblinded_token
                    .as_ref()
                    .is_some_and(|held| held.value == token.value)
        })
    }
}

/// Single-document store backing every persistence trait.
///
/// Each mutation is applied to a copy of the state, written to disk, and only
/// then made visible, so memory is never ahead of the file.
pub struct ConfirmationsStateStore {
    path: Option<PathBuf>,
    state: Mutex<ConfirmationsState>,
}

impl ConfirmationsStateStore {
    /// Store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(ConfirmationsState::default()),
        }
    }

    /// Open a file-backed store, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            if json.trim().is_empty() {
                ConfirmationsState::default()
            } else {
                serde_json::from_str(&json)?
            }
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            ConfirmationsState::default()
        };

        tracing::info!(
            path = %path.display(),
            unblinded_tokens = state.unblinded_tokens.len(),
            in_flight = state.in_flight_unblinded_tokens.len(),
            payment_tokens = state.unblinded_payment_tokens.len(),
            queued = state.confirmations_queue.len(),
            pending = state.pending_confirmations.len(),
            "Loaded confirmations state"
        );

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Result<ConfirmationsState> {
        self.read(|state| state.clone())
    }

    /// Drop all persisted state.
    pub fn reset(&self) -> Result<()> {
        self.mutate(|state| *state = ConfirmationsState::default())
    }

    fn read<R>(&self, f: impl FnOnce(&ConfirmationsState) -> R) -> Result<R> {
        let state = self
            .state
            .lock()
            .map_err(|_| ConfirmationsError::lock_poisoned("confirmations state"))?;
        Ok(f(&state))
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut ConfirmationsState) -> R) -> Result<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ConfirmationsError::lock_poisoned("confirmations state"))?;
        let mut next = state.clone();
        let result = f(&mut next);
        if let Some(path) = &self.path {
            write_state(path, &next)?;
        }
        *state = next;
        Ok(result)
    }
}

fn write_state(path: &Path, state: &ConfirmationsState) -> Result<()> {
    use fs2::FileExt;

    let json = serde_json::to_vec_pretty(state)?;
    let lock_path = path.with_extension("lock");
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    lock.lock_exclusive()?;

    let tmp_path = path.with_extension("tmp");
    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    })();

    lock.unlock()?;
    if let Err(e) = result {
        tracing::error!(path = %path.display(), error = %e, "Failed to save confirmations state");
        return Err(e.into());
    }
    Ok(())
}

fn position(tokens: &[UnblindedTokenInfo], token: &UnblindedTokenInfo) -> Option<usize> {
    tokens.iter().position(|t| t.value == token.value)
}

#[async_trait]
impl UnblindedTokenStore for ConfirmationsStateStore {
    async fn count(&self) -> Result<usize> {
        self.read(|state| state.unblinded_tokens.len())
    }

    async fn get(&self) -> Result<Option<UnblindedTokenInfo>> {
        self.read(|state| state.unblinded_tokens.first().cloned())
    }

    async fn get_all(&self) -> Result<Vec<UnblindedTokenInfo>> {
        self.read(|state| state.unblinded_tokens.clone())
    }

    async fn put(&self, tokens: Vec<UnblindedTokenInfo>) -> Result<usize> {
        self.mutate(|state| {
            let mut added = 0;
            for token in tokens {
                if position(&state.unblinded_tokens, &token).is_some()
                    || position(&state.in_flight_unblinded_tokens, &token).is_some()
                {
                    continue;
                }
                state.unblinded_tokens.push(token);
                added += 1;
            }
            added
        })
    }

    async fn remove(&self, token: &UnblindedTokenInfo) -> Result<bool> {
        self.mutate(|state| match position(&state.unblinded_tokens, token) {
            Some(index) => {
                state.unblinded_tokens.remove(index);
                true
            }
            None => false,
        })
    }

    async fn reserve(&self) -> Result<Option<UnblindedTokenInfo>> {
        self.mutate(|state| {
            let index = state
                .unblinded_tokens
                .iter()
                .position(|token| !state.is_held(token))?;
            let token = state.unblinded_tokens.remove(index);
            state.in_flight_unblinded_tokens.push(token.clone());
            Some(token)
        })
    }

    async fn reclaim(&self, token: &UnblindedTokenInfo) -> Result<bool> {
        self.mutate(|state| {
            if position(&state.in_flight_unblinded_tokens, token).is_some() {
                return true;
            }
            match position(&state.unblinded_tokens, token) {
                Some(index) => {
                    let token = state.unblinded_tokens.remove(index);
                    state.in_flight_unblinded_tokens.push(token);
                    true
                }
                None => false,
            }
        })
    }

    async fn release(&self, token: &UnblindedTokenInfo) -> Result<()> {
        self.mutate(|state| {
            let Some(index) = position(&state.in_flight_unblinded_tokens, token) else {
                return Err(ConfirmationsError::NotFound(
                    "in-flight unblinded token".into(),
                ));
            };
            let token = state.in_flight_unblinded_tokens.remove(index);
            state.unblinded_tokens.insert(0, token);
            Ok(())
        })?
    }

    async fn consume(&self, token: &UnblindedTokenInfo) -> Result<()> {
        self.mutate(|state| {
            if let Some(index) = position(&state.in_flight_unblinded_tokens, token) {
                state.in_flight_unblinded_tokens.remove(index);
            }
        })
    }

    async fn in_flight_count(&self) -> Result<usize> {
        self.read(|state| state.in_flight_unblinded_tokens.len())
    }

    async fn recover_in_flight(&self) -> Result<usize> {
        self.mutate(|state| {
            let recovered: Vec<_> = state.in_flight_unblinded_tokens.drain(..).collect();
            let count = recovered.len();
            for token in recovered.into_iter().rev() {
                state.unblinded_tokens.insert(0, token);
            }
            count
        })
    }
}

#[async_trait]
impl PaymentTokenStore for ConfirmationsStateStore {
    async fn get_all(&self) -> Result<Vec<UnblindedPaymentToken>> {
        self.read(|state| state.unblinded_payment_tokens.clone())
    }

    async fn count(&self) -> Result<usize> {
        self.read(|state| state.unblinded_payment_tokens.len())
    }

    async fn add(&self, tokens: Vec<UnblindedPaymentToken>) -> Result<()> {
        self.mutate(|state| {
            for token in tokens {
                if !state
                    .unblinded_payment_tokens
                    .iter()
                    .any(|t| t.value == token.value)
                {
                    state.unblinded_payment_tokens.push(token);
                }
            }
        })
    }

    async fn remove(&self, tokens: &[UnblindedPaymentToken]) -> Result<usize> {
        self.mutate(|state| {
            let before = state.unblinded_payment_tokens.len();
            state
                .unblinded_payment_tokens
                .retain(|t| !tokens.iter().any(|removed| removed.value == t.value));
            before - state.unblinded_payment_tokens.len()
        })
    }

    async fn remove_all(&self) -> Result<()> {
        self.mutate(|state| state.unblinded_payment_tokens.clear())
    }
}

#[async_trait]
impl ConfirmationQueue for ConfirmationsStateStore {
    async fn push(&self, item: QueueItem<RewardConfirmation>) -> Result<()> {
        self.mutate(|state| {
            let index = state
                .confirmations_queue
                .partition_point(|queued| queued.created_at <= item.created_at);
            state.confirmations_queue.insert(index, item);
        })
    }

    async fn front(&self) -> Result<Option<QueueItem<RewardConfirmation>>> {
        self.read(|state| state.confirmations_queue.first().cloned())
    }

    async fn all(&self) -> Result<Vec<QueueItem<RewardConfirmation>>> {
        self.read(|state| state.confirmations_queue.clone())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        self.mutate(|state| {
            let before = state.confirmations_queue.len();
            state.confirmations_queue.retain(|item| item.id != id);
            before != state.confirmations_queue.len()
        })
    }

    async fn increment_retry_count(&self, id: &str) -> Result<Option<u32>> {
        self.mutate(|state| {
            state
                .confirmations_queue
                .iter_mut()
                .find(|item| item.id == id)
                .map(|item| {
                    item.retry_count += 1;
                    item.retry_count
                })
        })
    }

    async fn len(&self) -> Result<usize> {
        self.read(|state| state.confirmations_queue.len())
    }
}

#[async_trait]
impl PendingConfirmationStore for ConfirmationsStateStore {
    async fn get_pending(&self, transaction_id: &str) -> Result<Option<ConfirmationInfo>> {
        self.read(|state| {
            state
                .pending_confirmations
                .iter()
                .find(|confirmation| confirmation.transaction_id == transaction_id)
                .cloned()
        })
    }

    async fn put_pending(&self, confirmation: ConfirmationInfo) -> Result<()> {
        self.mutate(|state| {
            match state
                .pending_confirmations
                .iter_mut()
                .find(|pending| pending.transaction_id == confirmation.transaction_id)
            {
                Some(pending) => *pending = confirmation,
                None => state.pending_confirmations.push(confirmation),
            }
        })
    }

    async fn remove_pending(&self, transaction_id: &str) -> Result<bool> {
        self.mutate(|state| {
            let before = state.pending_confirmations.len();
            state
                .pending_confirmations
                .retain(|confirmation| confirmation.transaction_id != transaction_id);
            before != state.pending_confirmations.len()
        })
    }

    async fn pending_count(&self) -> Result<usize> {
        self.read(|state| state.pending_confirmations.len())
    }
}

#[async_trait]
impl RedemptionScheduleStore for ConfirmationsStateStore {
    async fn next_token_redemption_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.read(|state| state.next_token_redemption_at)
    }

    async fn set_next_token_redemption_at(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        self.mutate(|state| state.next_token_redemption_at = at)
    }
}
