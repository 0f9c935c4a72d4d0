//! Status command - show what a state file holds

use anyhow::{Context, Result};
use std::path::Path;

use crate::ui;

/// Print token and queue counts
pub async fn run(state: Option<&Path>, verbose: bool) -> Result<()> {
    let path = state.context("The status command needs --state FILE")?;
    if !path.exists() {
        ui::warning(&format!("No state file at {}", path.display()));
        return Ok(());
    }

    let store = super::open_store(Some(path))?;
    let snapshot = store.snapshot()?;

    ui::header("Confirmations State");
    ui::key_value("File", &path.display().to_string());
    ui::key_value("Unblinded tokens", &snapshot.unblinded_tokens.len().to_string());
    ui::key_value(
        "In flight",
        &snapshot.in_flight_unblinded_tokens.len().to_string(),
    );
    ui::key_value(
        "Payment tokens",
        &snapshot.unblinded_payment_tokens.len().to_string(),
    );
    ui::key_value(
        "Queued confirmations",
        &snapshot.confirmations_queue.len().to_string(),
    );
    ui::key_value(
        "Pending confirmations",
        &snapshot.pending_confirmations.len().to_string(),
    );
    ui::key_value("Next payout", &ui::timestamp(snapshot.next_token_redemption_at));

    if !snapshot.in_flight_unblinded_tokens.is_empty() {
        ui::warning("Tokens in flight will be returned to the pool on the next start");
    }

    if verbose && !snapshot.confirmations_queue.is_empty() {
        ui::separator();
        for item in &snapshot.confirmations_queue {
            ui::key_value(
                &item.id,
                &format!(
                    "{} {} (retries: {})",
                    item.value.ad_type.as_str(),
                    item.value.confirmation_type,
                    item.retry_count
                ),
            );
        }
    }

    Ok(())
}
