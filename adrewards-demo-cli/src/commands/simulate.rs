//! Simulate command - run the full token lifecycle against an in-process issuer

use adrewards_confirmations::testing::{MockConfirmationsServer, Operation};
use adrewards_confirmations::{
    AdType, ConfirmationInfo, ConfirmationType, Confirmations, ConfirmationsConfig,
    ConfirmationsDelegates, EndpointError, RedeemPaymentsOutcome,
    RedeemUnblindedPaymentTokensDelegate, RedeemUnblindedTokenDelegate,
    RefillUnblindedTokensDelegate, RewardConfirmation, UnblindedPaymentToken, WalletInfo,
};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::ui;

const CONFIRMATION_TYPES: [ConfirmationType; 3] = [
    ConfirmationType::View,
    ConfirmationType::Click,
    ConfirmationType::Landed,
];

pub struct SimulateOptions {
    pub confirmations: usize,
    pub fail_every: Option<usize>,
    pub skip_payout: bool,
}

/// Counts engine notifications for the final report
#[derive(Default)]
struct SimulationDelegate {
    refills: AtomicUsize,
    refill_failures: AtomicUsize,
    redeemed: AtomicUsize,
    retried: AtomicUsize,
    discarded: AtomicUsize,
    paid_out: AtomicUsize,
}

impl RefillUnblindedTokensDelegate for SimulationDelegate {
    fn on_did_refill_unblinded_tokens(&self) {
        self.refills.fetch_add(1, Ordering::Relaxed);
    }

    fn on_failed_to_refill_unblinded_tokens(&self, _should_retry: bool) {
        self.refill_failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl RedeemUnblindedTokenDelegate for SimulationDelegate {
    fn on_did_redeem_unblinded_token(
        &self,
        confirmation: &ConfirmationInfo,
        _payment_token: &UnblindedPaymentToken,
    ) {
        tracing::debug!(
            confirmation_id = %confirmation.id,
            confirmation_type = %confirmation.confirmation_type,
            "Confirmation redeemed"
        );
        self.redeemed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_failed_to_redeem_unblinded_token(
        &self,
        confirmation: &ConfirmationInfo,
        should_retry: bool,
        _should_backoff: bool,
    ) {
        tracing::debug!(confirmation_id = %confirmation.id, should_retry, "Confirmation failed");
        if should_retry {
            self.retried.fetch_add(1, Ordering::Relaxed);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl RedeemUnblindedPaymentTokensDelegate for SimulationDelegate {
    fn on_did_redeem_unblinded_payment_tokens(&self, count: usize) {
        self.paid_out.fetch_add(count, Ordering::Relaxed);
    }
}

fn count(counter: &AtomicUsize) -> String {
    counter.load(Ordering::Relaxed).to_string()
}

/// Run the simulation
pub async fn run(
    config: ConfirmationsConfig,
    state: Option<&Path>,
    options: SimulateOptions,
    verbose: bool,
) -> Result<()> {
    ui::header("Ad Rewards Simulation");

    let store = super::open_store(state)?;
    let server = Arc::new(MockConfirmationsServer::new());
    let delegate = Arc::new(SimulationDelegate::default());
    let wallet = WalletInfo::generate(uuid::Uuid::new_v4().to_string());

    let confirmations = Confirmations::new(
        config,
        store,
        server.clone(),
        ConfirmationsDelegates::all(delegate.clone()),
    )
    .context("Failed to set up confirmations")?;

    let recovered = confirmations.initialize().await?;
    if recovered > 0 {
        ui::warning(&format!("Recovered {} token(s) left in flight", recovered));
    }
    confirmations
        .set_wallet(wallet)
        .context("Generated wallet was rejected")?;
    confirmations.set_catalog_issuers(server.catalog_issuers())?;

    if verbose {
        ui::key_value("Issuer key", &server.public_key().to_string());
        ui::key_value(
            "Token pool",
            &format!(
                "{}..{}",
                confirmations.config().minimum_unblinded_tokens,
                confirmations.config().maximum_unblinded_tokens
            ),
        );
    }

    confirmations.start().await?;
    ui::success(&format!(
        "Token pool ready with {} unblinded tokens",
        confirmations.unblinded_token_count().await?
    ));

    let pb = ui::progress(options.confirmations as u64, "Confirming ad events");
    for i in 1..=options.confirmations {
        if options.fail_every.is_some_and(|k| k > 0 && i % k == 0) {
            server.fail_next(
                Operation::CreateConfirmation,
                EndpointError::Status { status: 503 },
            );
        }
        let reward = RewardConfirmation::new(
            uuid::Uuid::new_v4().to_string(),
            "demo-placement",
            CONFIRMATION_TYPES[i % CONFIRMATION_TYPES.len()],
            AdType::AdNotification,
        );
        confirmations.confirm(reward).await?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    // A failure on the last event is only picked up by the next pass.
    let status = confirmations.status().await?;
    if status.queued_confirmations > 0 {
        ui::info(&format!(
            "Retrying {} queued confirmation(s) now",
            status.queued_confirmations
        ));
        confirmations.process_confirmations().await;
    }

    ui::success(&format!(
        "Confirmed {} of {} ad events",
        count(&delegate.redeemed),
        options.confirmations
    ));
    let pending = confirmations.estimated_pending_rewards().await?;
    ui::key_value("Payment tokens", &confirmations.payment_token_count().await?.to_string());
    ui::key_value("Estimated rewards", &format!("{:.2} BAT", pending));

    if options.skip_payout {
        ui::info("Skipping payout");
    } else {
        match confirmations.redeem_payment_tokens().await? {
            RedeemPaymentsOutcome::Redeemed { count } => {
                ui::success(&format!("Redeemed {} payment token(s) in one batch", count))
            }
            RedeemPaymentsOutcome::NothingToRedeem => ui::info("No payment tokens to redeem"),
            RedeemPaymentsOutcome::AlreadyProcessing => {
                ui::warning("A payout is already in progress")
            }
            RedeemPaymentsOutcome::Failed { should_retry } => ui::error(&format!(
                "Payout failed ({})",
                if should_retry { "will retry" } else { "not retrying" }
            )),
        }
    }

    let status = confirmations.status().await?;
    ui::separator();
    ui::key_value("Unblinded tokens", &status.unblinded_tokens.to_string());
    ui::key_value("Queued confirmations", &status.queued_confirmations.to_string());
    ui::key_value("Token refills", &count(&delegate.refills));
    ui::key_value("Refill failures", &count(&delegate.refill_failures));
    ui::key_value("Retried confirmations", &count(&delegate.retried));
    ui::key_value("Discarded confirmations", &count(&delegate.discarded));
    ui::key_value("Tokens paid out", &count(&delegate.paid_out));
    ui::key_value("Tokens spent at issuer", &server.spent_token_count().to_string());
    ui::key_value("Double spends", &server.double_spend_attempts().to_string());
    ui::key_value("Next payout", &ui::timestamp(status.next_token_redemption_at));

    if let Some(path) = state {
        ui::info(&format!("State saved to {}", path.display()));
    }
    Ok(())
}
