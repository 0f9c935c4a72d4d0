//! Ad Rewards Demo CLI
//!
//! Runs the anonymous confirmation token lifecycle against an in-process issuer.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod ui;

#[derive(Parser)]
#[command(name = "adrewards-demo")]
#[command(about = "Ad Rewards Demo CLI - Simulate anonymous ad confirmations and payouts", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON file with confirmation engine settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State file for tokens and queued confirmations (in memory if omitted)
    #[arg(long, global = true)]
    state: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Refill tokens, confirm ad events and redeem the earned payment tokens
    Simulate {
        /// Number of ad events to confirm
        #[arg(short = 'n', long, default_value = "10")]
        confirmations: usize,

        /// Make every K-th confirmation hit a server error first
        #[arg(long)]
        fail_every: Option<usize>,

        /// Leave payment tokens unredeemed
        #[arg(long)]
        skip_payout: bool,
    },

    /// Show token and queue counts from a state file
    Status,

    /// Sign a token batch, verify its proof and show a forged proof being rejected
    VerifyProof {
        /// Number of tokens in the batch
        #[arg(short, long, default_value = "5")]
        batch: usize,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "adrewards_demo_cli=debug,adrewards_confirmations=debug,adrewards_privacy=debug"
    } else {
        "adrewards_demo_cli=info,adrewards_confirmations=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            confirmations,
            fail_every,
            skip_payout,
        } => {
            let options = commands::simulate::SimulateOptions {
                confirmations,
                fail_every,
                skip_payout,
            };
            commands::simulate::run(config, cli.state.as_deref(), options, cli.verbose).await?;
        }
        Commands::Status => {
            commands::status::run(cli.state.as_deref(), cli.verbose).await?;
        }
        Commands::VerifyProof { batch } => {
            commands::verify_proof::run(batch, cli.verbose)?;
        }
    }

    Ok(())
}
