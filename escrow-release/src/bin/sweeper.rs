//! Escrow release sweeper daemon

use escrow_release::{Config, EscrowScheduler};
use payment_ledger::PaymentLedger;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting escrow release sweeper");

    // Load configuration
    let ledger_config = payment_ledger::Config::from_env()?;
    let scheduler_config = Config::from_env()?;

    // Open ledger
    let ledger = Arc::new(PaymentLedger::open(ledger_config).await?);
    tracing::info!("Payment ledger opened successfully");

    // Start scheduler
    let scheduler = Arc::new(EscrowScheduler::new(ledger, scheduler_config));
    let loop_handle = tokio::spawn(scheduler.start());

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down escrow release sweeper");
    loop_handle.abort();
    Ok(())
}
