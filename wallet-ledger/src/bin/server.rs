//! Wallet ledger daemon
//!
//! Opens the ledger, keeps partitions provisioned and waits for Ctrl-C.
//! Usage: `wallet-ledgerd [config.toml]`; without a path the configuration
//! comes from `LEDGER_*` environment variables. Records are signed when
//! `signing.seed_hex` (or `LEDGER_SIGNING_SEED`) is set.

use anyhow::Context;
use wallet_ledger::{Config, Ledger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading config from {}", path))?,
        None => Config::from_env().context("loading config from environment")?,
    };

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "Starting wallet ledger"
    );

    // Open ledger
    let ledger = Ledger::open(config).await.context("opening ledger")?;

    for partition in ledger.partitions() {
        tracing::info!(
            partition = %partition.name,
            start = %partition.start,
            end = %partition.end,
            "Partition ready"
        );
    }

    let stats = ledger.stats()?;
    tracing::info!(
        wallets = stats.total_wallets,
        accounts = stats.total_accounts,
        partitions = stats.total_partitions,
        "Ledger ready"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down wallet ledger");
    ledger.shutdown().await?;
    Ok(())
}
