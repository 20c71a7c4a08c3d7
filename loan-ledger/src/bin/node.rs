//! Loan ledger node binary
//!
//! Usage: `loan-ledger-node [config.toml]`. Without a path the
//! configuration is read from `LOAN_LEDGER_*` environment variables;
//! `LOAN_LEDGER_GENESIS=alice=100,bob=50` seeds a fresh data directory.

use anyhow::Context;
use loan_ledger::{Config, LoanLedger};
use std::time::Duration;
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => Config::from_env().context("Failed to load config from environment")?,
    };

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if config.log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting loan ledger node");

    let log_interval = config.metrics.log_interval_secs;
    let ledger = LoanLedger::open(config).await?;
    tracing::info!("Ledger opened successfully");

    let events = ledger.event_stream();
    let event_log = tokio::spawn(async move {
        tokio::pin!(events);
        while let Some(record) = events.next().await {
            match serde_json::to_string(&record) {
                Ok(json) => tracing::info!(target: "loan_ledger::events", "{}", json),
                Err(e) => tracing::warn!("Failed to encode event {}: {}", record.sequence, e),
            }
        }
    });

    let metrics_log = (log_interval > 0).then(|| {
        let metrics = ledger.metrics().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(log_interval));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match metrics.encode_text() {
                    Ok(text) => tracing::info!(target: "loan_ledger::metrics", "\n{}", text),
                    Err(e) => tracing::warn!("Failed to encode metrics: {}", e),
                }
            }
        })
    });

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down loan ledger node");
    event_log.abort();
    if let Some(task) = metrics_log {
        task.abort();
    }
    ledger.shutdown().await?;
    Ok(())
}
