//! # Connector Sync Engine Entry Point
//!
//! Loads configuration, applies migrations and runs the scheduler, token refresh
//! sweep, sync executor and HTTP server until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use connector_sync::{
    backoff::RetryPolicy,
    clock::{SharedClock, SystemClock},
    config::ConfigLoader,
    connectors::Registry,
    crypto::CryptoKey,
    db,
    repositories::{ConnectionRepository, SyncJobRepository},
    scheduler::SyncScheduler,
    server::{AppState, run_server},
    sync_executor::SyncExecutor,
    telemetry,
    token_refresh::TokenRefreshService,
    webhook_verification::WebhookVerifier,
};

#[derive(Debug, Parser)]
#[command(name = "connector-sync", version, about = "Connector sync scheduling engine")]
struct Cli {
    /// Apply migrations and exit
    #[arg(long, conflicts_with = "skip_migrations")]
    migrate_only: bool,
    /// Start without applying migrations
    #[arg(long)]
    skip_migrations: bool,
    /// Do not start background workers (HTTP only)
    #[arg(long)]
    no_workers: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;
    telemetry::init_tracing(&config).context("failed to initialise tracing")?;

    tracing::info!(profile = %config.profile, "loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "effective configuration");
    }

    let db = db::init_pool(&config).await?;
    if !cli.skip_migrations {
        db::migrate(&db).await?;
        tracing::info!("database migrations applied");
    }
    if cli.migrate_only {
        return Ok(());
    }

    let crypto_key = config
        .crypto_key
        .clone()
        .context("CONNECTOR_SYNC_CRYPTO_KEY must be set")
        .and_then(|bytes| CryptoKey::new(bytes).context("invalid crypto key"))?;

    let clock: SharedClock = Arc::new(SystemClock);
    let registry = Arc::new(Registry::with_builtin(&config));
    let connections = ConnectionRepository::new(db.clone(), crypto_key);
    let jobs = SyncJobRepository::new(db.clone());
    let shutdown = CancellationToken::new();

    let refresh = Arc::new(TokenRefreshService::new(
        config.token_refresh.clone(),
        connections.clone(),
        registry.clone(),
        clock.clone(),
    ));
    let scheduler = Arc::new(SyncScheduler::new(
        config.scheduler.clone(),
        db.clone(),
        clock.clone(),
    ));
    let executor = Arc::new(SyncExecutor::new(
        config.executor.clone(),
        jobs.clone(),
        refresh.clone(),
        registry.clone(),
        RetryPolicy::new(config.rate_limit_policy.clone()),
        clock.clone(),
    ));

    let mut workers = tokio::task::JoinSet::new();
    if cli.no_workers {
        tracing::warn!("background workers disabled");
    } else {
        workers.spawn(scheduler.run(shutdown.clone()));
        workers.spawn(refresh.run(shutdown.clone()));
        workers.spawn(executor.run(shutdown.clone()));
    }

    let state = AppState {
        verifier: WebhookVerifier::from_config(&config, clock.clone()),
        config: Arc::new(config),
        db,
        registry,
        jobs,
        connections,
        clock,
    };

    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), shutdown.clone()));

    let served = run_server(state, shutdown.clone()).await;
    shutdown.cancel();
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "background worker panicked");
        }
    }
    served
}

/// Cancels `shutdown` once `signal` resolves. A listener that fails to register
/// leaves the process running; shutdown then comes from the server exiting.
async fn cancel_on_signal<F>(signal: F, shutdown: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(err) = signal.await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::ready;
    use std::io;

    #[tokio::test]
    async fn failed_signal_listener_does_not_cancel() {
        let shutdown = CancellationToken::new();
        cancel_on_signal(ready(Err(io::Error::other("no handler"))), shutdown.clone()).await;
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn received_signal_cancels() {
        let shutdown = CancellationToken::new();
        cancel_on_signal(ready(Ok(())), shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }
}
