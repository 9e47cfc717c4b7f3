//! Rebill Background Worker
//!
//! Standalone replica of the claim loop and janitor, for deployments that
//! scale task processing independently of the HTTP server. Any number of
//! these can run against the same store; the skip-locked claim keeps them
//! from stepping on each other.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rebill_recovery::{Janitor, RecoveryService};
use rebill_shared::TokenCipher;

fn token_cipher() -> anyhow::Result<TokenCipher> {
    match std::env::var("ENCRYPTION_KEY") {
        Ok(hex_key) if !hex_key.is_empty() => Ok(TokenCipher::from_hex(&hex_key)?),
        _ => {
            let production = std::env::var("APP_ENV").as_deref() == Ok("production");
            anyhow::ensure!(!production, "ENCRYPTION_KEY must be set in production");
            warn!("ENCRYPTION_KEY not set; using an ephemeral key");
            Ok(TokenCipher::ephemeral())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rebill_recovery=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rebill worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = rebill_shared::create_pool(&database_url).await?;

    let cipher = token_cipher()?;
    let recovery = Arc::new(RecoveryService::from_env(pool.clone(), cipher)?);

    recovery.watchdog().bootstrap().await?;

    let cancel = CancellationToken::new();

    let worker = recovery.worker();
    let worker_cancel = cancel.clone();
    let worker_handle = tokio::spawn(async move { worker.run(worker_cancel).await });

    let janitor = Janitor::new(pool, recovery.events.clone());
    let janitor_cancel = cancel.clone();
    let janitor_handle = tokio::spawn(async move { janitor.run(janitor_cancel).await });

    info!("Worker and janitor running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received; draining");

    cancel.cancel();
    let _ = worker_handle.await;
    let _ = janitor_handle.await;

    info!("Worker shutdown complete");
    Ok(())
}
