//! Rebill API Server
//!
//! Startup order matters: store pool, encryption key, provider client,
//! watchdog bootstrap, worker loop, janitor, then the HTTP listener. On
//! shutdown the listener closes first, in-flight worker iterations finish,
//! and only then does the process exit.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rebill_api::{create_router, AppState, Config};
use rebill_recovery::{Janitor, RecoveryService};
use rebill_shared::TokenCipher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rebill_api=debug,rebill_recovery=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Rebill API server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    tracing::info!("Connecting to database...");
    let pool = rebill_shared::create_pool(&config.database_url).await?;
    rebill_shared::run_migrations(&pool).await?;
    tracing::info!("Database ready");

    let cipher = match &config.encryption_key {
        Some(hex_key) => TokenCipher::from_hex(hex_key)?,
        None => {
            // from_env already refused this combination in production.
            tracing::warn!(
                "ENCRYPTION_KEY not set; using an ephemeral key (tokens will not survive restart)"
            );
            TokenCipher::ephemeral()
        }
    };

    let recovery = Arc::new(RecoveryService::from_env(pool.clone(), cipher)?);
    tracing::info!("Recovery service initialized");

    recovery.watchdog().bootstrap().await?;

    let cancel = CancellationToken::new();

    let worker = recovery.worker();
    let worker_cancel = cancel.clone();
    let worker_handle = tokio::spawn(async move { worker.run(worker_cancel).await });

    let janitor = Janitor::new(pool.clone(), recovery.events.clone());
    let janitor_cancel = cancel.clone();
    let janitor_handle = tokio::spawn(async move { janitor.run(janitor_cancel).await });

    let allowed_origins: Vec<axum::http::HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ]);

    let state = AppState::new(pool, config.clone(), recovery);
    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(bind_address = %config.bind_address, "HTTP listener started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Listener is closed; let the worker finish its in-flight iteration.
    tracing::info!("HTTP listener closed; draining background tasks");
    cancel.cancel();
    let _ = worker_handle.await;
    let _ = janitor_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received");
}
