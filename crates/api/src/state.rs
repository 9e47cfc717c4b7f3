//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use rebill_recovery::RecoveryService;
use rebill_shared::RateLimiter;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub recovery: Arc<RecoveryService>,
    /// Per-IP throttle for the webhook ingress.
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, recovery: Arc<RecoveryService>) -> Self {
        let rate_limiter = RateLimiter::new_in_memory();

        // The webhook ingress keys this limiter by caller-supplied addresses,
        // so expired windows must be evicted or the map grows without bound.
        let limiter_for_cleanup = rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                interval.tick().await;
                limiter_for_cleanup.cleanup().await;
            }
        });

        Self {
            pool,
            config,
            recovery,
            rate_limiter,
        }
    }
}
