//! In-memory fixed-window rate limiter
//!
//! Per-key minute windows kept in process memory. Used for the webhook
//! per-IP limit; webhook delivery retries on 429 so a lost window after a
//! restart only costs one redelivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests left in the current window when allowed.
    pub remaining: u32,
    /// Seconds until the window resets; set when the request was rejected.
    pub retry_after_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: u64,
    count: u32,
}

/// Fixed one-minute windows keyed by caller-supplied strings (IPs here).
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
}

const WINDOW_SECONDS: u64 = 60;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RateLimiter {
    pub fn new_in_memory() -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Count one request against `key`, allowing at most `limit` per minute.
    pub async fn check(&self, key: &str, limit: u32) -> RateLimitResult {
        let now = unix_now();
        let mut windows = self.windows.lock().await;

        let window = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now.saturating_sub(window.started_at) >= WINDOW_SECONDS {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= limit {
            let reset_in = WINDOW_SECONDS.saturating_sub(now - window.started_at);
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after_seconds: Some(reset_in.max(1)),
            };
        }

        window.count += 1;
        RateLimitResult {
            allowed: true,
            remaining: limit - window.count,
            retry_after_seconds: None,
        }
    }

    /// Drop expired windows. Owners must run this on a timer: keys come from
    /// caller-supplied addresses, so without eviction the map grows without
    /// bound.
    pub async fn cleanup(&self) {
        let now = unix_now();
        let mut windows = self.windows.lock().await;
        windows.retain(|_, w| now.saturating_sub(w.started_at) < WINDOW_SECONDS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_request_allowed_with_remaining() {
        let limiter = RateLimiter::new_in_memory();
        let result = limiter.check("203.0.113.7", 5).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn request_over_limit_rejected() {
        let limiter = RateLimiter::new_in_memory();
        for i in 0..5 {
            let result = limiter.check("203.0.113.7", 5).await;
            assert!(result.allowed, "request {} should be allowed", i);
        }

        let result = limiter.check("203.0.113.7", 5).await;
        assert!(!result.allowed, "6th request should be rejected");
        assert!(result.retry_after_seconds.is_some());
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let limiter = RateLimiter::new_in_memory();
        for _ in 0..5 {
            limiter.check("203.0.113.7", 5).await;
        }

        assert!(!limiter.check("203.0.113.7", 5).await.allowed);
        assert!(limiter.check("198.51.100.9", 5).await.allowed);
    }

    #[tokio::test]
    async fn concurrent_checks_respect_limit() {
        use tokio::sync::Barrier;

        let limiter = Arc::new(RateLimiter::new_in_memory());
        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                limiter.check("203.0.113.7", 5).await
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5, "exactly the limit should pass");
    }

    #[tokio::test]
    async fn cleanup_keeps_live_windows() {
        let limiter = RateLimiter::new_in_memory();
        for _ in 0..3 {
            limiter.check("203.0.113.7", 5).await;
        }
        limiter.cleanup().await;

        // Window is still live, so the count carries over.
        let result = limiter.check("203.0.113.7", 5).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
    }
}
