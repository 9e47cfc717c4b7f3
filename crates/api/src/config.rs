//! Server configuration

use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Production,
    Development,
}

impl AppEnv {
    fn from_env() -> Self {
        match std::env::var("APP_ENV").as_deref() {
            Ok("production") => AppEnv::Production,
            _ => AppEnv::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == AppEnv::Production
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub app_env: AppEnv,
    /// Shared secret for the external-worker admin endpoints.
    pub worker_secret: String,
    /// Shared secret for the GDPR-erasure endpoint.
    pub admin_key: String,
    /// HMAC key for tracking-link signatures.
    pub session_secret: String,
    /// 64 hex chars; token encryption key. Absent only in development.
    pub encryption_key: Option<String>,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let app_env = AppEnv::from_env();

        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let worker_secret = std::env::var("WORKER_SECRET").unwrap_or_default();
        let admin_key = std::env::var("ADMIN_KEY").unwrap_or_default();
        let session_secret = std::env::var("SESSION_SECRET").unwrap_or_default();
        let encryption_key = std::env::var("ENCRYPTION_KEY").ok().filter(|k| !k.is_empty());

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if app_env.is_production() {
            // Fail fast on anything that silently weakens auth or crypto.
            for (name, value) in [
                ("WORKER_SECRET", &worker_secret),
                ("ADMIN_KEY", &admin_key),
                ("SESSION_SECRET", &session_secret),
            ] {
                anyhow::ensure!(!value.is_empty(), "{name} must be set in production");
            }
            anyhow::ensure!(
                encryption_key.is_some(),
                "ENCRYPTION_KEY must be set in production"
            );
            anyhow::ensure!(
                std::env::var("PP_WEBHOOK_SECRET")
                    .map(|v| !v.is_empty())
                    .unwrap_or(false),
                "PP_WEBHOOK_SECRET must be set in production"
            );
        }

        Ok(Self {
            database_url,
            bind_address,
            app_env,
            worker_secret,
            admin_key,
            session_secret,
            encryption_key,
            allowed_origins,
        })
    }
}
