// API crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Rebill API Library
//!
//! HTTP surface of the recovery engine: merchant endpoints behind the
//! auth/provisioning middleware, secret-gated worker and admin endpoints,
//! the provider webhook ingress, and the unauthenticated tracking routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{AppEnv, Config};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
