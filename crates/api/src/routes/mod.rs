//! HTTP routes

pub mod activity;
pub mod admin;
pub mod connect;
pub mod dashboard;
pub mod health;
pub mod merchants;
pub mod tasks;
pub mod templates;
pub mod tracking;
pub mod webhooks;
pub mod worker_admin;

use axum::routing::{delete, get, patch, post};
use axum::{middleware, Router};

use crate::auth;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    // Merchant-facing surface; every handler sees a provisioned merchant.
    let authed = Router::new()
        .route("/dashboard", get(dashboard::get_dashboard))
        .route("/tasks", get(tasks::list_tasks).post(tasks::create_task))
        // Static segment takes precedence over the /tasks/:id matcher.
        .route("/tasks/completed", delete(tasks::delete_completed))
        .route("/tasks/:id", get(tasks::get_task).delete(tasks::delete_task))
        .route("/tasks/:id/retry", post(tasks::retry_task))
        .route("/merchants/:id", patch(merchants::update_merchant))
        .route("/email-templates", post(templates::upsert_template))
        .route("/activity", get(activity::list_activity))
        .route("/pp/connect/authorize", post(connect::authorize))
        .route("/pp/connect/callback", get(connect::callback))
        .route("/pp/disconnect", post(connect::disconnect))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::merchant_auth,
        ));

    let worker = Router::new()
        .route("/worker/claim", post(worker_admin::claim))
        .route("/worker/complete/:id", post(worker_admin::complete))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::worker_auth,
        ));

    let admin = Router::new()
        .route("/admin/merchants/:id", delete(admin::erase_merchant))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::admin_auth,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/pp", post(webhooks::receive))
        .route("/track/open/:log_id", get(tracking::open_pixel))
        .route("/track/click", get(tracking::click))
        .merge(authed)
        .merge(worker)
        .merge(admin)
        .with_state(state)
}
