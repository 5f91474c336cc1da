//! JSON API over the core operations.
//!
//! Each resource module exposes `router()`; handlers declare their access level by what they
//! extract: no `AuthStaff` means public, `AuthStaff` means any logged-in staff member, and
//! `auth.require(..)` gates a permission.

pub mod appointments;
pub mod auth;
pub mod catalog;
pub mod customers;
pub mod drop_in;
pub mod fiken;
pub mod notifications;
pub mod orders;
pub mod payments;
pub mod rate_limit;
pub mod settings;
pub mod staff;
pub mod time_tracking;
pub mod webhooks;

use crate::{core::settings::SalonSettings, state::AppState};
use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Builds the application router with all routes, middleware and state.
pub fn router(state: AppState) -> Router {
    let concurrency_limit = GlobalConcurrencyLimitLayer::new(state.config.server.max_concurrent_requests.max(1));

    let webhooks = Router::new()
        .route("/api/webhooks/vipps", post(webhooks::vipps))
        .route("/api/webhooks/stripe", post(webhooks::stripe))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::webhook_rate_limit,
        ));

    let auth = Router::new()
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me));

    Router::new()
        .route("/health", get(health))
        .merge(auth)
        .merge(appointments::router())
        .merge(customers::router())
        .merge(catalog::router())
        .merge(staff::router())
        .merge(orders::router())
        .merge(payments::router())
        .merge(settings::router())
        .merge(time_tracking::router())
        .merge(fiken::router())
        .merge(drop_in::router())
        .merge(notifications::router())
        .merge(webhooks)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(concurrency_limit)
        .with_state(state)
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// Today's date on the salon's wall clock.
pub(crate) fn local_today(settings: &SalonSettings) -> NaiveDate {
    Utc::now().with_timezone(&settings.timezone).date_naive()
}

/// Current date and time on the salon's wall clock.
pub(crate) fn local_now(settings: &SalonSettings) -> NaiveDateTime {
    Utc::now().with_timezone(&settings.timezone).naive_local()
}

/// `?date=YYYY-MM-DD&staff_id=N`, both optional
#[derive(Debug, Default, Deserialize)]
pub struct DayQuery {
    pub date: Option<NaiveDate>,
    pub staff_id: Option<i64>,
}

/// `?from=YYYY-MM-DD&to=YYYY-MM-DD&staff_id=N`
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub staff_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_inactive: bool,
    pub limit: Option<u64>,
}
