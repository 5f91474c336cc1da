//! Fiken accounting routes: manual sync, verification, logs and lookups for setup.

use crate::{
    api::{DayQuery, ListQuery, auth::AuthStaff, local_today},
    core::{
        fiken::{self, FikenApi, SyncOutcome, TotalsCheck},
        order,
        permissions::Permission,
        settings::SalonSettings,
    },
    entities::{FikenSaleAttemptModel, FikenSyncLogModel, SyncType},
    errors::{Error, Result},
    integrations::fiken::{FikenAccount, FikenClient, FikenCompany},
    state::AppState,
    tasks,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use chrono::NaiveDate;
use serde::Deserialize;

const DEFAULT_LOG_LIMIT: u64 = 30;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/fiken/sync", post(sync_day))
        .route("/api/fiken/verify", get(verify))
        .route("/api/fiken/logs", get(logs))
        .route("/api/fiken/orders/{id}", get(attempt))
        .route("/api/fiken/orders/{id}/sync", post(sync_order))
        .route("/api/fiken/companies", get(companies))
        .route("/api/fiken/accounts", get(accounts))
}

fn configured_client(state: &AppState, settings: &SalonSettings) -> Result<FikenClient> {
    state
        .fiken_client(settings)
        .ok_or_else(|| Error::bad_request("Fiken is not enabled or is missing credentials"))
}

#[derive(Debug, Default, Deserialize)]
struct SyncRequest {
    date: Option<NaiveDate>,
}

/// POST /api/fiken/sync - manual run for a date, default today; 409 while another run is busy
async fn sync_day(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncOutcome>> {
    auth.require(Permission::ManageIntegrations)?;
    let date = match request.date {
        Some(date) => date,
        None => local_today(&*state.settings.current().await),
    };
    tracing::info!(%date, staff_id = auth.staff.id, "Manual Fiken sync requested");
    Ok(Json(tasks::run_fiken_sync(&state, date, SyncType::Manual).await?))
}

/// GET /api/fiken/verify?date= - local vs Fiken totals
async fn verify(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(query): Query<DayQuery>,
) -> Result<Json<TotalsCheck>> {
    auth.require(Permission::ManageIntegrations)?;
    let settings = state.settings.current().await;
    let client = configured_client(&state, &settings)?;
    let date = query.date.unwrap_or_else(|| local_today(&settings));
    Ok(Json(fiken::verify_day(&state.db, &client, date, settings.timezone).await?))
}

/// GET /api/fiken/logs?limit=
async fn logs(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<FikenSyncLogModel>>> {
    auth.require(Permission::ManageIntegrations)?;
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(500);
    Ok(Json(fiken::list_sync_logs(&state.db, limit).await?))
}

/// GET /api/fiken/orders/{id} - where the order's sale stands in Fiken
async fn attempt(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<FikenSaleAttemptModel>> {
    auth.require(Permission::ManageIntegrations)?;
    fiken::get_attempt(&state.db, id)
        .await?
        .map(Json)
        .ok_or_else(|| Error::not_found("FikenSaleAttempt", id))
}

/// POST /api/fiken/orders/{id}/sync - pushes or resumes one order
async fn sync_order(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<FikenSaleAttemptModel>> {
    auth.require(Permission::ManageIntegrations)?;
    let settings = state.settings.current().await;
    let client = configured_client(&state, &settings)?;
    let found = order::get_order(&state.db, id)
        .await?
        .ok_or_else(|| Error::not_found("Order", id))?;
    let sale_date = found.created_at.with_timezone(&settings.timezone).date_naive();

    let attempt = fiken::sync_order_to_fiken(
        &state.db,
        &client as &dyn FikenApi,
        id,
        sale_date,
        &settings.fiken.payment_account,
    )
    .await?;
    Ok(Json(attempt))
}

/// GET /api/fiken/companies - companies the token can access
async fn companies(State(state): State<AppState>, auth: AuthStaff) -> Result<Json<Vec<FikenCompany>>> {
    auth.require(Permission::ManageIntegrations)?;
    let settings = state.settings.current().await;
    let token = settings
        .fiken
        .api_token
        .clone()
        .ok_or_else(|| Error::bad_request("Fiken API token is not set"))?;
    // The company slug is not known yet while setting up
    let client = FikenClient::new(state.http.clone(), token, String::new());
    Ok(Json(client.companies().await?))
}

/// GET /api/fiken/accounts - chart of accounts, to pick the payment account
async fn accounts(State(state): State<AppState>, auth: AuthStaff) -> Result<Json<Vec<FikenAccount>>> {
    auth.require(Permission::ManageIntegrations)?;
    let settings = state.settings.current().await;
    Ok(Json(configured_client(&state, &settings)?.accounts().await?))
}
