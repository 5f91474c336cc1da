//! Time clock routes.
//!
//! Staff clock themselves in and out with `track_own_time`; acting for someone else, listing
//! everybody's entries and corrections need `manage_time_entries`.

use crate::{
    api::{RangeQuery, auth::AuthStaff},
    core::{
        permissions::Permission,
        time_tracking::{self, ClockState, EntryCorrection, TimesheetRow},
    },
    entities::TimeEntryModel,
    errors::Result,
    state::AppState,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, patch, post},
};
use chrono::Utc;
use serde::Deserialize;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/time/state", get(state_of))
        .route("/api/time/clock-in", post(clock_in))
        .route("/api/time/clock-out", post(clock_out))
        .route("/api/time/break/start", post(start_break))
        .route("/api/time/break/end", post(end_break))
        .route("/api/time/entries", get(entries))
        .route("/api/time/entries/{id}", patch(correct))
        .route("/api/time/timesheet", get(timesheet))
}

/// Optional `staff_id`; absent means the caller
#[derive(Debug, Default, Deserialize)]
struct StaffTarget {
    staff_id: Option<i64>,
}

/// Whose clock a request acts on, after the permission check.
fn target_staff(auth: &AuthStaff, staff_id: Option<i64>) -> Result<i64> {
    let id = staff_id.unwrap_or(auth.staff.id);
    if id == auth.staff.id {
        auth.require(Permission::TrackOwnTime)?;
    } else {
        auth.require(Permission::ManageTimeEntries)?;
    }
    Ok(id)
}

/// GET /api/time/state?staff_id=
async fn state_of(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(target): Query<StaffTarget>,
) -> Result<Json<ClockState>> {
    let staff_id = target_staff(&auth, target.staff_id)?;
    Ok(Json(time_tracking::current_state(&state.db, staff_id).await?))
}

/// POST /api/time/clock-in
async fn clock_in(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(target): Json<StaffTarget>,
) -> Result<Json<TimeEntryModel>> {
    let staff_id = target_staff(&auth, target.staff_id)?;
    Ok(Json(time_tracking::clock_in(&state.db, staff_id, Utc::now()).await?))
}

/// POST /api/time/clock-out
async fn clock_out(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(target): Json<StaffTarget>,
) -> Result<Json<TimeEntryModel>> {
    let staff_id = target_staff(&auth, target.staff_id)?;
    let settings = state.settings.current().await;
    let entry = time_tracking::clock_out(
        &state.db,
        staff_id,
        Utc::now(),
        settings.overtime_policy,
        settings.timezone,
    )
    .await?;
    Ok(Json(entry))
}

/// POST /api/time/break/start
async fn start_break(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(target): Json<StaffTarget>,
) -> Result<Json<TimeEntryModel>> {
    let staff_id = target_staff(&auth, target.staff_id)?;
    Ok(Json(time_tracking::start_break(&state.db, staff_id, Utc::now()).await?))
}

/// POST /api/time/break/end
async fn end_break(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(target): Json<StaffTarget>,
) -> Result<Json<TimeEntryModel>> {
    let staff_id = target_staff(&auth, target.staff_id)?;
    Ok(Json(time_tracking::end_break(&state.db, staff_id, Utc::now()).await?))
}

/// Own entries only, unless the caller may see everybody's.
fn visible_staff(auth: &AuthStaff, staff_id: Option<i64>) -> Result<Option<i64>> {
    match staff_id {
        Some(id) => target_staff(auth, Some(id)).map(Some),
        None if auth.require(Permission::ManageTimeEntries).is_ok() => Ok(None),
        None => target_staff(auth, None).map(Some),
    }
}

/// GET /api/time/entries?from=&to=&staff_id=
async fn entries(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<TimeEntryModel>>> {
    let staff_id = visible_staff(&auth, range.staff_id)?;
    let settings = state.settings.current().await;
    let entries =
        time_tracking::list_entries(&state.db, staff_id, range.from, range.to, settings.timezone).await?;
    Ok(Json(entries))
}

/// PATCH /api/time/entries/{id}
async fn correct(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(correction): Json<EntryCorrection>,
) -> Result<Json<TimeEntryModel>> {
    auth.require(Permission::ManageTimeEntries)?;
    let settings = state.settings.current().await;
    let entry = time_tracking::correct_entry(
        &state.db,
        id,
        correction,
        settings.overtime_policy,
        settings.timezone,
    )
    .await?;
    tracing::info!(entry_id = id, corrected_by = auth.staff.id, "Time entry corrected via API");
    Ok(Json(entry))
}

/// GET /api/time/timesheet?from=&to=&staff_id=
async fn timesheet(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<TimesheetRow>>> {
    let staff_id = visible_staff(&auth, range.staff_id)?;
    let settings = state.settings.current().await;
    let rows =
        time_tracking::timesheet(&state.db, staff_id, range.from, range.to, settings.timezone).await?;
    Ok(Json(rows))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{
        api,
        entities::StaffRole,
        test_utils::{api_request, create_test_session, response_json, setup_test_state},
    };
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_clock_cycle_for_self() -> Result<()> {
        let state = setup_test_state().await?;
        let (_, barber) = create_test_session(&state, "Ola", StaffRole::Barber).await?;
        let app = api::router(state);

        let clocked_in = app
            .clone()
            .oneshot(api_request("POST", "/api/time/clock-in", Some(&barber), Some(json!({}))))
            .await
            .unwrap();
        assert_eq!(clocked_in.status(), StatusCode::OK);

        let twice = app
            .clone()
            .oneshot(api_request("POST", "/api/time/clock-in", Some(&barber), Some(json!({}))))
            .await
            .unwrap();
        assert_eq!(twice.status(), StatusCode::BAD_REQUEST);

        let on_break = app
            .clone()
            .oneshot(api_request("POST", "/api/time/break/start", Some(&barber), Some(json!({}))))
            .await
            .unwrap();
        assert_eq!(on_break.status(), StatusCode::OK);

        let current = app
            .clone()
            .oneshot(api_request("GET", "/api/time/state", Some(&barber), None))
            .await
            .unwrap();
        assert_eq!(response_json(current).await["state"], "on_break");

        app.clone()
            .oneshot(api_request("POST", "/api/time/break/end", Some(&barber), Some(json!({}))))
            .await
            .unwrap();
        let out = app
            .oneshot(api_request("POST", "/api/time/clock-out", Some(&barber), Some(json!({}))))
            .await
            .unwrap();
        let entry = response_json(out).await;
        assert!(entry["clock_out"].is_string());
        assert_eq!(entry["work_minutes"], 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_clocking_others_needs_manage_time_entries() -> Result<()> {
        let state = setup_test_state().await?;
        let (ola, _) = create_test_session(&state, "Ola", StaffRole::Barber).await?;
        let (_, kari) = create_test_session(&state, "Kari", StaffRole::Cashier).await?;
        let (_, manager) = create_test_session(&state, "Mona", StaffRole::Manager).await?;
        let app = api::router(state);
        let body = json!({ "staff_id": ola.id });

        let denied = app
            .clone()
            .oneshot(api_request("POST", "/api/time/clock-in", Some(&kari), Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let allowed = app
            .clone()
            .oneshot(api_request("POST", "/api/time/clock-in", Some(&manager), Some(body)))
            .await
            .unwrap();
        assert_eq!(response_json(allowed).await["staff_id"], ola.id);

        let everybody = app
            .oneshot(api_request(
                "GET",
                "/api/time/entries?from=2000-01-01&to=2100-01-01",
                Some(&kari),
                None,
            ))
            .await
            .unwrap();
        // A cashier only sees their own (empty) list
        assert_eq!(response_json(everybody).await, json!([]));
        Ok(())
    }
}
