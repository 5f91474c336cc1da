//! Staff administration routes.

use crate::{
    api::{ListQuery, auth::AuthStaff},
    core::{
        permissions::Permission,
        staff::{self, NewStaff, StaffPatch},
    },
    entities::StaffModel,
    errors::{Error, Result},
    state::AppState,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
};
use serde::Deserialize;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/staff", get(list).post(create))
        .route("/api/staff/by-email", post(upsert_by_email))
        .route("/api/staff/{id}", get(show).patch(update).delete(remove))
        .route("/api/staff/{id}/pin", put(set_pin))
        .route("/api/staff/{id}/deactivate", post(deactivate))
}

/// GET /api/staff - any logged-in staff member sees the roster
async fn list(
    State(state): State<AppState>,
    _auth: AuthStaff,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<StaffModel>>> {
    Ok(Json(staff::list_staff(&state.db, query.include_inactive).await?))
}

/// POST /api/staff
async fn create(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(input): Json<NewStaff>,
) -> Result<(StatusCode, Json<StaffModel>)> {
    auth.require(Permission::ManageStaff)?;
    Ok((StatusCode::CREATED, Json(staff::create_staff(&state.db, input).await?)))
}

#[derive(Debug, Deserialize)]
struct EmailLogin {
    email: String,
    #[serde(default)]
    name: String,
}

/// POST /api/staff/by-email - account for an externally authenticated email
async fn upsert_by_email(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(input): Json<EmailLogin>,
) -> Result<Json<StaffModel>> {
    auth.require(Permission::ManageStaff)?;
    Ok(Json(staff::upsert_staff_by_email(&state.db, &input.email, &input.name).await?))
}

/// GET /api/staff/{id}
async fn show(
    State(state): State<AppState>,
    _auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<StaffModel>> {
    staff::get_staff(&state.db, id)
        .await?
        .map(Json)
        .ok_or_else(|| Error::not_found("Staff", id))
}

/// PATCH /api/staff/{id}
async fn update(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(patch): Json<StaffPatch>,
) -> Result<Json<StaffModel>> {
    auth.require(Permission::ManageStaff)?;
    let deactivating = patch.is_active == Some(false);
    let updated = staff::update_staff(&state.db, id, patch).await?;
    if deactivating {
        state.sessions.revoke_staff(id);
    }
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
struct PinChange {
    pin: String,
}

/// PUT /api/staff/{id}/pin - own PIN, or anyone's with `manage_staff`
async fn set_pin(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(change): Json<PinChange>,
) -> Result<StatusCode> {
    auth.require_self_or(id, Permission::ManageStaff)?;
    staff::set_pin(&state.db, id, &change.pin).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/staff/{id}/deactivate - also ends the member's sessions
async fn deactivate(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<StaffModel>> {
    auth.require(Permission::ManageStaff)?;
    let updated = staff::deactivate_staff(&state.db, id).await?;
    state.sessions.revoke_staff(id);
    Ok(Json(updated))
}

/// DELETE /api/staff/{id} - only members without history
async fn remove(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    auth.require(Permission::ManageStaff)?;
    if auth.staff.id == id {
        return Err(Error::bad_request("You cannot delete your own account"));
    }
    staff::delete_staff(&state.db, id).await?;
    state.sessions.revoke_staff(id);
    Ok(StatusCode::NO_CONTENT)
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
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_deactivation_ends_sessions() -> Result<()> {
        let state = setup_test_state().await?;
        let (_, owner) = create_test_session(&state, "Eva", StaffRole::Owner).await?;
        let (barber, barber_token) = create_test_session(&state, "Ola", StaffRole::Barber).await?;
        let app = api::router(state);

        let me = app
            .clone()
            .oneshot(api_request("GET", "/api/auth/me", Some(&barber_token), None))
            .await
            .unwrap();
        assert_eq!(me.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(api_request(
                "POST",
                &format!("/api/staff/{}/deactivate", barber.id),
                Some(&owner),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response_json(response).await["is_active"], false);

        let me = app
            .oneshot(api_request("GET", "/api/auth/me", Some(&barber_token), None))
            .await
            .unwrap();
        assert_eq!(me.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn test_pin_change_is_self_or_manager() -> Result<()> {
        let state = setup_test_state().await?;
        let (ola, ola_token) = create_test_session(&state, "Ola", StaffRole::Barber).await?;
        let (kari, _) = create_test_session(&state, "Kari", StaffRole::Cashier).await?;
        let app = api::router(state);

        let own = app
            .clone()
            .oneshot(api_request(
                "PUT",
                &format!("/api/staff/{}/pin", ola.id),
                Some(&ola_token),
                Some(json!({ "pin": "4821" })),
            ))
            .await
            .unwrap();
        assert_eq!(own.status(), StatusCode::NO_CONTENT);

        let other = app
            .oneshot(api_request(
                "PUT",
                &format!("/api/staff/{}/pin", kari.id),
                Some(&ola_token),
                Some(json!({ "pin": "4821" })),
            ))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::FORBIDDEN);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_requires_manage_staff() -> Result<()> {
        let state = setup_test_state().await?;
        let (_, cashier) = create_test_session(&state, "Kari", StaffRole::Cashier).await?;
        let (_, manager) = create_test_session(&state, "Mona", StaffRole::Manager).await?;
        let app = api::router(state);
        let body = json!({ "name": "Nils", "role": "barber" });

        let denied = app
            .clone()
            .oneshot(api_request("POST", "/api/staff", Some(&cashier), Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let created = app
            .oneshot(api_request("POST", "/api/staff", Some(&manager), Some(body)))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let json = response_json(created).await;
        assert_eq!(json["role"], "barber");
        assert!(json.get("pin_hash").is_none());
        Ok(())
    }
}
