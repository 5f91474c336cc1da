//! Walk-in queue routes.

use crate::{
    api::auth::AuthStaff,
    core::{
        drop_in::{self, JoinQueue},
        permissions::Permission,
    },
    entities::DropInEntryModel,
    errors::Result,
    state::AppState,
};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/public/drop-in", post(join))
        .route("/api/drop-in", get(waiting))
        .route("/api/drop-in/next", post(call_next))
        .route("/api/drop-in/{id}/finish", post(finish))
        .route("/api/drop-in/{id}/leave", post(leave))
}

/// POST /api/public/drop-in - a walk-in puts their name on the list
async fn join(
    State(state): State<AppState>,
    Json(input): Json<JoinQueue>,
) -> Result<(StatusCode, Json<DropInEntryModel>)> {
    let entry = drop_in::join_queue(&state.db, input, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// GET /api/drop-in
async fn waiting(State(state): State<AppState>, auth: AuthStaff) -> Result<Json<Vec<DropInEntryModel>>> {
    auth.require(Permission::ManageDropIn)?;
    Ok(Json(drop_in::list_waiting(&state.db).await?))
}

#[derive(Debug, Default, Deserialize)]
struct CallNext {
    /// Defaults to the caller
    staff_id: Option<i64>,
}

/// POST /api/drop-in/next - `null` when nobody is waiting for this staff member
async fn call_next(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(request): Json<CallNext>,
) -> Result<Json<Option<DropInEntryModel>>> {
    auth.require(Permission::ManageDropIn)?;
    let staff_id = request.staff_id.unwrap_or(auth.staff.id);
    Ok(Json(drop_in::call_next(&state.db, staff_id, Utc::now()).await?))
}

/// POST /api/drop-in/{id}/finish
async fn finish(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<DropInEntryModel>> {
    auth.require(Permission::ManageDropIn)?;
    Ok(Json(drop_in::finish(&state.db, id).await?))
}

/// POST /api/drop-in/{id}/leave
async fn leave(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<DropInEntryModel>> {
    auth.require(Permission::ManageDropIn)?;
    Ok(Json(drop_in::leave(&state.db, id).await?))
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
    async fn test_walk_in_flow() -> Result<()> {
        let state = setup_test_state().await?;
        let (barber, token) = create_test_session(&state, "Ola", StaffRole::Barber).await?;
        let app = api::router(state);

        let joined = app
            .clone()
            .oneshot(api_request(
                "POST",
                "/api/public/drop-in",
                None,
                Some(json!({ "customer_name": "Per" })),
            ))
            .await
            .unwrap();
        assert_eq!(joined.status(), StatusCode::CREATED);

        let called = app
            .clone()
            .oneshot(api_request("POST", "/api/drop-in/next", Some(&token), Some(json!({}))))
            .await
            .unwrap();
        let called = response_json(called).await;
        assert_eq!(called["customer_name"], "Per");
        assert_eq!(called["served_by"], barber.id);

        let empty = app
            .clone()
            .oneshot(api_request("POST", "/api/drop-in/next", Some(&token), Some(json!({}))))
            .await
            .unwrap();
        assert_eq!(response_json(empty).await, serde_json::Value::Null);

        let finished = app
            .oneshot(api_request(
                "POST",
                &format!("/api/drop-in/{}/finish", called["id"]),
                Some(&token),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response_json(finished).await["status"], "done");
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_name_is_rejected() -> Result<()> {
        let app = api::router(setup_test_state().await?);
        let response = app
            .oneshot(api_request(
                "POST",
                "/api/public/drop-in",
                None,
                Some(json!({ "customer_name": "  " })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }
}
