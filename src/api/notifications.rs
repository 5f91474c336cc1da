//! Owner notifications.

use crate::{
    api::auth::AuthStaff,
    core::{notification, permissions::Permission},
    entities::NotificationModel,
    errors::Result,
    state::AppState,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::Deserialize;

const DEFAULT_LIMIT: u64 = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", get(list))
        .route("/api/notifications/read-all", post(read_all))
        .route("/api/notifications/{id}/read", post(read))
}

#[derive(Debug, Default, Deserialize)]
struct NotificationQuery {
    #[serde(default)]
    unread_only: bool,
    limit: Option<u64>,
}

/// GET /api/notifications?unread_only=&limit=
async fn list(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<Vec<NotificationModel>>> {
    auth.require(Permission::ViewReports)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(500);
    Ok(Json(notification::list_notifications(&state.db, query.unread_only, limit).await?))
}

/// POST /api/notifications/{id}/read
async fn read(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<NotificationModel>> {
    auth.require(Permission::ViewReports)?;
    Ok(Json(notification::mark_read(&state.db, id).await?))
}

/// POST /api/notifications/read-all
async fn read_all(State(state): State<AppState>, auth: AuthStaff) -> Result<Json<serde_json::Value>> {
    auth.require(Permission::ViewReports)?;
    let marked = notification::mark_all_read(&state.db).await?;
    Ok(Json(serde_json::json!({ "marked": marked })))
}
