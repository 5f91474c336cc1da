//! POS checkout, refunds and daily sales.

use crate::{
    api::{DayQuery, auth::AuthStaff, local_today},
    core::{
        order::{self, DailySales, NewOrder, OrderWithItems, RefundKind},
        permissions::Permission,
    },
    entities::{OrderItemModel, OrderModel},
    errors::Result,
    state::AppState,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/orders", get(list).post(create))
        .route("/api/orders/daily-sales", get(daily_sales))
        .route("/api/orders/{id}", get(show))
        .route("/api/orders/{id}/refund", post(refund))
        .route("/api/orders/items/{item_id}/restock", post(restock))
}

/// POST /api/orders - checkout; the cashier is the default staff member
async fn create(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(mut input): Json<NewOrder>,
) -> Result<(StatusCode, Json<OrderWithItems>)> {
    auth.require(Permission::UsePos)?;
    input.staff_id = input.staff_id.or(Some(auth.staff.id));
    let created = order::create_order(&state.db, input).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/orders?date= - orders created on a local date, default today
async fn list(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(query): Query<DayQuery>,
) -> Result<Json<Vec<OrderModel>>> {
    auth.require(Permission::UsePos)?;
    let settings = state.settings.current().await;
    let date = query.date.unwrap_or_else(|| local_today(&settings));
    Ok(Json(order::list_orders_for_day(&state.db, date, settings.timezone).await?))
}

/// GET /api/orders/{id}
async fn show(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<OrderWithItems>> {
    auth.require(Permission::UsePos)?;
    Ok(Json(order::get_order_with_items(&state.db, id).await?))
}

#[derive(Debug, Deserialize)]
struct RefundRequest {
    kind: RefundKind,
}

/// POST /api/orders/{id}/refund
async fn refund(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(request): Json<RefundRequest>,
) -> Result<Json<OrderModel>> {
    auth.require(Permission::RefundOrders)?;
    Ok(Json(order::refund_order(&state.db, id, request.kind).await?))
}

/// POST /api/orders/items/{item_id}/restock
async fn restock(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(item_id): Path<i64>,
) -> Result<Json<OrderItemModel>> {
    auth.require(Permission::RefundOrders)?;
    Ok(Json(order::restock_item(&state.db, item_id).await?))
}

/// GET /api/orders/daily-sales?date=
async fn daily_sales(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(query): Query<DayQuery>,
) -> Result<Json<DailySales>> {
    auth.require(Permission::ViewReports)?;
    let settings = state.settings.current().await;
    let date = query.date.unwrap_or_else(|| local_today(&settings));
    Ok(Json(order::daily_sales(&state.db, date, settings.timezone).await?))
}
