//! Service and product routes.

use crate::{
    api::{ListQuery, auth::AuthStaff},
    core::{
        catalog::{self, NewProduct, NewService, ProductPatch, ServicePatch},
        permissions::Permission,
    },
    entities::{ProductModel, ServiceModel},
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
        .route("/api/public/services", get(public_services))
        .route("/api/services", get(list_services).post(create_service))
        .route(
            "/api/services/{id}",
            axum::routing::patch(update_service).delete(deactivate_service),
        )
        .route("/api/products", get(list_products).post(create_product))
        .route(
            "/api/products/{id}",
            axum::routing::patch(update_product).delete(deactivate_product),
        )
        .route("/api/products/{id}/stock", post(adjust_stock))
}

/// GET /api/public/services - active services for the booking page
async fn public_services(State(state): State<AppState>) -> Result<Json<Vec<ServiceModel>>> {
    Ok(Json(catalog::list_services(&state.db, false).await?))
}

/// GET /api/services?include_inactive=
async fn list_services(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ServiceModel>>> {
    auth.require(Permission::ViewCatalog)?;
    Ok(Json(catalog::list_services(&state.db, query.include_inactive).await?))
}

/// POST /api/services
async fn create_service(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(input): Json<NewService>,
) -> Result<(StatusCode, Json<ServiceModel>)> {
    auth.require(Permission::ManageCatalog)?;
    Ok((StatusCode::CREATED, Json(catalog::create_service(&state.db, input).await?)))
}

/// PATCH /api/services/{id}
async fn update_service(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(patch): Json<ServicePatch>,
) -> Result<Json<ServiceModel>> {
    auth.require(Permission::ManageCatalog)?;
    Ok(Json(catalog::update_service(&state.db, id, patch).await?))
}

/// DELETE /api/services/{id} - deactivates, history keeps referring to it
async fn deactivate_service(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<ServiceModel>> {
    auth.require(Permission::ManageCatalog)?;
    Ok(Json(catalog::deactivate_service(&state.db, id).await?))
}

/// GET /api/products?include_inactive=
async fn list_products(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ProductModel>>> {
    auth.require(Permission::ViewCatalog)?;
    Ok(Json(catalog::list_products(&state.db, query.include_inactive).await?))
}

/// POST /api/products
async fn create_product(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(input): Json<NewProduct>,
) -> Result<(StatusCode, Json<ProductModel>)> {
    auth.require(Permission::ManageCatalog)?;
    Ok((StatusCode::CREATED, Json(catalog::create_product(&state.db, input).await?)))
}

/// PATCH /api/products/{id}
async fn update_product(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(patch): Json<ProductPatch>,
) -> Result<Json<ProductModel>> {
    auth.require(Permission::ManageCatalog)?;
    Ok(Json(catalog::update_product(&state.db, id, patch).await?))
}

/// DELETE /api/products/{id}
async fn deactivate_product(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<ProductModel>> {
    auth.require(Permission::ManageCatalog)?;
    Ok(Json(catalog::deactivate_product(&state.db, id).await?))
}

#[derive(Debug, Deserialize)]
struct StockAdjustment {
    delta: i32,
}

/// POST /api/products/{id}/stock - goods received (+) or written off (-)
async fn adjust_stock(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(adjustment): Json<StockAdjustment>,
) -> Result<Json<ProductModel>> {
    auth.require(Permission::ManageCatalog)?;
    let product = catalog::adjust_stock(&state.db, id, adjustment.delta).await?;
    tracing::info!(product_id = id, delta = adjustment.delta, stock = product.stock, "Stock adjusted");
    Ok(Json(product))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{
        api,
        entities::StaffRole,
        test_utils::{api_request, create_test_product, create_test_session, response_json, setup_test_state},
    };
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_stock_adjustment_and_deactivation() -> Result<()> {
        let state = setup_test_state().await?;
        let (_, manager) = create_test_session(&state, "Mona", StaffRole::Manager).await?;
        let (_, barber) = create_test_session(&state, "Ola", StaffRole::Barber).await?;
        let wax = create_test_product(&state.db, "Wax", 3).await?;
        let app = api::router(state);

        let denied = app
            .clone()
            .oneshot(api_request(
                "POST",
                &format!("/api/products/{}/stock", wax.id),
                Some(&barber),
                Some(json!({ "delta": 10 })),
            ))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let adjusted = app
            .clone()
            .oneshot(api_request(
                "POST",
                &format!("/api/products/{}/stock", wax.id),
                Some(&manager),
                Some(json!({ "delta": 10 })),
            ))
            .await
            .unwrap();
        assert_eq!(response_json(adjusted).await["stock"], 13);

        app.clone()
            .oneshot(api_request("DELETE", &format!("/api/products/{}", wax.id), Some(&manager), None))
            .await
            .unwrap();
        let listed = app
            .oneshot(api_request("GET", "/api/products", Some(&barber), None))
            .await
            .unwrap();
        assert_eq!(response_json(listed).await, json!([]));
        Ok(())
    }
}
