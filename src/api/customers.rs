//! Customer (CRM) routes.

use crate::{
    api::auth::AuthStaff,
    core::{
        customer::{self, CustomerPatch, NewCustomer},
        permissions::Permission,
        scheduler,
    },
    entities::{AppointmentModel, CustomerModel, CustomerNoteModel, CustomerTag},
    errors::{Error, Result},
    state::AppState,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

const DEFAULT_SEARCH_LIMIT: u64 = 25;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/customers", get(search).post(create))
        .route("/api/customers/{id}", get(show).patch(update).delete(erase))
        .route("/api/customers/{id}/appointments", get(appointments))
        .route("/api/customers/{id}/tags", get(tags).post(add_tag))
        .route("/api/customers/{id}/tags/{tag}", delete(remove_tag))
        .route("/api/customers/{id}/notes", get(notes).post(add_note))
        .route("/api/customers/{id}/merge", post(merge))
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    limit: Option<u64>,
}

/// GET /api/customers?q=&limit=
async fn search(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<CustomerModel>>> {
    auth.require(Permission::ViewCustomers)?;
    let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).min(200);
    Ok(Json(customer::search_customers(&state.db, &query.q, limit).await?))
}

/// POST /api/customers
async fn create(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(input): Json<NewCustomer>,
) -> Result<(StatusCode, Json<CustomerModel>)> {
    auth.require(Permission::ManageCustomers)?;
    let created = customer::create_customer(&state.db, input).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Serialize)]
struct CustomerDetail {
    #[serde(flatten)]
    customer: CustomerModel,
    tags: Vec<CustomerTag>,
}

/// GET /api/customers/{id}
async fn show(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<CustomerDetail>> {
    auth.require(Permission::ViewCustomers)?;
    let found = customer::get_customer(&state.db, id)
        .await?
        .ok_or_else(|| Error::not_found("Customer", id))?;
    let tags = customer::list_tags(&state.db, id).await?;
    Ok(Json(CustomerDetail { customer: found, tags }))
}

/// PATCH /api/customers/{id}
async fn update(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(patch): Json<CustomerPatch>,
) -> Result<Json<CustomerModel>> {
    auth.require(Permission::ManageCustomers)?;
    Ok(Json(customer::update_customer(&state.db, id, patch).await?))
}

/// DELETE /api/customers/{id} - GDPR erase
async fn erase(State(state): State<AppState>, auth: AuthStaff, Path(id): Path<i64>) -> Result<StatusCode> {
    auth.require(Permission::DeleteCustomers)?;
    customer::erase_customer(&state.db, id).await?;
    tracing::info!(customer_id = id, staff_id = auth.staff.id, "Customer erased");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/customers/{id}/appointments
async fn appointments(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<Vec<AppointmentModel>>> {
    auth.require(Permission::ViewAppointments)?;
    Ok(Json(scheduler::list_for_customer(&state.db, id).await?))
}

/// GET /api/customers/{id}/tags
async fn tags(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<Vec<CustomerTag>>> {
    auth.require(Permission::ViewCustomers)?;
    Ok(Json(customer::list_tags(&state.db, id).await?))
}

#[derive(Debug, Deserialize)]
struct TagRequest {
    tag: CustomerTag,
}

/// POST /api/customers/{id}/tags - 201 when added, 200 when already present
async fn add_tag(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(request): Json<TagRequest>,
) -> Result<(StatusCode, Json<Vec<CustomerTag>>)> {
    auth.require(Permission::ManageCustomers)?;
    let added = customer::add_tag(&state.db, id, request.tag).await?;
    let status = if added.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(customer::list_tags(&state.db, id).await?)))
}

/// DELETE /api/customers/{id}/tags/{tag}
async fn remove_tag(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path((id, tag)): Path<(i64, CustomerTag)>,
) -> Result<StatusCode> {
    auth.require(Permission::ManageCustomers)?;
    if customer::remove_tag(&state.db, id, tag).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::not_found("CustomerTag", format!("{id}/{tag:?}")))
    }
}

/// GET /api/customers/{id}/notes
async fn notes(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<Vec<CustomerNoteModel>>> {
    auth.require(Permission::ViewCustomers)?;
    Ok(Json(customer::list_notes(&state.db, id).await?))
}

#[derive(Debug, Deserialize)]
struct NoteRequest {
    body: String,
}

/// POST /api/customers/{id}/notes
async fn add_note(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(request): Json<NoteRequest>,
) -> Result<(StatusCode, Json<CustomerNoteModel>)> {
    auth.require(Permission::ManageCustomers)?;
    let note = customer::add_note(&state.db, id, Some(auth.staff.id), &request.body).await?;
    Ok((StatusCode::CREATED, Json(note)))
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    /// Customer folded into the one in the path, then deleted
    merged_id: i64,
}

/// POST /api/customers/{id}/merge
async fn merge(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<CustomerModel>> {
    auth.require(Permission::DeleteCustomers)?;
    Ok(Json(customer::merge_customers(&state.db, id, request.merged_id).await?))
}
