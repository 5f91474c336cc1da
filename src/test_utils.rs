//! Shared test utilities.
//!
//! This module provides common helper functions for setting up test databases
//! and creating test entities with sensible defaults.

use crate::{
    config::AppConfig,
    core::{
        catalog::{self, NewProduct, NewService},
        customer::{self, NewCustomer},
        order::{self, NewOrder, NewOrderItem},
        scheduler::{self, NewAppointment},
        staff::{self, NewStaff},
    },
    entities::{
        AppointmentModel, AppointmentStatus, CustomerModel, ItemType, OrderModel, PaymentStatus,
        ProductModel, ServiceModel, SkillLevel, StaffModel, StaffRole, appointment,
    },
    errors::Result,
    state::AppState,
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};

/// Creates an in-memory `SQLite` database with all tables initialized.
/// This is the standard setup for all integration tests.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = sea_orm::Database::connect("sqlite::memory:").await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Application state over a fresh in-memory database with default config.
pub async fn setup_test_state() -> Result<AppState> {
    let db = setup_test_db().await?;
    AppState::new(db, AppConfig::default()).await
}

/// Creates a staff member with `role` and opens a session; returns the bearer token.
pub async fn create_test_session(state: &AppState, name: &str, role: StaffRole) -> Result<(StaffModel, String)> {
    let member = create_test_staff(&state.db, name, role).await?;
    let (token, _) = state.sessions.create(member.id, Utc::now());
    Ok((member, token))
}

/// Monday 7 January 2030, far enough ahead that no test date is in the past.
pub fn test_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 7).unwrap_or_default()
}

/// Creates an active staff member with a standard skill level and no PIN.
pub async fn create_test_staff(db: &DatabaseConnection, name: &str, role: StaffRole) -> Result<StaffModel> {
    staff::create_staff(
        db,
        NewStaff {
            name: name.to_string(),
            email: None,
            phone: None,
            role,
            skill_level: SkillLevel::Standard,
            duration_multiplier: 1.0,
        },
    )
    .await
}

/// Creates a customer. `phone` is normalized, so an 8-digit number gets `+47`.
pub async fn create_test_customer(db: &DatabaseConnection, name: &str, phone: &str) -> Result<CustomerModel> {
    customer::create_customer(
        db,
        NewCustomer {
            name: name.to_string(),
            phone: phone.to_string(),
            email: None,
        },
    )
    .await
}

/// Creates a service priced 350 at 25% tax.
pub async fn create_test_service(db: &DatabaseConnection, name: &str, duration_minutes: i32) -> Result<ServiceModel> {
    catalog::create_service(
        db,
        NewService {
            name: name.to_string(),
            duration_minutes,
            price: Decimal::from(350),
            tax_rate: Decimal::from(25),
        },
    )
    .await
}

/// Creates a product priced 150 at 25% tax.
pub async fn create_test_product(db: &DatabaseConnection, name: &str, stock: i32) -> Result<ProductModel> {
    catalog::create_product(
        db,
        NewProduct {
            name: name.to_string(),
            sku: None,
            price: Decimal::from(150),
            tax_rate: Decimal::from(25),
            stock,
        },
    )
    .await
}

/// Books an appointment on `test_date()` through the scheduler, so conflicts are enforced.
pub async fn create_test_appointment(
    db: &DatabaseConnection,
    customer_id: i64,
    staff_id: i64,
    service_id: i64,
    start_time: &str,
    end_time: &str,
) -> Result<AppointmentModel> {
    scheduler::create_appointment(
        db,
        NewAppointment {
            customer_id,
            staff_id,
            service_id,
            date: test_date(),
            start_time: start_time.to_string(),
            end_time: end_time.to_string(),
            notes: None,
        },
    )
    .await
}

/// Inserts a pending 10:00-10:30 appointment with a fixed id, bypassing the scheduler.
pub async fn insert_appointment_with_id(
    db: &DatabaseConnection,
    id: i64,
    customer_id: i64,
    staff_id: i64,
    service_id: i64,
) -> Result<AppointmentModel> {
    let now = Utc::now();
    appointment::ActiveModel {
        id: Set(id),
        customer_id: Set(customer_id),
        staff_id: Set(staff_id),
        service_id: Set(service_id),
        date: Set(test_date()),
        start_time: Set("10:00".to_string()),
        end_time: Set("10:30".to_string()),
        status: Set(AppointmentStatus::Pending),
        payment_status: Set(PaymentStatus::Pending),
        notes: Set(None),
        cancellation_reason: Set(None),
        cancelled_by: Set(None),
        cancelled_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// Creates a pending walk-in order with one 350 service line (437.50 with tax).
pub async fn create_test_order(db: &DatabaseConnection) -> Result<OrderModel> {
    let service = create_test_service(db, "Cut", 30).await?;
    let created = order::create_order(
        db,
        NewOrder {
            customer_id: None,
            staff_id: None,
            appointment_id: None,
            items: vec![NewOrderItem {
                item_type: ItemType::Service,
                item_id: service.id,
                quantity: 1,
                unit_price: None,
            }],
            discount: Decimal::ZERO,
            tip: Decimal::ZERO,
        },
    )
    .await?;
    Ok(created.order)
}

/// Builds an API request, optionally authenticated and with a JSON body.
#[allow(clippy::unwrap_used)]
pub fn api_request(
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> axum::http::Request<axum::body::Body> {
    let mut builder = axum::http::Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(axum::body::Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(axum::body::Body::empty()).unwrap(),
    }
}

/// Reads a response body as JSON.
#[allow(clippy::unwrap_used)]
pub async fn response_json(response: axum::response::Response) -> serde_json::Value {
    use http_body_util::BodyExt;
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}
