//! Payment routes: cash and gift cards, Vipps online payments and Stripe Terminal card readers.
//!
//! Provider payments are recorded `initiated` before the provider is called, under the
//! `ORD-n` / `APT-n` reference the provider echoes back. Webhooks (or the capture endpoint
//! here) move them forward.

use crate::{
    api::auth::AuthStaff,
    core::{
        order::{self, RefundKind},
        payment::{self, NewPayment},
        permissions::Permission,
        webhook::{self, CallbackOutcome, PaymentTarget},
    },
    entities::{OrderStatus, PaymentMethod, PaymentModel, PaymentState, PaymentStatus},
    errors::{Error, Result},
    integrations::stripe_terminal::{Location, PaymentIntent, Reader},
    state::AppState,
};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/payments", post(create))
        .route("/api/orders/{id}/payments", get(for_order))
        .route("/api/appointments/{id}/payments", get(for_appointment))
        .route("/api/payments/vipps", post(vipps_initiate))
        .route("/api/payments/vipps/{reference}", get(vipps_details))
        .route("/api/payments/vipps/{reference}/capture", post(vipps_capture))
        .route("/api/payments/vipps/{reference}/cancel", post(vipps_cancel))
        .route("/api/payments/vipps/{reference}/refund", post(vipps_refund))
        .route("/api/payments/terminal", post(terminal_charge))
        .route("/api/terminal/locations", get(terminal_locations))
        .route("/api/terminal/readers", get(terminal_readers).post(register_reader))
        .route("/api/terminal/readers/{id}", delete(delete_reader))
        .route("/api/terminal/readers/{id}/cancel", post(cancel_reader_action))
}

/// POST /api/payments - records a payment taken at the desk
async fn create(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(input): Json<NewPayment>,
) -> Result<(StatusCode, Json<PaymentModel>)> {
    auth.require(Permission::UsePos)?;
    Ok((StatusCode::CREATED, Json(payment::record_payment(&state.db, input).await?)))
}

/// GET /api/orders/{id}/payments
async fn for_order(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<Vec<PaymentModel>>> {
    auth.require(Permission::UsePos)?;
    Ok(Json(payment::list_for_order(&state.db, id).await?))
}

/// GET /api/appointments/{id}/payments
async fn for_appointment(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<Vec<PaymentModel>>> {
    auth.require(Permission::ViewAppointments)?;
    Ok(Json(payment::list_for_appointment(&state.db, id).await?))
}

/// Order that can still take a payment, and the amount due
async fn payable_order(state: &AppState, order_id: i64) -> Result<Decimal> {
    let found = order::get_order(&state.db, order_id)
        .await?
        .ok_or_else(|| Error::not_found("Order", order_id))?;
    if found.status != OrderStatus::Pending {
        return Err(Error::bad_request(format!("Order {order_id} is not awaiting payment")));
    }
    Ok(found.total)
}

fn parse_target(reference: &str) -> Result<PaymentTarget> {
    PaymentTarget::parse(reference)
        .ok_or_else(|| Error::bad_request(format!("Unrecognized payment reference '{reference}'")))
}

async fn payment_for(state: &AppState, reference: &str) -> Result<PaymentModel> {
    payment::find_by_reference(&state.db, reference)
        .await?
        .ok_or_else(|| Error::not_found("Payment", reference))
}

#[derive(Debug, Deserialize)]
struct VippsCheckout {
    order_id: i64,
    mobile_number: Option<String>,
    return_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct VippsCheckoutResponse {
    payment: PaymentModel,
    url: String,
}

/// POST /api/payments/vipps - Vipps payment for a POS order
async fn vipps_initiate(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(request): Json<VippsCheckout>,
) -> Result<(StatusCode, Json<VippsCheckoutResponse>)> {
    auth.require(Permission::UsePos)?;
    let amount = payable_order(&state, request.order_id).await?;
    let target = PaymentTarget::Order(request.order_id);
    let pending = payment::record_payment(
        &state.db,
        NewPayment {
            order_id: Some(request.order_id),
            appointment_id: None,
            amount,
            method: PaymentMethod::Vipps,
            provider_reference: None,
        },
    )
    .await?;

    let settings = state.settings.current().await;
    let fallback = request
        .return_url
        .or_else(|| settings.vipps.callback_url.clone())
        .unwrap_or_default();
    let description = format!("{} {}", settings.salon_name, target);
    let initiated = state
        .vipps_client(&settings)
        .initiate_payment(target, amount, &description, request.mobile_number.as_deref(), &fallback)
        .await;

    match initiated {
        Ok(initiated) => Ok((
            StatusCode::CREATED,
            Json(VippsCheckoutResponse {
                payment: pending,
                url: initiated.url,
            }),
        )),
        Err(error) => {
            tracing::error!(%error, order_id = request.order_id, "Vipps initiation failed");
            payment::set_payment_status(&state.db, pending.id, PaymentState::Failed).await?;
            Err(error)
        }
    }
}

/// GET /api/payments/vipps/{reference}
async fn vipps_details(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(reference): Path<String>,
) -> Result<Json<serde_json::Value>> {
    auth.require(Permission::UsePos)?;
    let target = parse_target(&reference)?;
    let settings = state.settings.current().await;
    Ok(Json(state.vipps_client(&settings).details(target).await?))
}

/// POST /api/payments/vipps/{reference}/capture - captures the full reserved amount
async fn vipps_capture(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(reference): Path<String>,
) -> Result<Json<webhook::CallbackResult>> {
    auth.require(Permission::UsePos)?;
    let target = parse_target(&reference)?;
    let local = payment_for(&state, &reference).await?;
    if local.status == PaymentState::Captured {
        return Err(Error::conflict(format!("Payment {reference} is already captured")));
    }

    let settings = state.settings.current().await;
    state
        .vipps_client(&settings)
        .capture(target, local.amount, &settings.salon_name)
        .await?;
    let applied = webhook::apply_payment_callback(&state.db, &reference, CallbackOutcome::Sale, None).await?;
    Ok(Json(applied))
}

/// POST /api/payments/vipps/{reference}/cancel - releases a reservation
async fn vipps_cancel(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(reference): Path<String>,
) -> Result<Json<PaymentModel>> {
    auth.require(Permission::UsePos)?;
    let target = parse_target(&reference)?;
    let local = payment_for(&state, &reference).await?;
    if local.status == PaymentState::Captured {
        return Err(Error::bad_request(format!(
            "Payment {reference} is captured; refund it instead"
        )));
    }

    let settings = state.settings.current().await;
    state.vipps_client(&settings).cancel(target, &settings.salon_name).await?;
    Ok(Json(payment::set_payment_status(&state.db, local.id, PaymentState::Cancelled).await?))
}

#[derive(Debug, Default, Deserialize)]
struct VippsRefund {
    /// Defaults to the whole payment
    amount: Option<Decimal>,
}

/// POST /api/payments/vipps/{reference}/refund
async fn vipps_refund(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(reference): Path<String>,
    Json(request): Json<VippsRefund>,
) -> Result<Json<PaymentModel>> {
    auth.require(Permission::RefundOrders)?;
    let target = parse_target(&reference)?;
    let local = payment_for(&state, &reference).await?;
    if local.status != PaymentState::Captured {
        return Err(Error::bad_request(format!("Payment {reference} has not been captured")));
    }
    let amount = request.amount.unwrap_or(local.amount);
    if amount <= Decimal::ZERO || amount > local.amount {
        return Err(Error::bad_request("Refund amount must be positive and at most the payment"));
    }

    let settings = state.settings.current().await;
    state
        .vipps_client(&settings)
        .refund(target, amount, &settings.salon_name)
        .await?;

    let full = amount == local.amount;
    match target {
        PaymentTarget::Order(order_id) => {
            let kind = if full { RefundKind::Full } else { RefundKind::Partial };
            order::refund_order(&state.db, order_id, kind).await?;
        }
        PaymentTarget::Appointment(appointment_id) if full => {
            payment::set_appointment_payment_status(&state.db, appointment_id, PaymentStatus::Refunded)
                .await?;
        }
        PaymentTarget::Appointment(_) => {}
    }

    let updated = if full {
        payment::set_payment_status(&state.db, local.id, PaymentState::Refunded).await?
    } else {
        local
    };
    tracing::info!(%target, %amount, "Vipps payment refunded");
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
struct TerminalCharge {
    order_id: i64,
    reader_id: String,
}

#[derive(Debug, Serialize)]
struct TerminalChargeResponse {
    payment: PaymentModel,
    payment_intent: PaymentIntent,
    reader: Reader,
}

/// POST /api/payments/terminal - charges a POS order on a card reader
async fn terminal_charge(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(request): Json<TerminalCharge>,
) -> Result<(StatusCode, Json<TerminalChargeResponse>)> {
    auth.require(Permission::UsePos)?;
    let amount = payable_order(&state, request.order_id).await?;
    let settings = state.settings.current().await;
    let stripe = state.stripe_client(&settings)?;
    let target = PaymentTarget::Order(request.order_id);

    let intent = stripe.create_payment_intent(target, amount).await?;
    let recorded = payment::record_payment(
        &state.db,
        NewPayment {
            order_id: Some(request.order_id),
            appointment_id: None,
            amount,
            method: PaymentMethod::Stripe,
            provider_reference: None,
        },
    )
    .await?;

    let reader = match stripe.process_payment_intent(&request.reader_id, &intent.id).await {
        Ok(reader) => reader,
        Err(error) => {
            tracing::error!(%error, reader_id = %request.reader_id, "Reader refused the payment");
            payment::set_payment_status(&state.db, recorded.id, PaymentState::Failed).await?;
            return Err(error);
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(TerminalChargeResponse {
            payment: recorded,
            payment_intent: intent,
            reader,
        }),
    ))
}

/// GET /api/terminal/locations
async fn terminal_locations(State(state): State<AppState>, auth: AuthStaff) -> Result<Json<Vec<Location>>> {
    auth.require(Permission::ManageIntegrations)?;
    let settings = state.settings.current().await;
    Ok(Json(state.stripe_client(&settings)?.list_locations().await?))
}

/// GET /api/terminal/readers - readers at the configured location
async fn terminal_readers(State(state): State<AppState>, auth: AuthStaff) -> Result<Json<Vec<Reader>>> {
    auth.require(Permission::UsePos)?;
    let settings = state.settings.current().await;
    Ok(Json(state.stripe_client(&settings)?.list_readers().await?))
}

#[derive(Debug, Deserialize)]
struct ReaderRegistration {
    registration_code: String,
    label: String,
}

/// POST /api/terminal/readers
async fn register_reader(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(registration): Json<ReaderRegistration>,
) -> Result<(StatusCode, Json<Reader>)> {
    auth.require(Permission::ManageIntegrations)?;
    let settings = state.settings.current().await;
    let reader = state
        .stripe_client(&settings)?
        .register_reader(&registration.registration_code, &registration.label)
        .await?;
    Ok((StatusCode::CREATED, Json(reader)))
}

/// DELETE /api/terminal/readers/{id}
async fn delete_reader(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    auth.require(Permission::ManageIntegrations)?;
    let settings = state.settings.current().await;
    state.stripe_client(&settings)?.delete_reader(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/terminal/readers/{id}/cancel - aborts whatever the reader is doing
async fn cancel_reader_action(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<String>,
) -> Result<Json<Reader>> {
    auth.require(Permission::UsePos)?;
    let settings = state.settings.current().await;
    Ok(Json(state.stripe_client(&settings)?.cancel_reader_action(&id).await?))
}
