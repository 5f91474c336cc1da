//! Appointment routes for staff, plus the public booking and availability endpoints.

use crate::{
    api::{DayQuery, auth::AuthStaff, local_now, local_today},
    core::{
        catalog, customer,
        order::{line_tax, round_money},
        payment::{self, NewPayment, UNPAID_CANCELLATION_REASON},
        permissions::Permission,
        scheduler::{self, AppointmentPatch, GridSlot, NewAppointment},
        settings::SalonSettings,
        staff,
        webhook::PaymentTarget,
    },
    entities::{AppointmentModel, PaymentMethod, PaymentState, ServiceModel, StaffModel, StaffRole},
    errors::{Error, Result},
    state::AppState,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{NaiveDate, NaiveTime, Timelike};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/appointments", get(list).post(create))
        .route("/api/appointments/grid", get(grid))
        .route("/api/appointments/{id}", get(show).patch(update))
        .route("/api/appointments/{id}/cancel", post(cancel))
        .route("/api/public/salon", get(salon_info))
        .route("/api/public/availability", get(availability))
        .route("/api/public/bookings", post(book))
}

/// GET /api/appointments?date=&staff_id=
async fn list(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(query): Query<DayQuery>,
) -> Result<Json<Vec<AppointmentModel>>> {
    auth.require(Permission::ViewAppointments)?;
    let date = match query.date {
        Some(date) => date,
        None => local_today(&*state.settings.current().await),
    };
    Ok(Json(scheduler::list_for_day(&state.db, date, query.staff_id).await?))
}

/// POST /api/appointments
async fn create(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(input): Json<NewAppointment>,
) -> Result<(StatusCode, Json<AppointmentModel>)> {
    auth.require(Permission::ManageAppointments)?;
    let created = scheduler::create_appointment(&state.db, input).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/appointments/grid?date=&staff_id=
async fn grid(
    State(state): State<AppState>,
    auth: AuthStaff,
    Query(query): Query<DayQuery>,
) -> Result<Json<Vec<GridSlot>>> {
    auth.require(Permission::ViewAppointments)?;
    let settings = state.settings.current().await;
    let date = query.date.unwrap_or_else(|| local_today(&settings));
    let grid = scheduler::day_grid(
        &state.db,
        date,
        query.staff_id,
        settings.opening_time,
        settings.closing_time,
        settings.slot_interval_minutes,
    )
    .await?;
    Ok(Json(grid))
}

/// GET /api/appointments/{id}
async fn show(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
) -> Result<Json<AppointmentModel>> {
    auth.require(Permission::ViewAppointments)?;
    scheduler::get_appointment(&state.db, id)
        .await?
        .map(Json)
        .ok_or_else(|| Error::not_found("Appointment", id))
}

/// PATCH /api/appointments/{id}
async fn update(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(patch): Json<AppointmentPatch>,
) -> Result<Json<AppointmentModel>> {
    auth.require(Permission::ManageAppointments)?;
    let updated = scheduler::update_appointment(&state.db, id, patch, Some(auth.staff.id)).await?;
    Ok(Json(updated))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CancelRequest {
    reason: Option<String>,
}

/// POST /api/appointments/{id}/cancel
async fn cancel(
    State(state): State<AppState>,
    auth: AuthStaff,
    Path(id): Path<i64>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<AppointmentModel>> {
    auth.require(Permission::ManageAppointments)?;
    let cancelled = scheduler::cancel_appointment(&state.db, id, Some(auth.staff.id), body.reason).await?;
    Ok(Json(cancelled))
}

#[derive(Debug, Serialize)]
struct SalonInfo {
    name: String,
    opening_time: String,
    closing_time: String,
    slot_interval_minutes: u32,
    timezone: String,
    online_payment: bool,
}

/// GET /api/public/salon
async fn salon_info(State(state): State<AppState>) -> Json<SalonInfo> {
    let settings = state.settings.current().await;
    Json(SalonInfo {
        name: settings.salon_name.clone(),
        opening_time: settings.opening_time.format("%H:%M").to_string(),
        closing_time: settings.closing_time.format("%H:%M").to_string(),
        slot_interval_minutes: settings.slot_interval_minutes,
        timezone: settings.timezone.name().to_string(),
        online_payment: settings.vipps.is_ready(),
    })
}

/// Loads an active service and a bookable staff member.
async fn booking_parts(state: &AppState, service_id: i64, staff_id: i64) -> Result<(ServiceModel, StaffModel)> {
    let service = catalog::get_service(&state.db, service_id)
        .await?
        .filter(|s| s.is_active)
        .ok_or_else(|| Error::not_found("Service", service_id))?;
    let member = staff::get_staff(&state.db, staff_id)
        .await?
        .filter(|s| s.is_active && s.role != StaffRole::Customer)
        .ok_or_else(|| Error::not_found("Staff", staff_id))?;
    Ok((service, member))
}

/// End of a booking starting at `start`. The booking must lie within opening hours and,
/// when `not_before` is set, start after it.
fn booking_end(
    start: NaiveTime,
    duration_minutes: i64,
    opening: NaiveTime,
    closing: NaiveTime,
    not_before: Option<NaiveTime>,
) -> Result<String> {
    if start < opening {
        return Err(Error::bad_request("The salon is not open at that time"));
    }
    if not_before.is_some_and(|now| start <= now) {
        return Err(Error::bad_request("Cannot book a time in the past"));
    }
    let start_min = i64::from(start.hour() * 60 + start.minute());
    let end_min = start_min + duration_minutes;
    let closing_min = i64::from(closing.hour() * 60 + closing.minute());
    if end_min > closing_min {
        return Err(Error::bad_request("The appointment does not fit before closing time"));
    }
    Ok(format!("{:02}:{:02}", end_min / 60, end_min % 60))
}

#[derive(Debug, Deserialize)]
struct AvailabilityQuery {
    date: NaiveDate,
    staff_id: i64,
    service_id: i64,
}

#[derive(Debug, Serialize)]
struct Availability {
    date: NaiveDate,
    staff_id: i64,
    duration_minutes: i64,
    starts: Vec<String>,
}

/// GET /api/public/availability?date=&staff_id=&service_id=
async fn availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<Availability>> {
    let settings = state.settings.current().await;
    let (service, member) = booking_parts(&state, query.service_id, query.staff_id).await?;
    let duration = scheduler::estimated_duration(&service, &member);
    let grid = scheduler::day_grid(
        &state.db,
        query.date,
        Some(member.id),
        settings.opening_time,
        settings.closing_time,
        settings.slot_interval_minutes,
    )
    .await?;
    let needed = scheduler::slots_occupied(
        u32::try_from(duration).unwrap_or(u32::MAX),
        settings.slot_interval_minutes,
    );
    let starts = scheduler::free_starts(&grid, needed as usize);
    Ok(Json(Availability {
        date: query.date,
        staff_id: member.id,
        duration_minutes: duration,
        starts,
    }))
}

#[derive(Debug, Deserialize)]
struct BookingRequest {
    name: String,
    phone: String,
    email: Option<String>,
    staff_id: i64,
    service_id: i64,
    date: NaiveDate,
    start_time: String,
    notes: Option<String>,
    /// Pay with Vipps before the appointment is confirmed
    #[serde(default)]
    pay_online: bool,
    /// Where Vipps sends the customer afterwards
    return_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct BookingResponse {
    appointment: AppointmentModel,
    payment_url: Option<String>,
}

/// POST /api/public/bookings
async fn book(
    State(state): State<AppState>,
    Json(request): Json<BookingRequest>,
) -> Result<(StatusCode, Json<BookingResponse>)> {
    let settings = state.settings.current().await;
    let now = local_now(&settings);
    if request.date < now.date() {
        return Err(Error::bad_request("Cannot book a date in the past"));
    }
    if request.pay_online && !settings.vipps.is_ready() {
        return Err(Error::bad_request("Online payment is not available"));
    }

    let (service, member) = booking_parts(&state, request.service_id, request.staff_id).await?;
    let start = scheduler::parse_hhmm(&request.start_time)?;
    let end_time = booking_end(
        start,
        scheduler::estimated_duration(&service, &member),
        settings.opening_time,
        settings.closing_time,
        (request.date == now.date()).then(|| now.time()),
    )?;

    let customer =
        customer::get_or_create_by_phone(&state.db, &request.phone, &request.name, request.email).await?;
    let appointment = scheduler::create_appointment(
        &state.db,
        NewAppointment {
            customer_id: customer.id,
            staff_id: member.id,
            service_id: service.id,
            date: request.date,
            start_time: request.start_time,
            end_time,
            notes: request.notes,
        },
    )
    .await?;
    tracing::info!(appointment_id = appointment.id, "Online booking created");

    let payment_url = if request.pay_online {
        let amount = round_money(service.price + line_tax(service.price, service.tax_rate));
        Some(
            start_vipps_payment(
                &state,
                &settings,
                &appointment,
                amount,
                &service.name,
                &customer.phone,
                request.return_url,
            )
            .await?,
        )
    } else {
        None
    };

    Ok((
        StatusCode::CREATED,
        Json(BookingResponse {
            appointment,
            payment_url,
        }),
    ))
}

/// Records the pending Vipps payment and returns the landing page URL. If Vipps refuses, the
/// booking is cancelled so the slot is released at once.
async fn start_vipps_payment(
    state: &AppState,
    settings: &SalonSettings,
    appointment: &AppointmentModel,
    amount: Decimal,
    description: &str,
    phone: &str,
    return_url: Option<String>,
) -> Result<String> {
    let target = PaymentTarget::Appointment(appointment.id);
    let pending = payment::record_payment(
        &state.db,
        NewPayment {
            order_id: None,
            appointment_id: Some(appointment.id),
            amount,
            method: PaymentMethod::Vipps,
            provider_reference: None,
        },
    )
    .await?;

    let fallback = return_url
        .or_else(|| settings.vipps.callback_url.clone())
        .unwrap_or_default();
    let vipps = state.vipps_client(settings);
    match vipps
        .initiate_payment(target, amount, description, Some(phone), &fallback)
        .await
    {
        Ok(initiated) => Ok(initiated.url),
        Err(error) => {
            tracing::error!(%error, appointment_id = appointment.id, "Vipps initiation failed");
            payment::set_payment_status(&state.db, pending.id, PaymentState::Failed).await?;
            scheduler::cancel_appointment(
                &state.db,
                appointment.id,
                None,
                Some(UNPAID_CANCELLATION_REASON.to_string()),
            )
            .await?;
            Err(error)
        }
    }
}
