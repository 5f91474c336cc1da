//! Payment recording and the unpaid-appointment sweep.
//!
//! Cash and gift-card payments are captured immediately. Vipps and Stripe payments start
//! `initiated` and only move forward through provider webhooks (`core::webhook`) or expire
//! through `expire_unpaid`.

use crate::{
    core::{order, webhook::PaymentTarget},
    entities::{
        Appointment, AppointmentStatus, Order, Payment, PaymentMethod, PaymentModel, PaymentState,
        PaymentStatus, appointment, payment,
    },
    errors::{Error, Result},
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use serde::{Deserialize, Serialize};

/// Reason stamped on appointments cancelled by the unpaid sweep
pub const UNPAID_CANCELLATION_REASON: &str = "Payment not completed";

#[derive(Debug, Clone, Deserialize)]
pub struct NewPayment {
    pub order_id: Option<i64>,
    pub appointment_id: Option<i64>,
    pub amount: Decimal,
    pub method: PaymentMethod,
    /// Provider transaction id; defaults to the `ORD-n` / `APT-n` reference
    pub provider_reference: Option<String>,
}

/// Records a payment.
///
/// Cash and gift cards are stored `captured` and complete the order they pay for. Provider
/// payments are stored `initiated` with the reference the provider will echo back in webhooks.
#[tracing::instrument(skip(db, input), fields(method = ?input.method))]
pub async fn record_payment(db: &DatabaseConnection, input: NewPayment) -> Result<PaymentModel> {
    if input.amount <= Decimal::ZERO {
        return Err(Error::bad_request("Payment amount must be positive"));
    }
    let target = match (input.order_id, input.appointment_id) {
        (Some(order_id), _) => PaymentTarget::Order(order_id),
        (None, Some(appointment_id)) => PaymentTarget::Appointment(appointment_id),
        (None, None) => {
            return Err(Error::bad_request(
                "A payment must reference an order or an appointment",
            ));
        }
    };

    let txn = db.begin().await?;

    if let Some(order_id) = input.order_id {
        Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| Error::not_found("Order", order_id))?;
    }
    if let Some(appointment_id) = input.appointment_id {
        Appointment::find_by_id(appointment_id)
            .one(&txn)
            .await?
            .ok_or_else(|| Error::not_found("Appointment", appointment_id))?;
    }

    let status = if input.method.is_provider() {
        PaymentState::Initiated
    } else {
        PaymentState::Captured
    };
    let reference = input
        .provider_reference
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| target.reference());

    let now = Utc::now();
    let created = payment::ActiveModel {
        order_id: Set(input.order_id),
        appointment_id: Set(input.appointment_id),
        amount: Set(input.amount),
        method: Set(input.method),
        status: Set(status),
        provider_reference: Set(Some(reference)),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    if status == PaymentState::Captured {
        if let Some(order_id) = created.order_id {
            order::complete_order(&txn, order_id).await?;
        }
        if let Some(appointment_id) = created.appointment_id {
            set_appointment_payment_status(&txn, appointment_id, PaymentStatus::Paid).await?;
        }
    }

    txn.commit().await?;
    tracing::info!(payment_id = created.id, status = ?created.status, amount = %created.amount, "Payment recorded");
    Ok(created)
}

pub(crate) async fn set_appointment_payment_status<C>(
    db: &C,
    appointment_id: i64,
    status: PaymentStatus,
) -> Result<()>
where
    C: ConnectionTrait,
{
    let Some(existing) = Appointment::find_by_id(appointment_id).one(db).await? else {
        return Err(Error::not_found("Appointment", appointment_id));
    };
    let mut active: appointment::ActiveModel = existing.into();
    active.payment_status = Set(status);
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

pub async fn get_payment(db: &DatabaseConnection, payment_id: i64) -> Result<Option<PaymentModel>> {
    Payment::find_by_id(payment_id)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Moves a payment to a new status (e.g. after a provider capture or cancel call).
pub async fn set_payment_status<C>(db: &C, payment_id: i64, status: PaymentState) -> Result<PaymentModel>
where
    C: ConnectionTrait,
{
    let existing = Payment::find_by_id(payment_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("Payment", payment_id))?;
    let previous = existing.status;

    let mut active: payment::ActiveModel = existing.into();
    active.status = Set(status);
    active.updated_at = Set(Utc::now());
    let updated = active.update(db).await?;
    tracing::info!(payment_id, from = ?previous, to = ?status, "Payment status changed");
    Ok(updated)
}

/// Most recent payment carrying this provider reference.
pub async fn find_by_reference<C>(db: &C, reference: &str) -> Result<Option<PaymentModel>>
where
    C: ConnectionTrait,
{
    Payment::find()
        .filter(payment::Column::ProviderReference.eq(reference))
        .order_by_desc(payment::Column::CreatedAt)
        .order_by_desc(payment::Column::Id)
        .one(db)
        .await
        .map_err(Into::into)
}

pub async fn list_for_order(db: &DatabaseConnection, order_id: i64) -> Result<Vec<PaymentModel>> {
    Payment::find()
        .filter(payment::Column::OrderId.eq(order_id))
        .order_by_asc(payment::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

pub async fn list_for_appointment(db: &DatabaseConnection, appointment_id: i64) -> Result<Vec<PaymentModel>> {
    Payment::find()
        .filter(payment::Column::AppointmentId.eq(appointment_id))
        .order_by_asc(payment::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpireReport {
    pub expired_payments: usize,
    pub cancelled_appointments: usize,
}

/// Expires provider payments for appointments still `initiated` after `timeout_minutes`.
///
/// The appointment gets `payment_status = expired` and, if it is still `pending`, is cancelled
/// with `UNPAID_CANCELLATION_REASON`. Appointments that moved past `pending` keep their status.
pub async fn expire_unpaid(
    db: &DatabaseConnection,
    now: DateTime<Utc>,
    timeout_minutes: i64,
) -> Result<ExpireReport> {
    let cutoff = now - Duration::minutes(timeout_minutes);
    let stale = Payment::find()
        .filter(payment::Column::Status.eq(PaymentState::Initiated))
        .filter(payment::Column::Method.is_in([PaymentMethod::Vipps, PaymentMethod::Stripe]))
        .filter(payment::Column::AppointmentId.is_not_null())
        .filter(payment::Column::CreatedAt.lt(cutoff))
        .all(db)
        .await?;

    let mut report = ExpireReport::default();
    if stale.is_empty() {
        return Ok(report);
    }

    let txn = db.begin().await?;
    for stale_payment in stale {
        let appointment_id = stale_payment.appointment_id;
        let mut active: payment::ActiveModel = stale_payment.into();
        active.status = Set(PaymentState::Expired);
        active.updated_at = Set(now);
        active.update(&txn).await?;
        report.expired_payments += 1;

        let Some(appointment_id) = appointment_id else {
            continue;
        };
        let Some(appt) = Appointment::find_by_id(appointment_id).one(&txn).await? else {
            tracing::warn!(appointment_id, "Expired payment references a missing appointment");
            continue;
        };
        let cancel = appt.status == AppointmentStatus::Pending;
        let mut active: appointment::ActiveModel = appt.into();
        active.payment_status = Set(PaymentStatus::Expired);
        if cancel {
            active.status = Set(AppointmentStatus::Cancelled);
            active.cancellation_reason = Set(Some(UNPAID_CANCELLATION_REASON.to_string()));
            active.cancelled_at = Set(Some(now));
            active.cancelled_by = Set(None);
            report.cancelled_appointments += 1;
        }
        active.updated_at = Set(now);
        active.update(&txn).await?;
    }
    txn.commit().await?;

    tracing::info!(
        expired = report.expired_payments,
        cancelled = report.cancelled_appointments,
        "Expired unpaid appointment payments"
    );
    Ok(report)
}
