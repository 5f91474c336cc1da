//! Provider payment callbacks applied to local state.
//!
//! Vipps and Stripe echo back the reference we sent when the payment was initiated: `APT-<id>`
//! for an online booking or `ORD-<id>` for a POS order. The HTTP layer (`api::webhooks`) checks
//! signatures and rate limits; this module maps provider statuses and updates payments,
//! appointments and orders in one transaction.

use crate::{
    core::{order, payment},
    entities::{Appointment, AppointmentStatus, PaymentState, PaymentStatus, appointment},
    errors::{Error, Result},
};
use chrono::Utc;
use sea_orm::{Set, TransactionTrait, prelude::*};
use serde::Serialize;
use std::fmt;

/// What a provider reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PaymentTarget {
    Appointment(i64),
    Order(i64),
}

impl PaymentTarget {
    /// Parses `APT-<id>` or `ORD-<id>`.
    #[must_use]
    pub fn parse(reference: &str) -> Option<Self> {
        let reference = reference.trim();
        if let Some(id) = reference.strip_prefix("APT-") {
            id.parse().ok().filter(|id| *id > 0).map(Self::Appointment)
        } else if let Some(id) = reference.strip_prefix("ORD-") {
            id.parse().ok().filter(|id| *id > 0).map(Self::Order)
        } else {
            None
        }
    }

    #[must_use]
    pub fn reference(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PaymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Appointment(id) => write!(f, "APT-{id}"),
            Self::Order(id) => write!(f, "ORD-{id}"),
        }
    }
}

/// Provider status, reduced to what the salon cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    /// Money is reserved (Vipps `RESERVED`)
    Reserved,
    /// Money is captured (Vipps `SALE`, Stripe `payment_intent.succeeded`)
    Sale,
    /// Payment will not happen (`CANCELLED`, `REJECTED`, Stripe failures)
    Failed,
}

/// Maps a Vipps transaction status. Unknown statuses are ignored by the caller.
#[must_use]
pub fn vipps_outcome(status: &str) -> Option<CallbackOutcome> {
    match status.trim().to_ascii_uppercase().as_str() {
        "RESERVED" | "AUTHORIZED" => Some(CallbackOutcome::Reserved),
        "SALE" | "CAPTURED" => Some(CallbackOutcome::Sale),
        "CANCELLED" | "REJECTED" | "ABORTED" | "TERMINATED" => Some(CallbackOutcome::Failed),
        _ => None,
    }
}

/// Maps a Stripe event type.
#[must_use]
pub fn stripe_outcome(event_type: &str) -> Option<CallbackOutcome> {
    match event_type {
        "payment_intent.succeeded" => Some(CallbackOutcome::Sale),
        "payment_intent.amount_capturable_updated" => Some(CallbackOutcome::Reserved),
        "payment_intent.payment_failed" | "payment_intent.canceled" => {
            Some(CallbackOutcome::Failed)
        }
        _ => None,
    }
}

/// What a callback changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackResult {
    pub target: PaymentTarget,
    pub outcome: CallbackOutcome,
    pub payment_id: Option<i64>,
}

const fn payment_state_for(outcome: CallbackOutcome) -> PaymentState {
    match outcome {
        CallbackOutcome::Reserved => PaymentState::Authorized,
        CallbackOutcome::Sale => PaymentState::Captured,
        CallbackOutcome::Failed => PaymentState::Failed,
    }
}

/// Applies a provider callback for `reference`.
///
/// `RESERVED` and `SALE` mark the appointment paid and confirm it if it is still pending (or
/// complete the order). Failures mark the appointment's payment failed and leave its status
/// alone. A captured payment is never moved back to authorized or failed by a late callback.
#[tracing::instrument(skip(db))]
pub async fn apply_payment_callback(
    db: &DatabaseConnection,
    reference: &str,
    outcome: CallbackOutcome,
    provider_transaction_id: Option<&str>,
) -> Result<CallbackResult> {
    let target = PaymentTarget::parse(reference)
        .ok_or_else(|| Error::bad_request(format!("Unrecognized payment reference '{reference}'")))?;

    let txn = db.begin().await?;

    let mut existing = payment::find_by_reference(&txn, reference).await?;
    if existing.is_none()
        && let Some(transaction_id) = provider_transaction_id
    {
        existing = payment::find_by_reference(&txn, transaction_id).await?;
    }

    if let Some(found) = existing.as_ref()
        && found.status == PaymentState::Captured
        && outcome != CallbackOutcome::Sale
    {
        tracing::warn!(payment_id = found.id, ?outcome, "Ignoring callback for captured payment");
        let payment_id = Some(found.id);
        txn.commit().await?;
        return Ok(CallbackResult {
            target,
            outcome,
            payment_id,
        });
    }

    let payment_id = match existing {
        Some(found) => {
            let id = found.id;
            payment::set_payment_status(&txn, id, payment_state_for(outcome)).await?;
            Some(id)
        }
        None => {
            tracing::warn!(reference, "No local payment row for provider callback");
            None
        }
    };

    match (target, outcome) {
        (PaymentTarget::Appointment(id), CallbackOutcome::Reserved | CallbackOutcome::Sale) => {
            mark_appointment_paid(&txn, id).await?;
        }
        (PaymentTarget::Appointment(id), CallbackOutcome::Failed) => {
            payment::set_appointment_payment_status(&txn, id, PaymentStatus::Failed).await?;
        }
        (PaymentTarget::Order(id), CallbackOutcome::Reserved | CallbackOutcome::Sale) => {
            order::complete_order(&txn, id).await?;
        }
        (PaymentTarget::Order(id), CallbackOutcome::Failed) => {
            tracing::info!(order_id = id, "Provider payment for order failed");
        }
    }

    txn.commit().await?;
    tracing::info!(%target, ?outcome, "Applied payment callback");
    Ok(CallbackResult {
        target,
        outcome,
        payment_id,
    })
}

async fn mark_appointment_paid<C>(db: &C, appointment_id: i64) -> Result<()>
where
    C: ConnectionTrait,
{
    let appt = Appointment::find_by_id(appointment_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("Appointment", appointment_id))?;

    let previous = appt.status;
    let mut active: appointment::ActiveModel = appt.into();
    active.payment_status = Set(PaymentStatus::Paid);
    match previous {
        AppointmentStatus::Pending => active.status = Set(AppointmentStatus::Confirmed),
        AppointmentStatus::Cancelled => {
            tracing::warn!(appointment_id, "Payment received for a cancelled appointment");
        }
        _ => {}
    }
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{
        core::{
            payment::{NewPayment, record_payment},
            scheduler::{cancel_appointment, get_appointment},
        },
        entities::{OrderStatus, PaymentMethod, StaffRole},
        test_utils::{
            create_test_customer, create_test_order, create_test_service, create_test_staff,
            insert_appointment_with_id, setup_test_db,
        },
    };
    use rust_decimal::Decimal;

    #[test]
    fn test_reference_parsing() {
        assert_eq!(PaymentTarget::parse("APT-42"), Some(PaymentTarget::Appointment(42)));
        assert_eq!(PaymentTarget::parse("ORD-7"), Some(PaymentTarget::Order(7)));
        assert_eq!(PaymentTarget::parse("APT-"), None);
        assert_eq!(PaymentTarget::parse("APT-0"), None);
        assert_eq!(PaymentTarget::parse("INV-3"), None);
        assert_eq!(PaymentTarget::Order(7).reference(), "ORD-7");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(vipps_outcome("RESERVED"), Some(CallbackOutcome::Reserved));
        assert_eq!(vipps_outcome("sale"), Some(CallbackOutcome::Sale));
        assert_eq!(vipps_outcome("REJECTED"), Some(CallbackOutcome::Failed));
        assert_eq!(vipps_outcome("CANCELLED"), Some(CallbackOutcome::Failed));
        assert_eq!(vipps_outcome("SOMETHING"), None);
        assert_eq!(stripe_outcome("payment_intent.succeeded"), Some(CallbackOutcome::Sale));
        assert_eq!(stripe_outcome("payment_intent.canceled"), Some(CallbackOutcome::Failed));
        assert_eq!(stripe_outcome("charge.refunded"), None);
    }

    async fn setup_appointment_42(db: &DatabaseConnection) -> Result<()> {
        let staff = create_test_staff(db, "Ola", StaffRole::Barber).await?;
        let service = create_test_service(db, "Cut", 30).await?;
        let customer = create_test_customer(db, "Per", "41234567").await?;
        insert_appointment_with_id(db, 42, customer.id, staff.id, service.id).await?;
        record_payment(
            db,
            NewPayment {
                order_id: None,
                appointment_id: Some(42),
                amount: Decimal::from(350),
                method: PaymentMethod::Vipps,
                provider_reference: None,
            },
        )
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_sale_confirms_and_pays_appointment() -> Result<()> {
        let db = setup_test_db().await?;
        setup_appointment_42(&db).await?;

        let result = apply_payment_callback(&db, "APT-42", CallbackOutcome::Sale, None).await?;
        assert_eq!(result.target, PaymentTarget::Appointment(42));
        assert!(result.payment_id.is_some());

        let appt = get_appointment(&db, 42).await?.unwrap();
        assert_eq!(appt.status, AppointmentStatus::Confirmed);
        assert_eq!(appt.payment_status, PaymentStatus::Paid);
        let payment = payment::find_by_reference(&db, "APT-42").await?.unwrap();
        assert_eq!(payment.status, PaymentState::Captured);

        // A late rejection does not undo the capture
        apply_payment_callback(&db, "APT-42", CallbackOutcome::Failed, None).await?;
        let payment = payment::find_by_reference(&db, "APT-42").await?.unwrap();
        assert_eq!(payment.status, PaymentState::Captured);
        let appt = get_appointment(&db, 42).await?.unwrap();
        assert_eq!(appt.status, AppointmentStatus::Confirmed);
        assert_eq!(appt.payment_status, PaymentStatus::Paid);

        // Nor does a late reservation
        apply_payment_callback(&db, "APT-42", CallbackOutcome::Reserved, None).await?;
        let payment = payment::find_by_reference(&db, "APT-42").await?.unwrap();
        assert_eq!(payment.status, PaymentState::Captured);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_marks_payment_failed_only() -> Result<()> {
        let db = setup_test_db().await?;
        setup_appointment_42(&db).await?;

        apply_payment_callback(&db, "APT-42", CallbackOutcome::Failed, None).await?;

        let appt = get_appointment(&db, 42).await?.unwrap();
        assert_eq!(appt.status, AppointmentStatus::Pending);
        assert_eq!(appt.payment_status, PaymentStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_payment_never_reactivates_cancelled_appointment() -> Result<()> {
        let db = setup_test_db().await?;
        setup_appointment_42(&db).await?;
        cancel_appointment(&db, 42, None, None).await?;

        apply_payment_callback(&db, "APT-42", CallbackOutcome::Reserved, None).await?;
        let appt = get_appointment(&db, 42).await?.unwrap();
        assert_eq!(appt.status, AppointmentStatus::Cancelled);
        assert_eq!(appt.payment_status, PaymentStatus::Paid);
        Ok(())
    }

    #[tokio::test]
    async fn test_sale_completes_order() -> Result<()> {
        let db = setup_test_db().await?;
        let created = create_test_order(&db).await?;
        let reference = PaymentTarget::Order(created.id).reference();

        apply_payment_callback(&db, &reference, CallbackOutcome::Sale, Some("pi_123")).await?;
        let reloaded = order::get_order(&db, created.id).await?.unwrap();
        assert_eq!(reloaded.status, OrderStatus::Completed);

        assert!(matches!(
            apply_payment_callback(&db, "bogus", CallbackOutcome::Sale, None).await,
            Err(Error::BadRequest { .. })
        ));
        Ok(())
    }
}
