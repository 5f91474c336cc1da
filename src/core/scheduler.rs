//! Appointment scheduler - conflict detection, status transitions and the slot grid.
//!
//! Times are `HH:MM` wall-clock strings in the salon timezone. Two appointments of the same
//! staff member on the same date conflict when their intervals overlap; cancelled appointments
//! never block a slot. The conflict check and the insert share one database transaction.

use crate::{
    entities::{
        Appointment, AppointmentModel, AppointmentStatus, PaymentStatus, ServiceModel, StaffModel,
        appointment,
    },
    errors::{Error, Result},
};
use chrono::{NaiveDate, NaiveTime, Timelike, Utc};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use serde::{Deserialize, Serialize};

/// Input for booking an appointment
#[derive(Debug, Clone, Deserialize)]
pub struct NewAppointment {
    pub customer_id: i64,
    pub staff_id: i64,
    pub service_id: i64,
    pub date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub notes: Option<String>,
}

/// Partial update of an appointment; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppointmentPatch {
    pub date: Option<NaiveDate>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub staff_id: Option<i64>,
    pub service_id: Option<i64>,
    pub status: Option<AppointmentStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub notes: Option<String>,
    pub cancellation_reason: Option<String>,
}

/// Parses a strict `HH:MM` time.
pub fn parse_hhmm(value: &str) -> Result<NaiveTime> {
    let valid_shape = value.len() == 5 && value.as_bytes()[2] == b':';
    valid_shape
        .then(|| NaiveTime::parse_from_str(value, "%H:%M").ok())
        .flatten()
        .ok_or_else(|| Error::bad_request(format!("Invalid time '{value}', expected HH:MM")))
}

fn minutes_of(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

/// Validates a `start`/`end` pair and returns both as minutes since midnight.
pub fn validate_range(start: &str, end: &str) -> Result<(u32, u32)> {
    let start_min = minutes_of(parse_hhmm(start)?);
    let end_min = minutes_of(parse_hhmm(end)?);
    if start_min >= end_min {
        return Err(Error::bad_request(format!(
            "Start time {start} must be before end time {end}"
        )));
    }
    Ok((start_min, end_min))
}

/// Overlap rule for `[start, end)` ranges given in minutes.
///
/// A new range conflicts when its start falls in `[existing_start, existing_end)`, its end falls
/// in `(existing_start, existing_end]`, or it fully encloses the existing range. Back-to-back
/// appointments (one ends when the next starts) do not conflict.
#[must_use]
pub const fn intervals_overlap(new_start: u32, new_end: u32, existing_start: u32, existing_end: u32) -> bool {
    let start_inside = new_start >= existing_start && new_start < existing_end;
    let end_inside = new_end > existing_start && new_end <= existing_end;
    let encloses = new_start <= existing_start && new_end >= existing_end;
    start_inside || end_inside || encloses
}

/// Whether an appointment may move from `from` to `to`.
///
/// `pending` may go anywhere; `confirmed` may not go back to `pending`; `checked_in` can only
/// complete. `no_show`, `cancelled` and `completed` are terminal. Staying in the same status is
/// always allowed.
#[must_use]
pub const fn can_transition(from: AppointmentStatus, to: AppointmentStatus) -> bool {
    use AppointmentStatus::{Cancelled, CheckedIn, Completed, Confirmed, NoShow, Pending};
    if from as u8 == to as u8 {
        return true;
    }
    match from {
        Pending => matches!(to, Confirmed | CheckedIn | NoShow | Cancelled | Completed),
        Confirmed => matches!(to, CheckedIn | NoShow | Cancelled | Completed),
        CheckedIn => matches!(to, Completed),
        NoShow | Cancelled | Completed => false,
    }
}

fn check_transition(from: AppointmentStatus, to: AppointmentStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(Error::bad_request(format!(
            "Cannot change appointment status from {from:?} to {to:?}"
        )))
    }
}

async fn find_conflict<C>(
    db: &C,
    staff_id: i64,
    date: NaiveDate,
    start_min: u32,
    end_min: u32,
) -> Result<Option<AppointmentModel>>
where
    C: ConnectionTrait,
{
    let existing = Appointment::find()
        .filter(appointment::Column::StaffId.eq(staff_id))
        .filter(appointment::Column::Date.eq(date))
        .filter(appointment::Column::Status.ne(AppointmentStatus::Cancelled))
        .all(db)
        .await?;

    for other in existing {
        // Stored rows were validated on write; skip anything unparseable rather than block
        let Ok((other_start, other_end)) = validate_range(&other.start_time, &other.end_time) else {
            tracing::warn!(appointment_id = other.id, "Skipping appointment with invalid times");
            continue;
        };
        if intervals_overlap(start_min, end_min, other_start, other_end) {
            return Ok(Some(other));
        }
    }
    Ok(None)
}

/// Books an appointment after checking the staff member's day for overlaps.
///
/// On conflict nothing is written and `Error::Conflict` names the clashing appointment.
#[tracing::instrument(skip(db, input), fields(staff_id = input.staff_id, date = %input.date))]
pub async fn create_appointment(
    db: &DatabaseConnection,
    input: NewAppointment,
) -> Result<AppointmentModel> {
    let (start_min, end_min) = validate_range(&input.start_time, &input.end_time)?;

    let txn = db.begin().await?;

    if let Some(conflict) = find_conflict(&txn, input.staff_id, input.date, start_min, end_min).await? {
        return Err(Error::conflict(format!(
            "Staff member {} is already booked {}-{} on {} (appointment {})",
            input.staff_id, conflict.start_time, conflict.end_time, input.date, conflict.id
        )));
    }

    let now = Utc::now();
    let created = appointment::ActiveModel {
        customer_id: Set(input.customer_id),
        staff_id: Set(input.staff_id),
        service_id: Set(input.service_id),
        date: Set(input.date),
        start_time: Set(input.start_time),
        end_time: Set(input.end_time),
        status: Set(AppointmentStatus::Pending),
        payment_status: Set(PaymentStatus::Pending),
        notes: Set(input.notes.filter(|n| !n.trim().is_empty())),
        cancellation_reason: Set(None),
        cancelled_by: Set(None),
        cancelled_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    txn.commit().await?;

    tracing::info!(appointment_id = created.id, "Appointment booked");
    Ok(created)
}

pub async fn get_appointment<C>(db: &C, appointment_id: i64) -> Result<Option<AppointmentModel>>
where
    C: ConnectionTrait,
{
    Appointment::find_by_id(appointment_id)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Applies a partial update.
///
/// Status changes follow `can_transition`; moving to `cancelled` stamps `cancelled_at` and
/// `cancelled_by`. Rescheduling keeps `start < end` but does not re-check conflicts, and past
/// dates are accepted.
pub async fn update_appointment(
    db: &DatabaseConnection,
    appointment_id: i64,
    patch: AppointmentPatch,
    actor: Option<i64>,
) -> Result<AppointmentModel> {
    let existing = get_appointment(db, appointment_id)
        .await?
        .ok_or_else(|| Error::not_found("Appointment", appointment_id))?;

    let start = patch.start_time.clone().unwrap_or_else(|| existing.start_time.clone());
    let end = patch.end_time.clone().unwrap_or_else(|| existing.end_time.clone());
    validate_range(&start, &end)?;

    if let Some(status) = patch.status {
        check_transition(existing.status, status)?;
    }

    let previous_status = existing.status;
    let mut active: appointment::ActiveModel = existing.into();
    active.start_time = Set(start);
    active.end_time = Set(end);
    if let Some(date) = patch.date {
        active.date = Set(date);
    }
    if let Some(staff_id) = patch.staff_id {
        active.staff_id = Set(staff_id);
    }
    if let Some(service_id) = patch.service_id {
        active.service_id = Set(service_id);
    }
    if let Some(payment_status) = patch.payment_status {
        active.payment_status = Set(payment_status);
    }
    if let Some(notes) = patch.notes {
        active.notes = Set(Some(notes).filter(|n| !n.trim().is_empty()));
    }
    if let Some(reason) = patch.cancellation_reason {
        active.cancellation_reason = Set(Some(reason));
    }
    let now = Utc::now();
    if let Some(status) = patch.status {
        active.status = Set(status);
        if status == AppointmentStatus::Cancelled && previous_status != AppointmentStatus::Cancelled {
            active.cancelled_at = Set(Some(now));
            active.cancelled_by = Set(actor);
        }
    }
    active.updated_at = Set(now);

    let updated = active.update(db).await?;
    if updated.status != previous_status {
        tracing::info!(
            appointment_id,
            from = ?previous_status,
            to = ?updated.status,
            "Appointment status changed"
        );
    }
    Ok(updated)
}

/// Cancels an appointment, recording who cancelled and why.
pub async fn cancel_appointment(
    db: &DatabaseConnection,
    appointment_id: i64,
    actor: Option<i64>,
    reason: Option<String>,
) -> Result<AppointmentModel> {
    update_appointment(
        db,
        appointment_id,
        AppointmentPatch {
            status: Some(AppointmentStatus::Cancelled),
            cancellation_reason: reason,
            ..Default::default()
        },
        actor,
    )
    .await
}

/// Lists a day's appointments ordered by start time, optionally for one staff member.
pub async fn list_for_day(
    db: &DatabaseConnection,
    date: NaiveDate,
    staff_id: Option<i64>,
) -> Result<Vec<AppointmentModel>> {
    let mut query = Appointment::find()
        .filter(appointment::Column::Date.eq(date))
        .order_by_asc(appointment::Column::StartTime)
        .order_by_asc(appointment::Column::Id);
    if let Some(staff_id) = staff_id {
        query = query.filter(appointment::Column::StaffId.eq(staff_id));
    }
    query.all(db).await.map_err(Into::into)
}

pub async fn list_for_customer(db: &DatabaseConnection, customer_id: i64) -> Result<Vec<AppointmentModel>> {
    Appointment::find()
        .filter(appointment::Column::CustomerId.eq(customer_id))
        .order_by_desc(appointment::Column::Date)
        .order_by_desc(appointment::Column::StartTime)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Slot start times in `[open, close)` stepping by `interval_minutes`.
#[must_use]
pub fn generate_time_slots(open: NaiveTime, close: NaiveTime, interval_minutes: u32) -> Vec<String> {
    if interval_minutes == 0 {
        return Vec::new();
    }
    let close_min = minutes_of(close);
    let mut slots = Vec::new();
    let mut current = minutes_of(open);
    while current < close_min {
        slots.push(format!("{:02}:{:02}", current / 60, current % 60));
        current += interval_minutes;
    }
    slots
}

/// Number of grid slots an appointment of `duration_minutes` occupies.
#[must_use]
pub const fn slots_occupied(duration_minutes: u32, interval_minutes: u32) -> u32 {
    if interval_minutes == 0 {
        return 0;
    }
    duration_minutes.div_ceil(interval_minutes)
}

/// Estimated duration of a service when performed by a given staff member.
#[must_use]
pub fn estimated_duration(service: &ServiceModel, staff: &StaffModel) -> i64 {
    let minutes = f64::from(service.duration_minutes) * staff.duration_multiplier;
    // Multipliers are validated positive, so the result is a small positive number
    #[allow(clippy::cast_possible_truncation)]
    let rounded = minutes.ceil() as i64;
    rounded.max(1)
}

/// One row of the day grid
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridSlot {
    pub time: String,
    /// Appointment occupying the slot, if any
    pub appointment_id: Option<i64>,
}

/// Builds the slot grid for a day: each non-cancelled appointment occupies
/// `slots_occupied(duration)` slots starting at its `start_time`.
pub async fn day_grid(
    db: &DatabaseConnection,
    date: NaiveDate,
    staff_id: Option<i64>,
    open: NaiveTime,
    close: NaiveTime,
    interval_minutes: u32,
) -> Result<Vec<GridSlot>> {
    let mut grid: Vec<GridSlot> = generate_time_slots(open, close, interval_minutes)
        .into_iter()
        .map(|time| GridSlot {
            time,
            appointment_id: None,
        })
        .collect();

    let appointments = list_for_day(db, date, staff_id).await?;
    for appt in appointments
        .iter()
        .filter(|a| a.status != AppointmentStatus::Cancelled)
    {
        let Ok((start, end)) = validate_range(&appt.start_time, &appt.end_time) else {
            continue;
        };
        let Some(first) = grid.iter().position(|slot| slot.time == appt.start_time) else {
            continue;
        };
        let count = slots_occupied(end - start, interval_minutes) as usize;
        for slot in grid.iter_mut().skip(first).take(count) {
            slot.appointment_id = Some(appt.id);
        }
    }
    Ok(grid)
}

/// Slot times where `slots_needed` consecutive free slots start, all before closing.
#[must_use]
pub fn free_starts(grid: &[GridSlot], slots_needed: usize) -> Vec<String> {
    if slots_needed == 0 {
        return Vec::new();
    }
    grid.windows(slots_needed)
        .filter(|window| window.iter().all(|slot| slot.appointment_id.is_none()))
        .map(|window| window[0].time.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{
        entities::StaffRole,
        test_utils::{
            create_test_appointment, create_test_customer, create_test_service, create_test_staff,
            setup_test_db, test_date,
        },
    };

    fn t(value: &str) -> NaiveTime {
        parse_hhmm(value).unwrap()
    }

    #[test]
    fn test_free_starts_need_consecutive_slots() {
        let slot = |time: &str, appointment_id| GridSlot {
            time: time.to_string(),
            appointment_id,
        };
        let grid = vec![
            slot("09:00", None),
            slot("09:15", None),
            slot("09:30", Some(1)),
            slot("09:45", None),
            slot("10:00", None),
            slot("10:15", None),
        ];
        assert_eq!(free_starts(&grid, 2), vec!["09:00", "09:45", "10:00"]);
        assert_eq!(free_starts(&grid, 3), vec!["09:45"]);
        assert!(free_starts(&grid, 7).is_empty());
    }

    #[test]
    fn test_parse_hhmm_is_strict() {
        assert!(parse_hhmm("09:30").is_ok());
        assert!(parse_hhmm("9:30").is_err());
        assert!(parse_hhmm("24:00").is_err());
        assert!(parse_hhmm("09:60").is_err());
        assert!(parse_hhmm("0930").is_err());
    }

    #[test]
    fn test_intervals_overlap_rule() {
        // 10:00-10:30 existing
        let (s, e) = (600, 630);
        assert!(intervals_overlap(600, 630, s, e));
        assert!(intervals_overlap(615, 645, s, e));
        assert!(intervals_overlap(585, 615, s, e));
        assert!(intervals_overlap(570, 660, s, e));
        assert!(intervals_overlap(605, 625, s, e));
        // Back to back
        assert!(!intervals_overlap(630, 660, s, e));
        assert!(!intervals_overlap(570, 600, s, e));
    }

    #[test]
    fn test_transition_table() {
        use AppointmentStatus::{Cancelled, CheckedIn, Completed, Confirmed, Pending};
        assert!(can_transition(Pending, Confirmed));
        assert!(can_transition(Confirmed, CheckedIn));
        assert!(can_transition(CheckedIn, Completed));
        assert!(!can_transition(Confirmed, Pending));
        assert!(!can_transition(CheckedIn, Cancelled));
        assert!(!can_transition(Cancelled, Pending));
        assert!(!can_transition(Cancelled, Confirmed));
        assert!(!can_transition(Completed, Cancelled));
        assert!(can_transition(Cancelled, Cancelled));
    }

    #[test]
    fn test_slot_generation() {
        let slots = generate_time_slots(t("09:00"), t("10:00"), 15);
        assert_eq!(slots, vec!["09:00", "09:15", "09:30", "09:45"]);
        assert_eq!(generate_time_slots(t("09:00"), t("09:00"), 15).len(), 0);
        assert_eq!(slots_occupied(30, 15), 2);
        assert_eq!(slots_occupied(40, 15), 3);
        assert_eq!(slots_occupied(15, 15), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_overlap_and_allows_back_to_back() -> Result<()> {
        let db = setup_test_db().await?;
        let staff = create_test_staff(&db, "Ola", StaffRole::Barber).await?;
        let other_staff = create_test_staff(&db, "Kari", StaffRole::Barber).await?;
        let service = create_test_service(&db, "Cut", 30).await?;
        let customer = create_test_customer(&db, "Per", "41234567").await?;

        let first =
            create_test_appointment(&db, customer.id, staff.id, service.id, "10:00", "10:30").await?;
        assert_eq!(first.status, AppointmentStatus::Pending);
        assert_eq!(first.payment_status, PaymentStatus::Pending);

        let clash =
            create_test_appointment(&db, customer.id, staff.id, service.id, "10:15", "10:45").await;
        assert!(matches!(clash, Err(Error::Conflict { .. })));

        create_test_appointment(&db, customer.id, staff.id, service.id, "10:30", "11:00").await?;
        create_test_appointment(&db, customer.id, other_staff.id, service.id, "10:00", "10:30")
            .await?;

        // Cancelled appointments free their slot
        cancel_appointment(&db, first.id, Some(staff.id), Some("Sick".to_string())).await?;
        create_test_appointment(&db, customer.id, staff.id, service.id, "10:00", "10:30").await?;

        let day = list_for_day(&db, test_date(), Some(staff.id)).await?;
        let active: Vec<_> = day
            .iter()
            .filter(|a| a.status != AppointmentStatus::Cancelled)
            .collect();
        assert_eq!(active.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_validates_times() -> Result<()> {
        let db = setup_test_db().await?;
        let staff = create_test_staff(&db, "Ola", StaffRole::Barber).await?;
        let service = create_test_service(&db, "Cut", 30).await?;
        let customer = create_test_customer(&db, "Per", "41234567").await?;

        let reversed =
            create_test_appointment(&db, customer.id, staff.id, service.id, "11:00", "10:00").await;
        assert!(matches!(reversed, Err(Error::BadRequest { .. })));
        let malformed =
            create_test_appointment(&db, customer.id, staff.id, service.id, "10", "11:00").await;
        assert!(matches!(malformed, Err(Error::BadRequest { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_stamps_metadata_and_is_terminal() -> Result<()> {
        let db = setup_test_db().await?;
        let staff = create_test_staff(&db, "Ola", StaffRole::Barber).await?;
        let service = create_test_service(&db, "Cut", 30).await?;
        let customer = create_test_customer(&db, "Per", "41234567").await?;
        let appt =
            create_test_appointment(&db, customer.id, staff.id, service.id, "12:00", "12:30").await?;

        let cancelled =
            cancel_appointment(&db, appt.id, Some(staff.id), Some("Customer called".to_string()))
                .await?;
        assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
        assert_eq!(cancelled.cancelled_by, Some(staff.id));
        assert!(cancelled.cancelled_at.is_some());
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("Customer called"));

        let revive = update_appointment(
            &db,
            appt.id,
            AppointmentPatch {
                status: Some(AppointmentStatus::Confirmed),
                ..Default::default()
            },
            None,
        )
        .await;
        assert!(matches!(revive, Err(Error::BadRequest { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_reschedule_does_not_recheck_conflicts() -> Result<()> {
        let db = setup_test_db().await?;
        let staff = create_test_staff(&db, "Ola", StaffRole::Barber).await?;
        let service = create_test_service(&db, "Cut", 30).await?;
        let customer = create_test_customer(&db, "Per", "41234567").await?;
        create_test_appointment(&db, customer.id, staff.id, service.id, "10:00", "10:30").await?;
        let second =
            create_test_appointment(&db, customer.id, staff.id, service.id, "11:00", "11:30").await?;

        let moved = update_appointment(
            &db,
            second.id,
            AppointmentPatch {
                start_time: Some("10:15".to_string()),
                end_time: Some("10:45".to_string()),
                ..Default::default()
            },
            None,
        )
        .await?;
        assert_eq!(moved.start_time, "10:15");

        let inverted = update_appointment(
            &db,
            second.id,
            AppointmentPatch {
                end_time: Some("10:00".to_string()),
                ..Default::default()
            },
            None,
        )
        .await;
        assert!(matches!(inverted, Err(Error::BadRequest { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_day_grid_marks_occupied_slots() -> Result<()> {
        let db = setup_test_db().await?;
        let staff = create_test_staff(&db, "Ola", StaffRole::Barber).await?;
        let service = create_test_service(&db, "Cut", 40).await?;
        let customer = create_test_customer(&db, "Per", "41234567").await?;
        let appt =
            create_test_appointment(&db, customer.id, staff.id, service.id, "09:15", "09:55").await?;

        let grid = day_grid(&db, test_date(), Some(staff.id), t("09:00"), t("10:30"), 15).await?;
        let occupied: Vec<&str> = grid
            .iter()
            .filter(|slot| slot.appointment_id == Some(appt.id))
            .map(|slot| slot.time.as_str())
            .collect();
        assert_eq!(occupied, vec!["09:15", "09:30", "09:45"]);
        assert_eq!(grid.len(), 6);
        Ok(())
    }

    #[tokio::test]
    async fn test_estimated_duration_applies_multiplier() -> Result<()> {
        let db = setup_test_db().await?;
        let service = create_test_service(&db, "Cut", 30).await?;
        let mut staff = create_test_staff(&db, "Slow", StaffRole::Barber).await?;
        staff.duration_multiplier = 1.25;
        assert_eq!(estimated_duration(&service, &staff), 38);
        staff.duration_multiplier = 1.0;
        assert_eq!(estimated_duration(&service, &staff), 30);
        Ok(())
    }
}
