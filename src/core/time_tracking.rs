//! Staff time tracking - the clock-in/clock-out state machine and payroll summaries.
//!
//! Each staff member is `ClockedOut`, `ClockedIn` or `OnBreak`. An open time entry (no
//! `clock_out`) means clocked in; an open entry with `break_start` set means on break. At most one
//! entry per staff member is open at a time. Every operation takes `now` explicitly so the state
//! machine can be driven deterministically from tests and from the auto-logout sweep.

use crate::{
    entities::{Staff, TimeEntry, TimeEntryModel, time_entry},
    errors::{Error, Result},
};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use serde::Serialize;
use std::collections::BTreeMap;

/// How overtime is derived from worked minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OvertimePolicy {
    /// Minutes beyond `threshold_minutes` in one shift are overtime.
    DailyThreshold { threshold_minutes: i64 },
    /// Shifts starting on a Saturday or Sunday are overtime in full; weekdays use the threshold.
    WeekendFull { threshold_minutes: i64 },
}

impl OvertimePolicy {
    /// Parses a policy name (`daily_threshold` or `weekend_full`).
    #[must_use]
    pub fn parse(name: &str, threshold_minutes: i64) -> Option<Self> {
        match name.trim() {
            "daily_threshold" => Some(Self::DailyThreshold { threshold_minutes }),
            "weekend_full" => Some(Self::WeekendFull { threshold_minutes }),
            _ => None,
        }
    }

    /// Overtime for a shift of `work_minutes` that started on `shift_weekday` (salon local).
    #[must_use]
    pub fn overtime_minutes(self, work_minutes: i64, shift_weekday: Weekday) -> i64 {
        match self {
            Self::DailyThreshold { threshold_minutes } => (work_minutes - threshold_minutes).max(0),
            Self::WeekendFull { threshold_minutes } => {
                if matches!(shift_weekday, Weekday::Sat | Weekday::Sun) {
                    work_minutes.max(0)
                } else {
                    (work_minutes - threshold_minutes).max(0)
                }
            }
        }
    }
}

/// Current clock state of one staff member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ClockState {
    ClockedOut,
    ClockedIn { entry: TimeEntryModel },
    OnBreak { entry: TimeEntryModel },
}

/// Whole minutes between two instants, floored. Negative spans count as zero.
#[must_use]
pub fn whole_minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds().div_euclid(60_000).max(0)
}

/// `floor((clock_out - clock_in) / 1 min) - break_minutes`, never below zero.
#[must_use]
pub fn compute_work_minutes(
    clock_in: DateTime<Utc>,
    clock_out: DateTime<Utc>,
    total_break_minutes: i64,
) -> i64 {
    (whole_minutes_between(clock_in, clock_out) - total_break_minutes).max(0)
}

/// UTC bounds `[start, end)` of a calendar date in the salon timezone.
#[must_use]
pub fn local_day_bounds(date: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let to_utc = |day: NaiveDate| {
        let naive = day.and_time(NaiveTime::MIN);
        tz.from_local_datetime(&naive)
            .earliest()
            .map_or_else(|| naive.and_utc(), |local| local.with_timezone(&Utc))
    };
    let next = date.succ_opt().unwrap_or(date);
    (to_utc(date), to_utc(next))
}

async fn open_entry<C>(db: &C, staff_id: i64) -> Result<Option<TimeEntryModel>>
where
    C: ConnectionTrait,
{
    TimeEntry::find()
        .filter(time_entry::Column::StaffId.eq(staff_id))
        .filter(time_entry::Column::ClockOut.is_null())
        .order_by_desc(time_entry::Column::ClockIn)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Returns the staff member's current clock state.
pub async fn current_state(db: &DatabaseConnection, staff_id: i64) -> Result<ClockState> {
    Ok(match open_entry(db, staff_id).await? {
        None => ClockState::ClockedOut,
        Some(entry) if entry.break_start.is_some() => ClockState::OnBreak { entry },
        Some(entry) => ClockState::ClockedIn { entry },
    })
}

/// Opens a new time entry. Fails with `AlreadyClockedIn` when one is open.
#[tracing::instrument(skip(db))]
pub async fn clock_in(db: &DatabaseConnection, staff_id: i64, now: DateTime<Utc>) -> Result<TimeEntryModel> {
    let txn = db.begin().await?;

    let staff = Staff::find_by_id(staff_id)
        .one(&txn)
        .await?
        .ok_or_else(|| Error::not_found("Staff", staff_id))?;
    if !staff.is_active {
        return Err(Error::bad_request(format!("Staff member {staff_id} is deactivated")));
    }
    if open_entry(&txn, staff_id).await?.is_some() {
        return Err(Error::AlreadyClockedIn { staff_id });
    }

    let entry = time_entry::ActiveModel {
        staff_id: Set(staff_id),
        clock_in: Set(now),
        clock_out: Set(None),
        break_start: Set(None),
        total_break_minutes: Set(0),
        work_minutes: Set(None),
        overtime_minutes: Set(None),
        notes: Set(None),
        auto_logged_out: Set(false),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    txn.commit().await?;
    tracing::info!(entry_id = entry.id, "Clocked in");
    Ok(entry)
}

fn close_entry(
    entry: TimeEntryModel,
    now: DateTime<Utc>,
    policy: OvertimePolicy,
    tz: Tz,
    note: Option<String>,
    auto_logged_out: bool,
) -> time_entry::ActiveModel {
    // An open break is ended at clock-out
    let break_minutes = entry.total_break_minutes
        + entry
            .break_start
            .map_or(0, |started| whole_minutes_between(started, now));
    let work = compute_work_minutes(entry.clock_in, now, break_minutes);
    let weekday = entry.clock_in.with_timezone(&tz).weekday();
    let overtime = policy.overtime_minutes(work, weekday);

    let mut active: time_entry::ActiveModel = entry.into();
    active.clock_out = Set(Some(now));
    active.break_start = Set(None);
    active.total_break_minutes = Set(break_minutes);
    active.work_minutes = Set(Some(work));
    active.overtime_minutes = Set(Some(overtime));
    if note.is_some() {
        active.notes = Set(note);
    }
    active.auto_logged_out = Set(auto_logged_out);
    active
}

/// Closes the open entry and computes work and overtime minutes.
#[tracing::instrument(skip(db, policy, tz))]
pub async fn clock_out(
    db: &DatabaseConnection,
    staff_id: i64,
    now: DateTime<Utc>,
    policy: OvertimePolicy,
    tz: Tz,
) -> Result<TimeEntryModel> {
    let entry = open_entry(db, staff_id)
        .await?
        .ok_or(Error::NotClockedIn { staff_id })?;

    let updated = close_entry(entry, now, policy, tz, None, false)
        .update(db)
        .await?;
    tracing::info!(
        entry_id = updated.id,
        work_minutes = updated.work_minutes,
        overtime_minutes = updated.overtime_minutes,
        "Clocked out"
    );
    Ok(updated)
}

/// Starts a break on the open entry.
pub async fn start_break(db: &DatabaseConnection, staff_id: i64, now: DateTime<Utc>) -> Result<TimeEntryModel> {
    let entry = open_entry(db, staff_id)
        .await?
        .ok_or(Error::NotClockedIn { staff_id })?;
    if entry.break_start.is_some() {
        return Err(Error::bad_request(format!(
            "Staff member {staff_id} is already on break"
        )));
    }

    let mut active: time_entry::ActiveModel = entry.into();
    active.break_start = Set(Some(now));
    let updated = active.update(db).await?;
    tracing::debug!(entry_id = updated.id, "Break started");
    Ok(updated)
}

/// Ends the current break, adding its whole minutes to the entry.
pub async fn end_break(db: &DatabaseConnection, staff_id: i64, now: DateTime<Utc>) -> Result<TimeEntryModel> {
    let entry = open_entry(db, staff_id)
        .await?
        .ok_or(Error::NotClockedIn { staff_id })?;
    let Some(started) = entry.break_start else {
        return Err(Error::bad_request(format!(
            "Staff member {staff_id} is not on break"
        )));
    };

    let total = entry.total_break_minutes + whole_minutes_between(started, now);
    let mut active: time_entry::ActiveModel = entry.into();
    active.break_start = Set(None);
    active.total_break_minutes = Set(total);
    let updated = active.update(db).await?;
    tracing::debug!(entry_id = updated.id, total_break_minutes = total, "Break ended");
    Ok(updated)
}

/// Force clocks-out every open entry when the local wall-clock minute equals `cutoff`.
///
/// Meant to run once a minute. A tick that misses the cutoff minute skips auto-logout for that
/// day. Returns the number of entries closed.
pub async fn auto_logout_sweep(
    db: &DatabaseConnection,
    now: DateTime<Utc>,
    cutoff: NaiveTime,
    tz: Tz,
    policy: OvertimePolicy,
) -> Result<usize> {
    let local = now.with_timezone(&tz);
    if local.hour() != cutoff.hour() || local.minute() != cutoff.minute() {
        return Ok(0);
    }

    let open = TimeEntry::find()
        .filter(time_entry::Column::ClockOut.is_null())
        .all(db)
        .await?;
    if open.is_empty() {
        return Ok(0);
    }

    let note = format!("Automatically clocked out at {}", cutoff.format("%H:%M"));
    let txn = db.begin().await?;
    let mut closed = 0;
    for entry in open {
        let staff_id = entry.staff_id;
        close_entry(entry, now, policy, tz, Some(note.clone()), true)
            .update(&txn)
            .await?;
        tracing::info!(staff_id, "Automatically clocked out");
        closed += 1;
    }
    txn.commit().await?;

    Ok(closed)
}

/// Manager correction of a time entry. Work and overtime are recomputed for closed entries.
pub async fn correct_entry(
    db: &DatabaseConnection,
    entry_id: i64,
    correction: EntryCorrection,
    policy: OvertimePolicy,
    tz: Tz,
) -> Result<TimeEntryModel> {
    let entry = TimeEntry::find_by_id(entry_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("TimeEntry", entry_id))?;

    let clock_in = correction.clock_in.unwrap_or(entry.clock_in);
    let clock_out = correction.clock_out.or(entry.clock_out);
    let breaks = correction
        .total_break_minutes
        .unwrap_or(entry.total_break_minutes);
    if breaks < 0 {
        return Err(Error::bad_request("Break minutes cannot be negative"));
    }
    if let Some(out) = clock_out
        && out <= clock_in
    {
        return Err(Error::bad_request("Clock-out must be after clock-in"));
    }

    let mut active: time_entry::ActiveModel = entry.into();
    active.clock_in = Set(clock_in);
    active.clock_out = Set(clock_out);
    active.total_break_minutes = Set(breaks);
    if let Some(out) = clock_out {
        let work = compute_work_minutes(clock_in, out, breaks);
        let weekday = clock_in.with_timezone(&tz).weekday();
        active.break_start = Set(None);
        active.work_minutes = Set(Some(work));
        active.overtime_minutes = Set(Some(policy.overtime_minutes(work, weekday)));
    }
    if let Some(notes) = correction.notes {
        active.notes = Set(Some(notes));
    }

    let updated = active.update(db).await?;
    tracing::info!(entry_id, "Time entry corrected");
    Ok(updated)
}

/// Fields a manager may correct on a time entry
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct EntryCorrection {
    pub clock_in: Option<DateTime<Utc>>,
    pub clock_out: Option<DateTime<Utc>>,
    pub total_break_minutes: Option<i64>,
    pub notes: Option<String>,
}

/// Lists entries whose clock-in falls on local dates `from..=to`.
pub async fn list_entries(
    db: &DatabaseConnection,
    staff_id: Option<i64>,
    from: NaiveDate,
    to: NaiveDate,
    tz: Tz,
) -> Result<Vec<TimeEntryModel>> {
    let (start, _) = local_day_bounds(from, tz);
    let (_, end) = local_day_bounds(to, tz);

    let mut query = TimeEntry::find()
        .filter(time_entry::Column::ClockIn.gte(start))
        .filter(time_entry::Column::ClockIn.lt(end))
        .order_by_asc(time_entry::Column::ClockIn);
    if let Some(staff_id) = staff_id {
        query = query.filter(time_entry::Column::StaffId.eq(staff_id));
    }
    query.all(db).await.map_err(Into::into)
}

/// Payroll summary for one staff member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimesheetRow {
    pub staff_id: i64,
    pub staff_name: String,
    pub shifts: usize,
    pub work_minutes: i64,
    pub overtime_minutes: i64,
    pub auto_logged_out_shifts: usize,
}

/// Totals of closed entries per staff member for local dates `from..=to`.
pub async fn timesheet(
    db: &DatabaseConnection,
    staff_id: Option<i64>,
    from: NaiveDate,
    to: NaiveDate,
    tz: Tz,
) -> Result<Vec<TimesheetRow>> {
    if to < from {
        return Err(Error::bad_request("Timesheet range ends before it starts"));
    }

    let entries = list_entries(db, staff_id, from, to, tz).await?;
    let names: BTreeMap<i64, String> = Staff::find()
        .all(db)
        .await?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();

    let mut rows: BTreeMap<i64, TimesheetRow> = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.clock_out.is_some()) {
        let row = rows.entry(entry.staff_id).or_insert_with(|| TimesheetRow {
            staff_id: entry.staff_id,
            staff_name: names.get(&entry.staff_id).cloned().unwrap_or_default(),
            shifts: 0,
            work_minutes: 0,
            overtime_minutes: 0,
            auto_logged_out_shifts: 0,
        });
        row.shifts += 1;
        row.work_minutes += entry.work_minutes.unwrap_or(0);
        row.overtime_minutes += entry.overtime_minutes.unwrap_or(0);
        if entry.auto_logged_out {
            row.auto_logged_out_shifts += 1;
        }
    }
    Ok(rows.into_values().collect())
}
