//! Drop-in queue - walk-in customers waiting without an appointment.
//!
//! The queue is FIFO. When a staff member calls the next customer, entries that asked for that
//! staff member are served first; otherwise the oldest entry without a preference is taken.
//! Entries waiting for someone else are skipped.

use crate::{
    entities::{DropInEntry, DropInEntryModel, DropInStatus, drop_in_entry},
    errors::{Error, Result},
};
use chrono::{DateTime, Utc};
use sea_orm::{QueryOrder, Set, prelude::*};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JoinQueue {
    pub customer_name: String,
    pub phone: Option<String>,
    pub service_id: Option<i64>,
    pub preferred_staff_id: Option<i64>,
}

pub async fn join_queue(db: &DatabaseConnection, input: JoinQueue, now: DateTime<Utc>) -> Result<DropInEntryModel> {
    let name = input.customer_name.trim();
    if name.is_empty() {
        return Err(Error::bad_request("Customer name cannot be empty"));
    }

    let entry = drop_in_entry::ActiveModel {
        customer_name: Set(name.to_string()),
        phone: Set(input.phone.filter(|p| !p.trim().is_empty())),
        service_id: Set(input.service_id),
        preferred_staff_id: Set(input.preferred_staff_id),
        status: Set(DropInStatus::Waiting),
        joined_at: Set(now),
        called_at: Set(None),
        served_by: Set(None),
        ..Default::default()
    }
    .insert(db)
    .await?;
    tracing::info!(entry_id = entry.id, "Customer joined drop-in queue");
    Ok(entry)
}

/// Waiting entries, oldest first.
pub async fn list_waiting(db: &DatabaseConnection) -> Result<Vec<DropInEntryModel>> {
    DropInEntry::find()
        .filter(drop_in_entry::Column::Status.eq(DropInStatus::Waiting))
        .order_by_asc(drop_in_entry::Column::JoinedAt)
        .order_by_asc(drop_in_entry::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Calls the next customer for `staff_id`. Returns `None` when nobody is waiting for them.
pub async fn call_next(db: &DatabaseConnection, staff_id: i64, now: DateTime<Utc>) -> Result<Option<DropInEntryModel>> {
    let waiting = list_waiting(db).await?;
    let next = waiting
        .iter()
        .position(|e| e.preferred_staff_id == Some(staff_id))
        .or_else(|| waiting.iter().position(|e| e.preferred_staff_id.is_none()));

    let Some(index) = next else {
        return Ok(None);
    };
    let entry = waiting.into_iter().nth(index);
    let Some(entry) = entry else {
        return Ok(None);
    };

    let mut active: drop_in_entry::ActiveModel = entry.into();
    active.status = Set(DropInStatus::Serving);
    active.called_at = Set(Some(now));
    active.served_by = Set(Some(staff_id));
    let updated = active.update(db).await?;
    tracing::info!(entry_id = updated.id, staff_id, "Called drop-in customer");
    Ok(Some(updated))
}

async fn set_status(
    db: &DatabaseConnection,
    entry_id: i64,
    allowed_from: &[DropInStatus],
    status: DropInStatus,
) -> Result<DropInEntryModel> {
    let entry = DropInEntry::find_by_id(entry_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("DropInEntry", entry_id))?;
    if !allowed_from.contains(&entry.status) {
        return Err(Error::bad_request(format!(
            "Drop-in entry {entry_id} is {:?} and cannot become {status:?}",
            entry.status
        )));
    }
    let mut active: drop_in_entry::ActiveModel = entry.into();
    active.status = Set(status);
    active.update(db).await.map_err(Into::into)
}

/// Marks a served entry done.
pub async fn finish(db: &DatabaseConnection, entry_id: i64) -> Result<DropInEntryModel> {
    set_status(db, entry_id, &[DropInStatus::Serving], DropInStatus::Done).await
}

/// Removes a customer who gave up waiting.
pub async fn leave(db: &DatabaseConnection, entry_id: i64) -> Result<DropInEntryModel> {
    set_status(db, entry_id, &[DropInStatus::Waiting], DropInStatus::Left).await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::setup_test_db;
    use chrono::Duration;

    fn walk_in(name: &str, preferred_staff_id: Option<i64>) -> JoinQueue {
        JoinQueue {
            customer_name: name.to_string(),
            phone: None,
            service_id: None,
            preferred_staff_id,
        }
    }

    #[tokio::test]
    async fn test_call_next_prefers_requested_staff() -> Result<()> {
        let db = setup_test_db().await?;
        let t0 = Utc::now();
        join_queue(&db, walk_in("Anyone", None), t0).await?;
        join_queue(&db, walk_in("Wants Kari", Some(2)), t0 + Duration::minutes(1)).await?;
        join_queue(&db, walk_in("Wants Ola", Some(1)), t0 + Duration::minutes(2)).await?;

        let for_ola = call_next(&db, 1, t0 + Duration::minutes(3)).await?.unwrap();
        assert_eq!(for_ola.customer_name, "Wants Ola");
        assert_eq!(for_ola.served_by, Some(1));

        let next_for_ola = call_next(&db, 1, t0 + Duration::minutes(4)).await?.unwrap();
        assert_eq!(next_for_ola.customer_name, "Anyone");

        // Only someone waiting for Kari is left
        assert!(call_next(&db, 3, t0 + Duration::minutes(5)).await?.is_none());
        assert_eq!(list_waiting(&db).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_finish_and_leave_transitions() -> Result<()> {
        let db = setup_test_db().await?;
        let now = Utc::now();
        let waiting = join_queue(&db, walk_in("Per", None), now).await?;

        assert!(matches!(finish(&db, waiting.id).await, Err(Error::BadRequest { .. })));
        let called = call_next(&db, 1, now).await?.unwrap();
        assert_eq!(finish(&db, called.id).await?.status, DropInStatus::Done);

        let other = join_queue(&db, walk_in("Kari", None), now).await?;
        assert_eq!(leave(&db, other.id).await?.status, DropInStatus::Left);
        assert!(list_waiting(&db).await?.is_empty());
        Ok(())
    }
}
