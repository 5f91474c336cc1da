//! Owner notifications - failures the owner should see the next time they open the app.

use crate::{
    entities::{Notification, NotificationModel, notification},
    errors::{Error, Result},
};
use chrono::Utc;
use sea_orm::{QueryOrder, QuerySelect, Set, prelude::*, sea_query::Expr};

/// Stores a notification for the owner.
pub async fn notify_owner<C>(db: &C, title: &str, body: &str) -> Result<NotificationModel>
where
    C: ConnectionTrait,
{
    let created = notification::ActiveModel {
        title: Set(title.to_string()),
        body: Set(body.to_string()),
        is_read: Set(false),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await?;
    tracing::info!(notification_id = created.id, title, "Owner notified");
    Ok(created)
}

/// Newest first.
pub async fn list_notifications(
    db: &DatabaseConnection,
    unread_only: bool,
    limit: u64,
) -> Result<Vec<NotificationModel>> {
    let mut query = Notification::find()
        .order_by_desc(notification::Column::CreatedAt)
        .order_by_desc(notification::Column::Id);
    if unread_only {
        query = query.filter(notification::Column::IsRead.eq(false));
    }
    query.limit(limit).all(db).await.map_err(Into::into)
}

pub async fn mark_read(db: &DatabaseConnection, notification_id: i64) -> Result<NotificationModel> {
    let existing = Notification::find_by_id(notification_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("Notification", notification_id))?;
    let mut active: notification::ActiveModel = existing.into();
    active.is_read = Set(true);
    active.update(db).await.map_err(Into::into)
}

/// Returns how many notifications were marked.
pub async fn mark_all_read(db: &DatabaseConnection) -> Result<u64> {
    let result = Notification::update_many()
        .col_expr(notification::Column::IsRead, Expr::value(true))
        .filter(notification::Column::IsRead.eq(false))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::setup_test_db;

    #[tokio::test]
    async fn test_notify_and_mark_read() -> Result<()> {
        let db = setup_test_db().await?;
        let first = notify_owner(&db, "Fiken sync failed", "timeout").await?;
        notify_owner(&db, "Fiken sync failed", "401").await?;

        assert_eq!(list_notifications(&db, true, 50).await?.len(), 2);
        mark_read(&db, first.id).await?;
        assert_eq!(list_notifications(&db, true, 50).await?.len(), 1);
        assert_eq!(mark_all_read(&db).await?, 1);
        assert!(list_notifications(&db, true, 50).await?.is_empty());
        assert_eq!(list_notifications(&db, false, 50).await?.len(), 2);
        Ok(())
    }
}
