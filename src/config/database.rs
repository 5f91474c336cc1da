//! Database configuration module for Salon Desk.
//!
//! This module handles `SQLite` database connection and table creation using `SeaORM`.
//! Tables are generated from the entity definitions with `Schema::create_table_from_entity`,
//! so the schema always matches the Rust structs. Composite unique constraints that SeaORM
//! cannot express on the entity (customer tags) are added as explicit indexes.

use crate::entities::{
    Appointment, Customer, CustomerNote, CustomerTagEntity, DropInEntry, FikenSaleAttempt,
    FikenSyncLog, Notification, Order, OrderItem, Payment, Product, Service, Setting, Staff,
    TimeEntry, customer_tag,
};
use crate::errors::Result;
use sea_orm::{
    ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema, sea_query::Index,
};

/// Default database location when neither `DATABASE_URL` nor the config file name one.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/salon.sqlite?mode=rwc";

/// Establishes a connection to the `SQLite` database at `database_url`.
///
/// The parent directory of a file-backed database is created first so a fresh checkout can
/// start without manual setup.
pub async fn create_connection(database_url: &str) -> Result<DatabaseConnection> {
    ensure_sqlite_dir(database_url)?;
    tracing::debug!(url = database_url, "Connecting to database");
    Database::connect(database_url).await.map_err(Into::into)
}

fn ensure_sqlite_dir(database_url: &str) -> std::io::Result<()> {
    let Some(path) = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
    else {
        return Ok(());
    };

    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }

    if let Some(parent) = std::path::Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

async fn create_table<E>(db: &DatabaseConnection, schema: &Schema, entity: E) -> Result<()>
where
    E: EntityTrait,
{
    let builder = db.get_database_backend();
    let mut statement = schema.create_table_from_entity(entity);
    statement.if_not_exists();
    db.execute(builder.build(&statement)).await?;
    Ok(())
}

/// Creates all necessary database tables using `SeaORM`'s schema generation from entity definitions.
///
/// Safe to call on every start: tables and indexes are only created when missing.
pub async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    // Parents before children so foreign keys resolve
    create_table(db, &schema, Staff).await?;
    create_table(db, &schema, Customer).await?;
    create_table(db, &schema, Service).await?;
    create_table(db, &schema, Product).await?;
    create_table(db, &schema, Appointment).await?;
    create_table(db, &schema, CustomerNote).await?;
    create_table(db, &schema, CustomerTagEntity).await?;
    create_table(db, &schema, Order).await?;
    create_table(db, &schema, OrderItem).await?;
    create_table(db, &schema, Payment).await?;
    create_table(db, &schema, TimeEntry).await?;
    create_table(db, &schema, FikenSyncLog).await?;
    create_table(db, &schema, FikenSaleAttempt).await?;
    create_table(db, &schema, Setting).await?;
    create_table(db, &schema, Notification).await?;
    create_table(db, &schema, DropInEntry).await?;

    let tag_index = Index::create()
        .name("idx_customer_tags_customer_tag")
        .table(CustomerTagEntity)
        .col(customer_tag::Column::CustomerId)
        .col(customer_tag::Column::Tag)
        .unique()
        .if_not_exists()
        .to_owned();
    db.execute(builder.build(&tag_index)).await?;

    Ok(())
}
