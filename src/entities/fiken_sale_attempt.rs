//! Fiken sale attempt entity - Saga record for pushing one order to Fiken.
//!
//! Each remote step (draft, sale, settle) is persisted as soon as it succeeds so that a retry
//! resumes where the last attempt stopped.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum SagaStep {
    #[sea_orm(string_value = "started")]
    Started,
    #[sea_orm(string_value = "draft_created")]
    DraftCreated,
    #[sea_orm(string_value = "sale_created")]
    SaleCreated,
    #[sea_orm(string_value = "settled")]
    Settled,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "fiken_sale_attempts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub order_id: i64,
    /// Last step that completed successfully
    pub step: SagaStep,
    pub draft_id: Option<i64>,
    pub sale_id: Option<i64>,
    /// Error of the most recent failed attempt, cleared on success
    pub last_error: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
