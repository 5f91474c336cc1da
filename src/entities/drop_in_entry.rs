//! Drop-in entry entity - A walk-in customer waiting without an appointment.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum DropInStatus {
    #[sea_orm(string_value = "waiting")]
    Waiting,
    #[sea_orm(string_value = "serving")]
    Serving,
    #[sea_orm(string_value = "done")]
    Done,
    #[sea_orm(string_value = "left")]
    Left,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "drop_in_entries")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub customer_name: String,
    pub phone: Option<String>,
    pub service_id: Option<i64>,
    pub preferred_staff_id: Option<i64>,
    pub status: DropInStatus,
    pub joined_at: DateTimeUtc,
    pub called_at: Option<DateTimeUtc>,
    /// Staff member who called the customer
    pub served_by: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
