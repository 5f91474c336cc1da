//! Time entry entity - One clock-in/clock-out shift of a staff member.
//!
//! An entry is "open" while `clock_out` is None. `core::time_tracking` keeps at most one open
//! entry per staff member.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "time_entries")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub staff_id: i64,
    pub clock_in: DateTimeUtc,
    pub clock_out: Option<DateTimeUtc>,
    /// Start of the currently running break, if any
    pub break_start: Option<DateTimeUtc>,
    /// Whole minutes of finished breaks
    pub total_break_minutes: i64,
    /// Computed at clock-out
    pub work_minutes: Option<i64>,
    /// Computed at clock-out under the configured overtime policy
    pub overtime_minutes: Option<i64>,
    pub notes: Option<String>,
    pub auto_logged_out: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::staff::Entity",
        from = "Column::StaffId",
        to = "super::staff::Column::Id"
    )]
    Staff,
}

impl Related<super::staff::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Staff.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
