//! Staff entity - Everyone who can log in to the salon system.
//!
//! Staff rows carry a role (used by the permission gate), an optional argon2 PIN hash for
//! POS and time-clock login, and a duration multiplier applied to service time estimates.
//! Staff are soft-deactivated via `is_active`; hard deletes are an explicit admin action.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Role of a user in the salon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    #[sea_orm(string_value = "owner")]
    Owner,
    #[sea_orm(string_value = "manager")]
    Manager,
    #[sea_orm(string_value = "barber")]
    Barber,
    #[sea_orm(string_value = "cashier")]
    Cashier,
    #[sea_orm(string_value = "customer")]
    Customer,
}

/// Skill level, shown in the booking UI next to the staff member
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum SkillLevel {
    #[sea_orm(string_value = "junior")]
    Junior,
    #[sea_orm(string_value = "standard")]
    Standard,
    #[sea_orm(string_value = "senior")]
    Senior,
    #[sea_orm(string_value = "master")]
    Master,
}

/// Staff database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "staff")]
pub struct Model {
    /// Unique identifier for the staff member
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Display name
    pub name: String,
    /// Login email, unique when present (used for upsert-on-first-login)
    #[sea_orm(unique)]
    pub email: Option<String>,
    /// Contact phone number
    pub phone: Option<String>,
    /// Role consulted by the permission gate
    pub role: StaffRole,
    /// Argon2 hash of the personal PIN, never serialized
    #[serde(skip_serializing)]
    pub pin_hash: Option<String>,
    /// Skill level
    pub skill_level: SkillLevel,
    /// Multiplier applied to service durations (1.0 = nominal speed)
    pub duration_multiplier: f64,
    /// Soft delete flag
    pub is_active: bool,
    /// When the staff member was created
    pub created_at: DateTimeUtc,
    /// When the staff member was last modified
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One staff member has many appointments
    #[sea_orm(has_many = "super::appointment::Entity")]
    Appointments,
    /// One staff member has many time entries
    #[sea_orm(has_many = "super::time_entry::Entity")]
    TimeEntries,
}

impl Related<super::appointment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Appointments.def()
    }
}

impl Related<super::time_entry::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TimeEntries.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
