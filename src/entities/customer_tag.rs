//! Customer tag entity - Enum labels attached to a customer.
//!
//! `(customer_id, tag)` is unique; the index is created alongside the table in
//! `config::database::create_tables`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Labels a customer can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum CustomerTag {
    #[sea_orm(string_value = "vip")]
    Vip,
    #[sea_orm(string_value = "regular")]
    Regular,
    #[sea_orm(string_value = "new_customer")]
    NewCustomer,
    #[sea_orm(string_value = "no_show_risk")]
    NoShowRisk,
    #[sea_orm(string_value = "allergy")]
    Allergy,
    #[sea_orm(string_value = "prefers_quiet")]
    PrefersQuiet,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "customer_tags")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub customer_id: i64,
    pub tag: CustomerTag,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::customer::Entity",
        from = "Column::CustomerId",
        to = "super::customer::Column::Id"
    )]
    Customer,
}

impl Related<super::customer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Customer.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
