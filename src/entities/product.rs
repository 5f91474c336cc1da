//! Product entity - Retail items sold at the POS.
//!
//! Stock is decremented when an order is created and may go negative; nothing blocks a sale
//! on missing stock.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Product database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    /// Unique identifier for the product
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Name of the product (e.g., "Pomade", "Beard oil")
    pub name: String,
    /// Optional stock keeping unit
    pub sku: Option<String>,
    /// Tax-exclusive unit price
    pub price: Decimal,
    /// Tax rate in percent
    pub tax_rate: Decimal,
    /// Units on hand, may be negative after oversell
    pub stock: i32,
    /// Soft delete flag - inactive products are hidden from the POS
    pub is_active: bool,
    /// When the product was created
    pub created_at: DateTimeUtc,
    /// When the product was last modified
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
