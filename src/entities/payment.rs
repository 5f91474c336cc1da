//! Payment entity - Money received (or expected) for an order or an appointment.
//!
//! Cash and gift card payments are captured on creation. Vipps and Stripe payments start
//! `initiated` and are moved forward only by provider webhooks or the unpaid sweep.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "vipps")]
    Vipps,
    #[sea_orm(string_value = "stripe")]
    Stripe,
    #[sea_orm(string_value = "cash")]
    Cash,
    #[sea_orm(string_value = "gift_card")]
    GiftCard,
}

impl PaymentMethod {
    /// Whether the payment is confirmed asynchronously by a provider callback
    #[must_use]
    pub const fn is_provider(self) -> bool {
        matches!(self, Self::Vipps | Self::Stripe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "initiated")]
    Initiated,
    #[sea_orm(string_value = "authorized")]
    Authorized,
    #[sea_orm(string_value = "captured")]
    Captured,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "expired")]
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub order_id: Option<i64>,
    pub appointment_id: Option<i64>,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub status: PaymentState,
    /// `APT-n` / `ORD-n` reference or the provider's transaction id
    pub provider_reference: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
