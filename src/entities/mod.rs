//! Entity module - Contains all SeaORM entity definitions for the database.
//! These entities represent the database tables and their relationships.
//! Each entity has a Model struct for data and an Entity struct for operations.

pub mod appointment;
pub mod customer;
pub mod customer_note;
pub mod customer_tag;
pub mod drop_in_entry;
pub mod fiken_sale_attempt;
pub mod fiken_sync_log;
pub mod notification;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod product;
pub mod service;
pub mod setting;
pub mod staff;
pub mod time_entry;

// Re-export specific types to avoid conflicts
pub use appointment::{
    AppointmentStatus, Entity as Appointment, Model as AppointmentModel, PaymentStatus,
};
pub use customer::{Entity as Customer, Model as CustomerModel};
pub use customer_note::{Entity as CustomerNote, Model as CustomerNoteModel};
pub use customer_tag::{CustomerTag, Entity as CustomerTagEntity, Model as CustomerTagModel};
pub use drop_in_entry::{DropInStatus, Entity as DropInEntry, Model as DropInEntryModel};
pub use fiken_sale_attempt::{Entity as FikenSaleAttempt, Model as FikenSaleAttemptModel, SagaStep};
pub use fiken_sync_log::{
    Entity as FikenSyncLog, Model as FikenSyncLogModel, SyncStatus, SyncType,
};
pub use notification::{Entity as Notification, Model as NotificationModel};
pub use order::{Entity as Order, Model as OrderModel, OrderStatus};
pub use order_item::{Entity as OrderItem, ItemType, Model as OrderItemModel};
pub use payment::{Entity as Payment, Model as PaymentModel, PaymentMethod, PaymentState};
pub use product::{Entity as Product, Model as ProductModel};
pub use service::{Entity as Service, Model as ServiceModel};
pub use setting::{Entity as Setting, Model as SettingModel};
pub use staff::{Entity as Staff, Model as StaffModel, SkillLevel, StaffRole};
pub use time_entry::{Entity as TimeEntry, Model as TimeEntryModel};
