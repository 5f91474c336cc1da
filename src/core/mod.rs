//! Core business logic - framework-agnostic salon operations.
//!
//! Every operation is a free async function over a `SeaORM` connection returning
//! `errors::Result`. The HTTP layer in `api` and the background jobs in `tasks` are thin
//! callers of these functions.

/// Services and products
pub mod catalog;
/// Customers, tags, notes, merge and erase
pub mod customer;
/// Walk-in queue
pub mod drop_in;
/// Fiken sale saga, daily sync and totals verification
pub mod fiken;
/// Owner notifications
pub mod notification;
/// Checkout, totals, refunds and daily sales
pub mod order;
/// Payment recording and the unpaid sweep
pub mod payment;
/// Role to permission matrix
pub mod permissions;
/// Appointment booking, conflicts, transitions and the slot grid
pub mod scheduler;
/// Typed salon settings
pub mod settings;
/// Staff accounts and PIN login
pub mod staff;
/// Clock-in/out state machine and timesheets
pub mod time_tracking;
/// Provider payment callbacks
pub mod webhook;
