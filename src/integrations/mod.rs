//! Outbound clients for the salon's external providers.

/// Fiken accounting API
pub mod fiken;
/// Shared client construction and upstream error mapping
pub mod http;
/// Stripe Terminal card readers
pub mod stripe_terminal;
/// Vipps eCom payments
pub mod vipps;
