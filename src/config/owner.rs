//! Bootstrap owner account from environment variables.
//!
//! On an empty database the service needs one owner who can log in and create everyone
//! else. `OWNER_NAME` and `OWNER_PIN` are read from the environment (usually `.env`).

/// Owner account to create when no owner exists yet
#[derive(Debug, Clone)]
pub struct OwnerBootstrap {
    pub name: String,
    pub pin: String,
}

/// Reads the bootstrap owner from `OWNER_NAME` / `OWNER_PIN`.
///
/// Falls back to a default PIN with a warning so a development database is usable right away.
#[must_use]
pub fn owner_from_env() -> OwnerBootstrap {
    let name = std::env::var("OWNER_NAME").unwrap_or_else(|_| "Owner".to_string());
    let pin = std::env::var("OWNER_PIN").unwrap_or_else(|_| {
        tracing::warn!("OWNER_PIN not set. Using default PIN '0000'. Set OWNER_PIN in production.");
        "0000".to_string()
    });
    OwnerBootstrap { name, pin }
}
