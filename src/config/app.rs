//! Application configuration loading from config.toml
//!
//! `config.toml` holds boot-time settings (server port, database URL, HTTP client timeout,
//! webhook limits) plus the defaults for the runtime salon settings and the catalog used to
//! seed an empty database. Every section is optional; missing values fall back to the
//! defaults below. Environment variables override the file where noted in `main`.

use crate::errors::{Error, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Configuration structure representing the entire config.toml file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub webhooks: WebhookConfig,
    /// Defaults for the runtime settings stored in the `settings` table
    pub salon: SalonDefaults,
    /// Services seeded when the catalog is empty
    pub services: Vec<ServiceSeed>,
    /// Products seeded when the catalog is empty
    pub products: Vec<ProductSeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Lifetime of a PIN login session
    pub session_ttl_minutes: i64,
    /// Requests served at once; the rest wait
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            session_ttl_minutes: 12 * 60,
            max_concurrent_requests: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: super::database::DEFAULT_DATABASE_URL.to_string(),
        }
    }
}

/// Outbound HTTP budget for Fiken, Vipps and Stripe calls
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Reject unsigned webhooks when no secret is configured instead of accepting them
    pub require_signature: bool,
    pub rate_limit_requests: usize,
    pub rate_limit_window_secs: u64,
    /// Key the rate limit on the first `X-Forwarded-For` entry. Only enable behind a proxy
    /// that overwrites the header.
    pub trust_forwarded_for: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            require_signature: false,
            rate_limit_requests: 30,
            rate_limit_window_secs: 60,
            trust_forwarded_for: false,
        }
    }
}

/// Defaults for `core::settings::SalonSettings`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SalonDefaults {
    pub name: String,
    pub timezone: String,
    pub opening_time: String,
    pub closing_time: String,
    pub slot_interval_minutes: u32,
    pub auto_logout_time: Option<String>,
    /// `daily_threshold` or `weekend_full`
    pub overtime_policy: String,
    pub overtime_threshold_minutes: i64,
    pub unpaid_timeout_minutes: i64,
    pub fiken_sync_time: String,
}

impl Default for SalonDefaults {
    fn default() -> Self {
        Self {
            name: "Salon".to_string(),
            timezone: "Europe/Oslo".to_string(),
            opening_time: "09:00".to_string(),
            closing_time: "18:00".to_string(),
            slot_interval_minutes: 15,
            auto_logout_time: Some("23:00".to_string()),
            overtime_policy: "daily_threshold".to_string(),
            overtime_threshold_minutes: 480,
            unpaid_timeout_minutes: 15,
            fiken_sync_time: "23:30".to_string(),
        }
    }
}

/// Configuration for a single seeded service
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSeed {
    pub name: String,
    pub duration_minutes: i32,
    pub price: Decimal,
    #[serde(default = "default_tax_rate")]
    pub tax_rate: Decimal,
}

/// Configuration for a single seeded product
#[derive(Debug, Clone, Deserialize)]
pub struct ProductSeed {
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    pub price: Decimal,
    #[serde(default = "default_tax_rate")]
    pub tax_rate: Decimal,
    #[serde(default)]
    pub stock: i32,
}

fn default_tax_rate() -> Decimal {
    Decimal::from(25)
}

/// Loads application configuration from a TOML file
///
/// # Errors
/// Returns an error if:
/// - The file cannot be read
/// - The TOML syntax is invalid
/// - A field has the wrong type
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
        message: format!("Failed to read config file {}: {e}", path.as_ref().display()),
    })?;

    toml::from_str(&contents).map_err(|e| Error::Config {
        message: format!("Failed to parse config.toml: {e}"),
    })
}

/// Loads the configuration from `path`, falling back to defaults when the file is absent.
pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    if path.as_ref().exists() {
        load_config(path)
    } else {
        tracing::warn!(
            path = %path.as_ref().display(),
            "Config file not found, using built-in defaults"
        );
        Ok(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            [server]
            port = 9090

            [salon]
            name = "Klipp & Stell"
            slot_interval_minutes = 30
            overtime_policy = "weekend_full"

            [[services]]
            name = "Herreklipp"
            duration_minutes = 30
            price = "350.00"

            [[products]]
            name = "Pomade"
            price = "150.00"
            tax_rate = "25"
            stock = 12
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.salon.name, "Klipp & Stell");
        assert_eq!(config.salon.slot_interval_minutes, 30);
        assert_eq!(config.salon.timezone, "Europe/Oslo");
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].price, Decimal::new(35000, 2));
        assert_eq!(config.services[0].tax_rate, Decimal::from(25));
        assert_eq!(config.products[0].stock, 12);
        assert_eq!(config.webhooks.rate_limit_requests, 30);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.http.timeout_secs, 15);
        assert!(config.services.is_empty());
        assert!(!config.webhooks.require_signature);
    }
}
