//! Salon settings - typed view over the `settings` key-value table.
//!
//! Settings are read into an immutable `SalonSettings` value that callers receive explicitly.
//! `SettingsHandle` keeps the current value for the running service and is refreshed after
//! every write, so there is no module-level cache to go stale.

use crate::{
    config::app::SalonDefaults,
    core::time_tracking::OvertimePolicy,
    entities::{Setting, setting},
    errors::{Error, Result},
};
use chrono::{NaiveTime, Utc};
use chrono_tz::Tz;
use sea_orm::{QueryOrder, Set, prelude::*};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

pub const SALON_NAME: &str = "salon_name";
pub const TIMEZONE: &str = "timezone";
pub const OPENING_TIME: &str = "opening_time";
pub const CLOSING_TIME: &str = "closing_time";
pub const SLOT_INTERVAL_MINUTES: &str = "slot_interval_minutes";
pub const AUTO_LOGOUT_TIME: &str = "auto_logout_time";
pub const OVERTIME_POLICY: &str = "overtime_policy";
pub const OVERTIME_THRESHOLD_MINUTES: &str = "overtime_threshold_minutes";
pub const UNPAID_TIMEOUT_MINUTES: &str = "unpaid_timeout_minutes";
pub const UNIVERSAL_PIN_HASH: &str = "universal_pin_hash";
pub const FIKEN_ENABLED: &str = "fiken_enabled";
pub const FIKEN_API_TOKEN: &str = "fiken_api_token";
pub const FIKEN_COMPANY_SLUG: &str = "fiken_company_slug";
pub const FIKEN_SYNC_TIME: &str = "fiken_sync_time";
pub const FIKEN_PAYMENT_ACCOUNT: &str = "fiken_payment_account";
pub const VIPPS_CLIENT_ID: &str = "vipps_client_id";
pub const VIPPS_CLIENT_SECRET: &str = "vipps_client_secret";
pub const VIPPS_SUBSCRIPTION_KEY: &str = "vipps_subscription_key";
pub const VIPPS_MERCHANT_SERIAL: &str = "vipps_merchant_serial_number";
pub const VIPPS_BASE_URL: &str = "vipps_base_url";
pub const VIPPS_CALLBACK_URL: &str = "vipps_callback_url";
pub const VIPPS_WEBHOOK_SECRET: &str = "vipps_webhook_secret";
pub const STRIPE_SECRET_KEY: &str = "stripe_secret_key";
pub const STRIPE_LOCATION_ID: &str = "stripe_location_id";
pub const STRIPE_WEBHOOK_SECRET: &str = "stripe_webhook_secret";

/// Keys that may be written through the settings API
pub const KNOWN_KEYS: &[&str] = &[
    SALON_NAME,
    TIMEZONE,
    OPENING_TIME,
    CLOSING_TIME,
    SLOT_INTERVAL_MINUTES,
    AUTO_LOGOUT_TIME,
    OVERTIME_POLICY,
    OVERTIME_THRESHOLD_MINUTES,
    UNPAID_TIMEOUT_MINUTES,
    FIKEN_ENABLED,
    FIKEN_API_TOKEN,
    FIKEN_COMPANY_SLUG,
    FIKEN_SYNC_TIME,
    FIKEN_PAYMENT_ACCOUNT,
    VIPPS_CLIENT_ID,
    VIPPS_CLIENT_SECRET,
    VIPPS_SUBSCRIPTION_KEY,
    VIPPS_MERCHANT_SERIAL,
    VIPPS_BASE_URL,
    VIPPS_CALLBACK_URL,
    VIPPS_WEBHOOK_SECRET,
    STRIPE_SECRET_KEY,
    STRIPE_LOCATION_ID,
    STRIPE_WEBHOOK_SECRET,
];

/// Keys whose values are credentials and are never echoed back by the API
pub const SECRET_KEYS: &[&str] = &[
    UNIVERSAL_PIN_HASH,
    FIKEN_API_TOKEN,
    VIPPS_CLIENT_SECRET,
    VIPPS_SUBSCRIPTION_KEY,
    VIPPS_WEBHOOK_SECRET,
    STRIPE_SECRET_KEY,
    STRIPE_WEBHOOK_SECRET,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FikenSettings {
    pub enabled: bool,
    pub api_token: Option<String>,
    pub company_slug: Option<String>,
    /// Local time of the daily automatic sync
    pub sync_time: NaiveTime,
    /// Fiken account code the day's sales are settled against
    pub payment_account: String,
}

impl FikenSettings {
    /// Credentials are present and the integration is switched on
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.enabled && self.api_token.is_some() && self.company_slug.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VippsSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub subscription_key: Option<String>,
    pub merchant_serial_number: Option<String>,
    pub base_url: String,
    pub callback_url: Option<String>,
    pub webhook_secret: Option<String>,
}

impl VippsSettings {
    /// Enough is configured to start an online payment
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.client_id.is_some()
            && self.client_secret.is_some()
            && self.subscription_key.is_some()
            && self.merchant_serial_number.is_some()
            && self.callback_url.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StripeSettings {
    pub secret_key: Option<String>,
    pub location_id: Option<String>,
    pub webhook_secret: Option<String>,
}

/// Typed, immutable snapshot of the salon settings
#[derive(Debug, Clone, PartialEq)]
pub struct SalonSettings {
    pub salon_name: String,
    pub timezone: Tz,
    pub opening_time: NaiveTime,
    pub closing_time: NaiveTime,
    pub slot_interval_minutes: u32,
    pub auto_logout_time: Option<NaiveTime>,
    pub overtime_policy: OvertimePolicy,
    pub unpaid_timeout_minutes: i64,
    pub universal_pin_hash: Option<String>,
    pub fiken: FikenSettings,
    pub vipps: VippsSettings,
    pub stripe: StripeSettings,
}

impl SalonSettings {
    /// Builds settings from config defaults overlaid with stored rows.
    ///
    /// Unparseable stored values are logged and replaced by the default, so a bad edit never
    /// takes the service down.
    #[must_use]
    pub fn from_values(defaults: &SalonDefaults, values: &HashMap<String, String>) -> Self {
        let text = |key: &str, default: &str| -> String {
            values
                .get(key)
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |key: &str| -> Option<String> {
            values
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let timezone = parse_or_default(TIMEZONE, &text(TIMEZONE, &defaults.timezone), |v| {
            v.parse::<Tz>().ok()
        })
        .unwrap_or(chrono_tz::Europe::Oslo);

        let opening_time = parse_or_default(
            OPENING_TIME,
            &text(OPENING_TIME, &defaults.opening_time),
            parse_hhmm,
        )
        .unwrap_or(NaiveTime::MIN);
        let closing_time = parse_or_default(
            CLOSING_TIME,
            &text(CLOSING_TIME, &defaults.closing_time),
            parse_hhmm,
        )
        .unwrap_or(NaiveTime::MIN);

        let slot_interval_minutes = parse_or_default(
            SLOT_INTERVAL_MINUTES,
            &text(
                SLOT_INTERVAL_MINUTES,
                &defaults.slot_interval_minutes.to_string(),
            ),
            |v| v.parse::<u32>().ok().filter(|m| *m > 0),
        )
        .unwrap_or(15);

        // An explicitly stored empty value disables auto-logout
        let auto_logout_time = match values.get(AUTO_LOGOUT_TIME) {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => parse_or_default(AUTO_LOGOUT_TIME, v, parse_hhmm),
            None => defaults.auto_logout_time.as_deref().and_then(parse_hhmm),
        };

        let threshold = parse_or_default(
            OVERTIME_THRESHOLD_MINUTES,
            &text(
                OVERTIME_THRESHOLD_MINUTES,
                &defaults.overtime_threshold_minutes.to_string(),
            ),
            |v| v.parse::<i64>().ok().filter(|m| *m >= 0),
        )
        .unwrap_or(480);
        let overtime_policy = parse_or_default(
            OVERTIME_POLICY,
            &text(OVERTIME_POLICY, &defaults.overtime_policy),
            |v| OvertimePolicy::parse(v, threshold),
        )
        .unwrap_or(OvertimePolicy::DailyThreshold {
            threshold_minutes: threshold,
        });

        let unpaid_timeout_minutes = parse_or_default(
            UNPAID_TIMEOUT_MINUTES,
            &text(
                UNPAID_TIMEOUT_MINUTES,
                &defaults.unpaid_timeout_minutes.to_string(),
            ),
            |v| v.parse::<i64>().ok().filter(|m| *m > 0),
        )
        .unwrap_or(15);

        let fiken = FikenSettings {
            enabled: text(FIKEN_ENABLED, "false") == "true",
            api_token: optional(FIKEN_API_TOKEN),
            company_slug: optional(FIKEN_COMPANY_SLUG),
            sync_time: parse_or_default(
                FIKEN_SYNC_TIME,
                &text(FIKEN_SYNC_TIME, &defaults.fiken_sync_time),
                parse_hhmm,
            )
            .unwrap_or(NaiveTime::MIN),
            payment_account: text(FIKEN_PAYMENT_ACCOUNT, "1920:10001"),
        };

        let vipps = VippsSettings {
            client_id: optional(VIPPS_CLIENT_ID),
            client_secret: optional(VIPPS_CLIENT_SECRET),
            subscription_key: optional(VIPPS_SUBSCRIPTION_KEY),
            merchant_serial_number: optional(VIPPS_MERCHANT_SERIAL),
            base_url: text(VIPPS_BASE_URL, "https://api.vipps.no"),
            callback_url: optional(VIPPS_CALLBACK_URL),
            webhook_secret: optional(VIPPS_WEBHOOK_SECRET),
        };

        let stripe = StripeSettings {
            secret_key: optional(STRIPE_SECRET_KEY),
            location_id: optional(STRIPE_LOCATION_ID),
            webhook_secret: optional(STRIPE_WEBHOOK_SECRET),
        };

        Self {
            salon_name: text(SALON_NAME, &defaults.name),
            timezone,
            opening_time,
            closing_time,
            slot_interval_minutes,
            auto_logout_time,
            overtime_policy,
            unpaid_timeout_minutes,
            universal_pin_hash: optional(UNIVERSAL_PIN_HASH),
            fiken,
            vipps,
            stripe,
        }
    }
}

fn parse_or_default<T>(key: &str, value: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let parsed = parse(value.trim());
    if parsed.is_none() {
        tracing::warn!(key, value, "Ignoring invalid setting value");
    }
    parsed
}

/// Parses an `HH:MM` wall-clock time.
#[must_use]
pub fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// Reads all setting rows as a map.
pub async fn get_all_values<C>(db: &C) -> Result<HashMap<String, String>>
where
    C: ConnectionTrait,
{
    let rows = Setting::find()
        .order_by_asc(setting::Column::Key)
        .all(db)
        .await?;
    Ok(rows.into_iter().map(|row| (row.key, row.value)).collect())
}

/// Retrieves a single setting value.
pub async fn get_setting<C>(db: &C, key: &str) -> Result<Option<String>>
where
    C: ConnectionTrait,
{
    let row = Setting::find()
        .filter(setting::Column::Key.eq(key))
        .one(db)
        .await?;
    Ok(row.map(|r| r.value))
}

/// Sets or updates a value in the settings table (UPSERT behavior).
pub async fn set_setting<C>(db: &C, key: &str, value: &str) -> Result<()>
where
    C: ConnectionTrait,
{
    let now = Utc::now();

    let existing = Setting::find()
        .filter(setting::Column::Key.eq(key))
        .one(db)
        .await?;

    if let Some(row) = existing {
        let mut active_model: setting::ActiveModel = row.into();
        active_model.value = Set(value.to_string());
        active_model.updated_at = Set(now);
        active_model.update(db).await?;
    } else {
        let new_row = setting::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.to_string()),
            updated_at: Set(now),
            ..Default::default()
        };
        new_row.insert(db).await?;
    }

    if SECRET_KEYS.contains(&key) {
        tracing::info!(key, "Updated secret setting");
    } else {
        tracing::info!(key, value, "Updated setting");
    }
    Ok(())
}

/// Validates and stores a setting written through the API.
///
/// Only `KNOWN_KEYS` are accepted and time/number/timezone values must parse; an empty value
/// clears a credential (or disables auto-logout).
pub async fn update_setting(db: &DatabaseConnection, key: &str, value: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        return Err(Error::bad_request(format!("Unknown setting '{key}'")));
    }
    let value = value.trim();
    let valid = match key {
        TIMEZONE => value.parse::<Tz>().is_ok(),
        OPENING_TIME | CLOSING_TIME | FIKEN_SYNC_TIME => parse_hhmm(value).is_some(),
        AUTO_LOGOUT_TIME => value.is_empty() || parse_hhmm(value).is_some(),
        SLOT_INTERVAL_MINUTES | UNPAID_TIMEOUT_MINUTES => {
            value.parse::<u32>().is_ok_and(|m| m > 0)
        }
        OVERTIME_THRESHOLD_MINUTES => value.parse::<u32>().is_ok(),
        OVERTIME_POLICY => OvertimePolicy::parse(value, 0).is_some(),
        FIKEN_ENABLED => value == "true" || value == "false",
        _ => true,
    };
    if !valid {
        return Err(Error::bad_request(format!(
            "Invalid value '{value}' for setting '{key}'"
        )));
    }
    set_setting(db, key, value).await
}

/// Loads the current settings snapshot from the database.
pub async fn load_settings<C>(db: &C, defaults: &SalonDefaults) -> Result<SalonSettings>
where
    C: ConnectionTrait,
{
    let values = get_all_values(db).await?;
    Ok(SalonSettings::from_values(defaults, &values))
}

/// Shared handle to the current settings snapshot.
#[derive(Clone)]
pub struct SettingsHandle {
    defaults: Arc<SalonDefaults>,
    current: Arc<RwLock<Arc<SalonSettings>>>,
}

impl SettingsHandle {
    /// Loads the initial snapshot.
    pub async fn load(db: &DatabaseConnection, defaults: SalonDefaults) -> Result<Self> {
        let settings = load_settings(db, &defaults).await?;
        Ok(Self {
            defaults: Arc::new(defaults),
            current: Arc::new(RwLock::new(Arc::new(settings))),
        })
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub async fn current(&self) -> Arc<SalonSettings> {
        Arc::clone(&*self.current.read().await)
    }

    /// Re-reads the settings table and swaps in the new snapshot.
    pub async fn refresh(&self, db: &DatabaseConnection) -> Result<Arc<SalonSettings>> {
        let settings = Arc::new(load_settings(db, &self.defaults).await?);
        *self.current.write().await = Arc::clone(&settings);
        tracing::debug!("Salon settings refreshed");
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::setup_test_db;

    #[test]
    fn test_defaults_without_rows() {
        let settings = SalonSettings::from_values(&SalonDefaults::default(), &HashMap::new());
        assert_eq!(settings.timezone, chrono_tz::Europe::Oslo);
        assert_eq!(settings.slot_interval_minutes, 15);
        assert_eq!(
            settings.overtime_policy,
            OvertimePolicy::DailyThreshold {
                threshold_minutes: 480
            }
        );
        assert_eq!(settings.auto_logout_time, parse_hhmm("23:00"));
        assert!(!settings.fiken.is_ready());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let mut values = HashMap::new();
        values.insert(SLOT_INTERVAL_MINUTES.to_string(), "zero".to_string());
        values.insert(OPENING_TIME.to_string(), "25:99".to_string());
        values.insert(AUTO_LOGOUT_TIME.to_string(), String::new());
        let settings = SalonSettings::from_values(&SalonDefaults::default(), &values);
        assert_eq!(settings.slot_interval_minutes, 15);
        assert_eq!(settings.opening_time, NaiveTime::MIN);
        assert_eq!(settings.auto_logout_time, None);
    }

    #[tokio::test]
    async fn test_update_setting_validates_and_refreshes() -> Result<()> {
        let db = setup_test_db().await?;
        let handle = SettingsHandle::load(&db, SalonDefaults::default()).await?;

        assert!(matches!(
            update_setting(&db, "not_a_key", "1").await,
            Err(Error::BadRequest { .. })
        ));
        assert!(matches!(
            update_setting(&db, OPENING_TIME, "nine").await,
            Err(Error::BadRequest { .. })
        ));

        update_setting(&db, SLOT_INTERVAL_MINUTES, "30").await?;
        update_setting(&db, SLOT_INTERVAL_MINUTES, "20").await?;
        assert_eq!(handle.current().await.slot_interval_minutes, 15);

        let refreshed = handle.refresh(&db).await?;
        assert_eq!(refreshed.slot_interval_minutes, 20);
        assert_eq!(handle.current().await.slot_interval_minutes, 20);
        assert_eq!(
            get_setting(&db, SLOT_INTERVAL_MINUTES).await?,
            Some("20".to_string())
        );
        Ok(())
    }
}
