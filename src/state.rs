//! Shared application state handed to every handler and background job.

use crate::{
    api::{auth::SessionStore, rate_limit::RateLimiter},
    config::AppConfig,
    core::settings::{SalonSettings, SettingsHandle},
    errors::Result,
    integrations::{
        fiken::FikenClient,
        http::build_client,
        stripe_terminal::StripeTerminalClient,
        vipps::{VippsClient, VippsTokenCache},
    },
    tasks::JobGuard,
};
use sea_orm::DatabaseConnection;
use std::{sync::Arc, time::Duration};

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Arc<AppConfig>,
    /// Current runtime salon settings
    pub settings: SettingsHandle,
    /// Shared outbound client with timeouts
    pub http: reqwest::Client,
    pub sessions: SessionStore,
    pub webhook_limiter: RateLimiter,
    pub vipps_tokens: VippsTokenCache,
    /// Held while a Fiken sync runs, scheduled or manual
    pub fiken_sync: JobGuard,
}

impl AppState {
    pub async fn new(db: DatabaseConnection, config: AppConfig) -> Result<Self> {
        let http = build_client(&config.http)?;
        let settings = SettingsHandle::load(&db, config.salon.clone()).await?;
        let sessions = SessionStore::new(chrono::Duration::minutes(config.server.session_ttl_minutes));
        let webhook_limiter = RateLimiter::new(
            config.webhooks.rate_limit_requests,
            Duration::from_secs(config.webhooks.rate_limit_window_secs),
        );

        Ok(Self {
            db,
            config: Arc::new(config),
            settings,
            http,
            sessions,
            webhook_limiter,
            vipps_tokens: VippsTokenCache::default(),
            fiken_sync: JobGuard::new("fiken_sync"),
        })
    }

    /// `None` when the Fiken integration is disabled or missing credentials.
    pub fn fiken_client(&self, settings: &SalonSettings) -> Option<FikenClient> {
        FikenClient::from_settings(&self.http, &settings.fiken)
    }

    pub fn vipps_client(&self, settings: &SalonSettings) -> VippsClient {
        VippsClient::new(self.http.clone(), settings.vipps.clone(), self.vipps_tokens.clone())
    }

    pub fn stripe_client(&self, settings: &SalonSettings) -> Result<StripeTerminalClient> {
        StripeTerminalClient::from_settings(&self.http, &settings.stripe)
    }
}
