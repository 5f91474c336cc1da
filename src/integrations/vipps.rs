//! Vipps eCom v2 client.
//!
//! Every call needs a short-lived access token. Tokens are cached in a `VippsTokenCache` shared
//! through the application state and refreshed shortly before they expire, so a burst of
//! payments does not fetch one token per request.

use crate::{
    core::{fiken::to_ore, settings::VippsSettings, webhook::PaymentTarget},
    errors::{Error, Result},
    integrations::http::{ensure_success, read_json, transport_error},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

const PROVIDER: &str = "vipps";
/// A cached token is replaced this long before Vipps says it expires
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const SUBSCRIPTION_HEADER: &str = "Ocp-Apim-Subscription-Key";

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

/// Access token cache shared by all Vipps clients.
#[derive(Debug, Clone, Default)]
pub struct VippsTokenCache {
    inner: Arc<Mutex<Option<CachedToken>>>,
}

impl VippsTokenCache {
    /// Drops the cached token, e.g. after the credentials were changed.
    pub async fn clear(&self) {
        *self.inner.lock().await = None;
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Vipps sends this as a string
    #[serde(default)]
    expires_in: serde_json::Value,
}

impl TokenResponse {
    fn lifetime(&self) -> Duration {
        let secs = match &self.expires_in {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        };
        Duration::from_secs(secs.unwrap_or(3600))
    }
}

/// Returned when a payment is initiated
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatedPayment {
    pub order_id: String,
    /// Landing page the customer is redirected to
    pub url: String,
}

struct Credentials<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    subscription_key: &'a str,
    merchant_serial_number: &'a str,
}

pub struct VippsClient {
    http: reqwest::Client,
    settings: VippsSettings,
    tokens: VippsTokenCache,
}

impl VippsClient {
    pub fn new(http: reqwest::Client, settings: VippsSettings, tokens: VippsTokenCache) -> Self {
        Self {
            http,
            settings,
            tokens,
        }
    }

    fn credentials(&self) -> Result<Credentials<'_>> {
        let missing = |name: &str| Error::bad_request(format!("Vipps is not configured: {name} is missing"));
        Ok(Credentials {
            client_id: self.settings.client_id.as_deref().ok_or_else(|| missing("client id"))?,
            client_secret: self
                .settings
                .client_secret
                .as_deref()
                .ok_or_else(|| missing("client secret"))?,
            subscription_key: self
                .settings
                .subscription_key
                .as_deref()
                .ok_or_else(|| missing("subscription key"))?,
            merchant_serial_number: self
                .settings
                .merchant_serial_number
                .as_deref()
                .ok_or_else(|| missing("merchant serial number"))?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.base_url.trim_end_matches('/'))
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.tokens.inner.lock().await;
        if let Some(token) = cached.as_ref()
            && token.is_fresh(Instant::now())
        {
            return Ok(token.token.clone());
        }

        let creds = self.credentials()?;
        let response = self
            .http
            .post(self.url("/accesstoken/get"))
            .header("client_id", creds.client_id)
            .header("client_secret", creds.client_secret)
            .header(SUBSCRIPTION_HEADER, creds.subscription_key)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        let body: TokenResponse = read_json(PROVIDER, response).await?;
        let lifetime = body.lifetime();
        tracing::debug!(lifetime_secs = lifetime.as_secs(), "Fetched Vipps access token");

        *cached = Some(CachedToken {
            token: body.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(body.access_token)
    }

    async fn authorized(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let token = self.access_token().await?;
        let creds = self.credentials()?;
        Ok(self
            .http
            .request(method, self.url(path))
            .bearer_auth(token)
            .header(SUBSCRIPTION_HEADER, creds.subscription_key)
            .header("Merchant-Serial-Number", creds.merchant_serial_number))
    }

    /// Starts a payment for `target`. `target.reference()` becomes the Vipps order id and is
    /// echoed back in the callback.
    #[tracing::instrument(skip(self, mobile_number))]
    pub async fn initiate_payment(
        &self,
        target: PaymentTarget,
        amount: Decimal,
        description: &str,
        mobile_number: Option<&str>,
        fallback_url: &str,
    ) -> Result<InitiatedPayment> {
        let creds = self.credentials()?;
        let callback = self
            .settings
            .callback_url
            .as_deref()
            .ok_or_else(|| Error::bad_request("Vipps is not configured: callback URL is missing"))?;

        let mut body = json!({
            "merchantInfo": {
                "merchantSerialNumber": creds.merchant_serial_number,
                "callbackPrefix": callback,
                "fallBack": fallback_url,
            },
            "transaction": {
                "orderId": target.reference(),
                "amount": to_ore(amount),
                "transactionText": description,
            },
        });
        if let Some(mobile) = mobile_number {
            body["customerInfo"] = json!({ "mobileNumber": mobile.trim_start_matches("+47") });
        }

        let response = self
            .authorized(reqwest::Method::POST, "/ecomm/v2/payments")
            .await?
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        let initiated: InitiatedPayment = read_json(PROVIDER, response).await?;
        tracing::info!(order_id = %initiated.order_id, "Vipps payment initiated");
        Ok(initiated)
    }

    /// Captures a reserved amount.
    pub async fn capture(&self, target: PaymentTarget, amount: Decimal, text: &str) -> Result<serde_json::Value> {
        self.transaction_call(reqwest::Method::POST, target, "capture", Some((amount, text)))
            .await
    }

    /// Cancels a reservation that has not been captured.
    pub async fn cancel(&self, target: PaymentTarget, text: &str) -> Result<serde_json::Value> {
        self.transaction_call(reqwest::Method::PUT, target, "cancel", Some((Decimal::ZERO, text)))
            .await
    }

    /// Refunds a captured amount.
    pub async fn refund(&self, target: PaymentTarget, amount: Decimal, text: &str) -> Result<serde_json::Value> {
        self.transaction_call(reqwest::Method::POST, target, "refund", Some((amount, text)))
            .await
    }

    /// Full payment history as reported by Vipps.
    pub async fn details(&self, target: PaymentTarget) -> Result<serde_json::Value> {
        let path = format!("/ecomm/v2/payments/{}/details", target.reference());
        let response = self
            .authorized(reqwest::Method::GET, &path)
            .await?
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        read_json(PROVIDER, response).await
    }

    async fn transaction_call(
        &self,
        method: reqwest::Method,
        target: PaymentTarget,
        action: &str,
        transaction: Option<(Decimal, &str)>,
    ) -> Result<serde_json::Value> {
        let creds = self.credentials()?;
        let mut body = json!({
            "merchantInfo": { "merchantSerialNumber": creds.merchant_serial_number },
        });
        if let Some((amount, text)) = transaction {
            body["transaction"] = if amount.is_zero() {
                json!({ "transactionText": text })
            } else {
                json!({ "amount": to_ore(amount), "transactionText": text })
            };
        }

        let path = format!("/ecomm/v2/payments/{}/{action}", target.reference());
        let response = self
            .authorized(method, &path)
            .await?
            .header("X-Request-Id", uuid::Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        let response = ensure_success(PROVIDER, response).await?;
        tracing::info!(reference = %target, action, "Vipps transaction call succeeded");
        response
            .json()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_token_freshness_margin() {
        let now = Instant::now();
        let token = CachedToken {
            token: "t".to_string(),
            expires_at: now + Duration::from_secs(120),
        };
        assert!(token.is_fresh(now));
        assert!(!token.is_fresh(now + Duration::from_secs(61)));
    }

    #[test]
    fn test_token_lifetime_accepts_string_or_number() {
        let as_string: TokenResponse =
            serde_json::from_str(r#"{"access_token": "a", "expires_in": "86398"}"#).unwrap();
        assert_eq!(as_string.lifetime(), Duration::from_secs(86398));
        let as_number: TokenResponse =
            serde_json::from_str(r#"{"access_token": "a", "expires_in": 3599}"#).unwrap();
        assert_eq!(as_number.lifetime(), Duration::from_secs(3599));
        let missing: TokenResponse = serde_json::from_str(r#"{"access_token": "a"}"#).unwrap();
        assert_eq!(missing.lifetime(), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_unconfigured_client_rejects_calls() {
        let client = VippsClient::new(
            reqwest::Client::new(),
            VippsSettings::default(),
            VippsTokenCache::default(),
        );
        let result = client.details(PaymentTarget::Appointment(1)).await;
        assert!(matches!(result, Err(Error::BadRequest { .. })));
    }
}
