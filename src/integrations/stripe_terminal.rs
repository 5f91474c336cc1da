//! Stripe Terminal client for in-salon card readers.
//!
//! Stripe takes form-encoded request bodies. The POS flow is: create a `card_present`
//! payment intent for the order, hand it to a reader with `process_payment_intent`, and let the
//! `payment_intent.succeeded` webhook complete the order.

use crate::{
    core::{fiken::to_ore, settings::StripeSettings, webhook::PaymentTarget},
    errors::{Error, Result},
    integrations::http::{read_json, transport_error},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const STRIPE_BASE_URL: &str = "https://api.stripe.com/v1";
const PROVIDER: &str = "stripe";
const CURRENCY: &str = "nok";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reader {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    /// In øre
    pub amount: i64,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct List<T> {
    data: Vec<T>,
}

pub struct StripeTerminalClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
    location_id: Option<String>,
}

impl StripeTerminalClient {
    pub fn new(http: reqwest::Client, secret_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: STRIPE_BASE_URL.to_string(),
            secret_key: secret_key.into(),
            location_id: None,
        }
    }

    /// Fails with `BadRequest` when no secret key is stored.
    pub fn from_settings(http: &reqwest::Client, settings: &StripeSettings) -> Result<Self> {
        let key = settings
            .secret_key
            .as_deref()
            .ok_or_else(|| Error::bad_request("Stripe is not configured: secret key is missing"))?;
        let mut client = Self::new(http.clone(), key);
        client.location_id.clone_from(&settings.location_id);
        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        read_json(PROVIDER, response).await
    }

    async fn post_form<T: for<'de> Deserialize<'de>>(&self, path: &str, form: &[(&str, String)]) -> Result<T> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        read_json(PROVIDER, response).await
    }

    pub async fn list_locations(&self) -> Result<Vec<Location>> {
        let list: List<Location> = self.get("/terminal/locations").await?;
        Ok(list.data)
    }

    pub async fn list_readers(&self) -> Result<Vec<Reader>> {
        let path = match &self.location_id {
            Some(location) => format!("/terminal/readers?location={location}"),
            None => "/terminal/readers".to_string(),
        };
        let list: List<Reader> = self.get(&path).await?;
        Ok(list.data)
    }

    /// Registers a reader with the code shown on its screen.
    pub async fn register_reader(&self, registration_code: &str, label: &str) -> Result<Reader> {
        let location = self
            .location_id
            .clone()
            .ok_or_else(|| Error::bad_request("Stripe location is not configured"))?;
        let reader: Reader = self
            .post_form(
                "/terminal/readers",
                &[
                    ("registration_code", registration_code.to_string()),
                    ("label", label.to_string()),
                    ("location", location),
                ],
            )
            .await?;
        tracing::info!(reader_id = %reader.id, "Registered Stripe reader");
        Ok(reader)
    }

    pub async fn delete_reader(&self, reader_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/terminal/readers/{reader_id}")))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        let _: serde_json::Value = read_json(PROVIDER, response).await?;
        tracing::info!(reader_id, "Deleted Stripe reader");
        Ok(())
    }

    /// Creates a card-present intent carrying `target` as metadata for the webhook.
    pub async fn create_payment_intent(&self, target: PaymentTarget, amount: Decimal) -> Result<PaymentIntent> {
        let intent: PaymentIntent = self
            .post_form("/payment_intents", &payment_intent_form(target, amount))
            .await?;
        tracing::info!(intent_id = %intent.id, reference = %target, "Created Stripe payment intent");
        Ok(intent)
    }

    /// Sends the intent to the reader so the customer can tap or insert their card.
    pub async fn process_payment_intent(&self, reader_id: &str, intent_id: &str) -> Result<Reader> {
        self.post_form(
            &format!("/terminal/readers/{reader_id}/process_payment_intent"),
            &[("payment_intent", intent_id.to_string())],
        )
        .await
    }

    /// Aborts whatever the reader is currently doing.
    pub async fn cancel_reader_action(&self, reader_id: &str) -> Result<Reader> {
        self.post_form(&format!("/terminal/readers/{reader_id}/cancel_action"), &[])
            .await
    }
}

fn payment_intent_form(target: PaymentTarget, amount: Decimal) -> Vec<(&'static str, String)> {
    vec![
        ("amount", to_ore(amount).to_string()),
        ("currency", CURRENCY.to_string()),
        ("payment_method_types[]", "card_present".to_string()),
        ("capture_method", "automatic".to_string()),
        ("metadata[reference]", target.reference()),
        ("description", target.reference()),
    ]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_payment_intent_form_uses_ore_and_reference() {
        let form = payment_intent_form(PaymentTarget::Order(12), Decimal::new(43750, 2));
        assert!(form.contains(&("amount", "43750".to_string())));
        assert!(form.contains(&("metadata[reference]", "ORD-12".to_string())));
        assert!(form.contains(&("currency", "nok".to_string())));
    }

    #[test]
    fn test_from_settings_requires_secret_key() {
        let http = reqwest::Client::new();
        assert!(StripeTerminalClient::from_settings(&http, &StripeSettings::default()).is_err());

        let settings = StripeSettings {
            secret_key: Some("sk_test_1".to_string()),
            location_id: Some("tml_1".to_string()),
            webhook_secret: None,
        };
        let client = StripeTerminalClient::from_settings(&http, &settings).unwrap();
        assert_eq!(client.location_id.as_deref(), Some("tml_1"));
    }

    #[test]
    fn test_reader_list_parses() {
        let list: List<Reader> = serde_json::from_str(
            r#"{"object": "list", "data": [{"id": "tmr_1", "label": "Front desk", "status": "online"}]}"#,
        )
        .unwrap();
        assert_eq!(list.data[0].label.as_deref(), Some("Front desk"));
    }
}
