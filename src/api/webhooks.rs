//! Vipps and Stripe payment callbacks.
//!
//! POST /api/webhooks/vipps and POST /api/webhooks/stripe take the raw body so the HMAC can be
//! checked before anything is parsed. Once the signature and payload are accepted the handler
//! always answers 200, even if applying the callback fails; the provider would otherwise keep
//! retrying a callback we cannot process. Failures are logged.

use crate::{
    core::webhook::{self, CallbackOutcome},
    state::AppState,
};
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Stripe events older than this are rejected as replays
const STRIPE_TOLERANCE_SECS: i64 = 300;

type WebhookResponse = (StatusCode, Json<Value>);

fn reject(status: StatusCode, message: &str) -> WebhookResponse {
    (status, Json(json!({ "error": message })))
}

fn accepted() -> WebhookResponse {
    (StatusCode::OK, Json(json!({ "received": true })))
}

/// Checks a hex HMAC-SHA256 of the raw body.
pub fn verify_vipps_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Checks a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=<hex>]`) against
/// `"{t}.{body}"` and rejects timestamps more than five minutes from `now`.
pub fn verify_stripe_signature(payload: &[u8], header: &str, secret: &str, now: i64) -> Result<(), &'static str> {
    let mut timestamp = "";
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = t;
        } else if let Some(v) = part.strip_prefix("v1=") {
            signatures.push(v);
        }
    }
    if timestamp.is_empty() || signatures.is_empty() {
        return Err("Invalid Stripe-Signature header");
    }

    let body = std::str::from_utf8(payload).map_err(|_| "Payload is not UTF-8")?;
    let signed_payload = format!("{timestamp}.{body}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "HMAC key error")?;
    mac.update(signed_payload.as_bytes());

    let matched = signatures.iter().any(|sig| {
        hex::decode(sig).is_ok_and(|bytes| mac.clone().verify_slice(&bytes).is_ok())
    });
    if !matched {
        return Err("Webhook signature mismatch");
    }

    let ts: i64 = timestamp.parse().map_err(|_| "Invalid timestamp")?;
    if (now - ts).abs() > STRIPE_TOLERANCE_SECS {
        return Err("Webhook timestamp outside tolerance");
    }
    Ok(())
}

/// Decides whether an unsigned request may pass when no secret is configured.
fn unsigned_allowed(state: &AppState, provider: &str) -> bool {
    if state.config.webhooks.require_signature {
        tracing::warn!(provider, "Rejecting webhook: no secret configured and signatures are required");
        false
    } else {
        tracing::warn!(provider, "Accepting unsigned webhook: no secret configured");
        true
    }
}

async fn apply(state: &AppState, reference: &str, outcome: CallbackOutcome, transaction_id: Option<&str>) {
    if let Err(error) = webhook::apply_payment_callback(&state.db, reference, outcome, transaction_id).await {
        tracing::error!(reference, ?outcome, %error, "Failed to apply payment callback");
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VippsCallback {
    order_id: String,
    transaction_info: VippsTransactionInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VippsTransactionInfo {
    status: String,
    #[serde(default)]
    transaction_id: Option<String>,
}

pub async fn vipps(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> WebhookResponse {
    let settings = state.settings.current().await;
    match settings.vipps.webhook_secret.as_deref() {
        Some(secret) => {
            let signature = headers
                .get("x-vipps-signature")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if !verify_vipps_signature(&body, signature, secret) {
                tracing::warn!("Vipps webhook signature verification failed");
                return reject(StatusCode::UNAUTHORIZED, "Invalid signature");
            }
        }
        None if !unsigned_allowed(&state, "vipps") => {
            return reject(StatusCode::UNAUTHORIZED, "Signature required");
        }
        None => {}
    }

    let callback: VippsCallback = match serde_json::from_slice(&body) {
        Ok(callback) => callback,
        Err(error) => {
            tracing::warn!(%error, "Malformed Vipps callback");
            return reject(StatusCode::BAD_REQUEST, "Malformed payload");
        }
    };
    tracing::info!(
        order_id = %callback.order_id,
        status = %callback.transaction_info.status,
        "Received Vipps callback"
    );

    match webhook::vipps_outcome(&callback.transaction_info.status) {
        Some(outcome) => {
            apply(
                &state,
                &callback.order_id,
                outcome,
                callback.transaction_info.transaction_id.as_deref(),
            )
            .await;
        }
        None => tracing::debug!(status = %callback.transaction_info.status, "Ignoring Vipps status"),
    }
    accepted()
}

pub async fn stripe(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> WebhookResponse {
    let settings = state.settings.current().await;
    match settings.stripe.webhook_secret.as_deref() {
        Some(secret) => {
            let Some(header) = headers.get("stripe-signature").and_then(|v| v.to_str().ok()) else {
                tracing::warn!("Missing Stripe-Signature header");
                return reject(StatusCode::UNAUTHORIZED, "Missing signature");
            };
            if let Err(error) = verify_stripe_signature(&body, header, secret, chrono::Utc::now().timestamp()) {
                tracing::warn!(error, "Stripe webhook signature verification failed");
                return reject(StatusCode::UNAUTHORIZED, "Invalid signature");
            }
        }
        None if !unsigned_allowed(&state, "stripe") => {
            return reject(StatusCode::UNAUTHORIZED, "Signature required");
        }
        None => {}
    }

    let event: Value = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(error) => {
            tracing::warn!(%error, "Malformed Stripe event");
            return reject(StatusCode::BAD_REQUEST, "Malformed payload");
        }
    };
    let Some(event_type) = event["type"].as_str() else {
        return reject(StatusCode::BAD_REQUEST, "Event type missing");
    };
    tracing::info!(event_type, "Received Stripe webhook");

    let Some(outcome) = webhook::stripe_outcome(event_type) else {
        tracing::debug!(event_type, "Unhandled Stripe event type");
        return accepted();
    };
    let object = &event["data"]["object"];
    let Some(reference) = object["metadata"]["reference"].as_str() else {
        tracing::warn!(event_type, "Stripe event without metadata.reference");
        return accepted();
    };
    apply(&state, reference, outcome, object["id"].as_str()).await;
    accepted()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{
        api,
        config::AppConfig,
        core::{
            payment::{NewPayment, record_payment},
            scheduler::get_appointment,
            settings::{self, set_setting},
        },
        entities::{AppointmentStatus, PaymentMethod, PaymentStatus, StaffRole},
        errors::Result,
        test_utils::{
            create_test_customer, create_test_service, create_test_staff, insert_appointment_with_id,
            setup_test_db, setup_test_state,
        },
    };
    use axum::{body::Body, http::Request};
    use rust_decimal::Decimal;
    use tower::ServiceExt;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    fn post(uri: &str, body: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn with_appointment_42(state: &AppState) -> Result<()> {
        let staff = create_test_staff(&state.db, "Ola", StaffRole::Barber).await?;
        let service = create_test_service(&state.db, "Cut", 30).await?;
        let customer = create_test_customer(&state.db, "Per", "41234567").await?;
        insert_appointment_with_id(&state.db, 42, customer.id, staff.id, service.id).await?;
        record_payment(
            &state.db,
            NewPayment {
                order_id: None,
                appointment_id: Some(42),
                amount: Decimal::from(350),
                method: PaymentMethod::Vipps,
                provider_reference: None,
            },
        )
        .await?;
        Ok(())
    }

    #[test]
    fn test_vipps_signature() {
        let body = br#"{"orderId":"APT-1"}"#;
        let signature = sign("secret", body);
        assert!(verify_vipps_signature(body, &signature, "secret"));
        assert!(!verify_vipps_signature(body, &signature, "other"));
        assert!(!verify_vipps_signature(body, "not-hex", "secret"));
    }

    #[test]
    fn test_stripe_signature() {
        let body = br#"{"type":"payment_intent.succeeded"}"#;
        let now = 1_900_000_000;
        let signed = format!("{now}.{}", std::str::from_utf8(body).unwrap());
        let header = format!("t={now},v1={}", sign("whsec", signed.as_bytes()));

        assert!(verify_stripe_signature(body, &header, "whsec", now + 10).is_ok());
        assert_eq!(
            verify_stripe_signature(body, &header, "whsec", now + 301),
            Err("Webhook timestamp outside tolerance")
        );
        assert_eq!(
            verify_stripe_signature(body, &header, "wrong", now),
            Err("Webhook signature mismatch")
        );
        assert!(verify_stripe_signature(body, "v1=abc", "whsec", now).is_err());

        // A rotated secret sends two v1 entries
        let rotated = format!("t={now},v1=00ff,v1={}", sign("whsec", signed.as_bytes()));
        assert!(verify_stripe_signature(body, &rotated, "whsec", now).is_ok());
    }

    #[tokio::test]
    async fn test_signed_vipps_sale_confirms_appointment() -> Result<()> {
        let state = setup_test_state().await?;
        with_appointment_42(&state).await?;
        set_setting(&state.db, settings::VIPPS_WEBHOOK_SECRET, "shh").await?;
        state.settings.refresh(&state.db).await?;
        let app = api::router(state.clone());

        let body = r#"{"orderId":"APT-42","transactionInfo":{"status":"SALE","transactionId":"5001"}}"#;
        let bad = app
            .clone()
            .oneshot(post("/api/webhooks/vipps", body, &[("x-vipps-signature", "00")]))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::UNAUTHORIZED);

        let signature = sign("shh", body.as_bytes());
        let ok = app
            .oneshot(post("/api/webhooks/vipps", body, &[("x-vipps-signature", &signature)]))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let appt = get_appointment(&state.db, 42).await?.unwrap();
        assert_eq!(appt.status, AppointmentStatus::Confirmed);
        assert_eq!(appt.payment_status, PaymentStatus::Paid);
        Ok(())
    }

    #[tokio::test]
    async fn test_unsigned_webhooks() -> Result<()> {
        let state = setup_test_state().await?;
        let app = api::router(state);

        let malformed = app
            .clone()
            .oneshot(post("/api/webhooks/vipps", "{not json", &[]))
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        // Unknown reference: processing fails but the provider still gets 200
        let body = r#"{"orderId":"APT-999","transactionInfo":{"status":"RESERVED"}}"#;
        let unknown = app.oneshot(post("/api/webhooks/vipps", body, &[])).await.unwrap();
        assert_eq!(unknown.status(), StatusCode::OK);

        let mut config = AppConfig::default();
        config.webhooks.require_signature = true;
        let strict = AppState::new(setup_test_db().await?, config).await?;
        let rejected = api::router(strict)
            .oneshot(post("/api/webhooks/stripe", r#"{"type":"payment_intent.succeeded"}"#, &[]))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn test_webhook_rate_limit() -> Result<()> {
        let mut config = AppConfig::default();
        config.webhooks.rate_limit_requests = 2;
        let state = AppState::new(setup_test_db().await?, config).await?;
        let app = api::router(state);

        let body = r#"{"type":"charge.refunded"}"#;
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(post("/api/webhooks/stripe", body, &[]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let limited = app.oneshot(post("/api/webhooks/stripe", body, &[])).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        Ok(())
    }

    #[tokio::test]
    async fn test_webhook_rate_limit_ignores_forwarded_for_by_default() -> Result<()> {
        let mut config = AppConfig::default();
        config.webhooks.rate_limit_requests = 2;
        let state = AppState::new(setup_test_db().await?, config).await?;
        let app = api::router(state);

        let body = r#"{"type":"charge.refunded"}"#;
        let mut statuses = Vec::new();
        for forwarded in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            let response = app
                .clone()
                .oneshot(post("/api/webhooks/stripe", body, &[("x-forwarded-for", forwarded)]))
                .await
                .unwrap();
            statuses.push(response.status());
        }
        assert_eq!(statuses, [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]);
        Ok(())
    }

    #[tokio::test]
    async fn test_webhook_rate_limit_per_forwarded_client_when_trusted() -> Result<()> {
        let mut config = AppConfig::default();
        config.webhooks.rate_limit_requests = 1;
        config.webhooks.trust_forwarded_for = true;
        let state = AppState::new(setup_test_db().await?, config).await?;
        let app = api::router(state);

        let body = r#"{"type":"charge.refunded"}"#;
        for forwarded in ["10.0.0.1", "10.0.0.2"] {
            let response = app
                .clone()
                .oneshot(post("/api/webhooks/stripe", body, &[("x-forwarded-for", forwarded)]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let limited = app
            .oneshot(post("/api/webhooks/stripe", body, &[("x-forwarded-for", "10.0.0.1")]))
            .await
            .unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        Ok(())
    }
}
