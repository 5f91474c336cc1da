//! Shared outbound HTTP client and upstream error mapping.
//!
//! One `reqwest::Client` is built at startup with a connect timeout and a total request timeout
//! and is cloned into every provider client, so no provider call can hang a request handler or a
//! background job.

use crate::{
    config::app::HttpConfig,
    errors::{Error, Result},
};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Longest upstream error body echoed into an error message
const MAX_ERROR_BODY: usize = 300;

/// Builds the shared client from the `[http]` config section.
pub fn build_client(config: &HttpConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(concat!("salon-desk/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(Into::into)
}

/// Translates a transport failure into an upstream error for `provider`.
pub fn transport_error(provider: &'static str, error: &reqwest::Error) -> Error {
    let message = if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        "connection failed".to_string()
    } else {
        error.to_string()
    };
    tracing::warn!(provider, %error, "Upstream request failed");
    Error::Upstream {
        provider,
        status: error.status().map_or(0, |s| s.as_u16()),
        message,
    }
}

/// Returns the response if its status is 2xx, otherwise an `Upstream` error carrying the body.
pub async fn ensure_success(provider: &'static str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(upstream_error(provider, status, &body))
}

/// Reads a successful JSON response.
pub async fn read_json<T>(provider: &'static str, response: Response) -> Result<T>
where
    T: DeserializeOwned,
{
    let response = ensure_success(provider, response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| transport_error(provider, &e))
}

fn upstream_error(provider: &'static str, status: StatusCode, body: &str) -> Error {
    let mut message: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
    if message.is_empty() {
        message = status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string();
    }
    tracing::warn!(provider, status = status.as_u16(), %message, "Upstream returned an error");
    Error::Upstream {
        provider,
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_error_truncates_body() {
        let body = "x".repeat(1000);
        let Error::Upstream { status, message, .. } =
            upstream_error("fiken", StatusCode::BAD_REQUEST, &body)
        else {
            unreachable!()
        };
        assert_eq!(status, 400);
        assert_eq!(message.len(), MAX_ERROR_BODY);
    }

    #[test]
    fn test_upstream_error_falls_back_to_reason() {
        let error = upstream_error("vipps", StatusCode::SERVICE_UNAVAILABLE, "  ");
        assert_eq!(
            error.to_string(),
            "vipps request failed (503): Service Unavailable"
        );
    }

    #[test]
    fn test_build_client_with_defaults() {
        assert!(build_client(&HttpConfig::default()).is_ok());
    }
}
