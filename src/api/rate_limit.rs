//! Per-IP sliding-window rate limiting for the webhook routes.

use crate::state::AppState;
use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;

/// Sliding window: at most `max_requests` in any `window`.
#[derive(Clone)]
pub struct RateLimiter {
    hits: Arc<DashMap<String, VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            hits: Arc::new(DashMap::new()),
            max_requests,
            window,
        }
    }

    /// Records a hit for `ip` and returns `true` if it is within the limit.
    pub fn check_at(&self, ip: &str, now: Instant) -> bool {
        let mut hits = self.hits.entry(ip.to_owned()).or_default();
        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.max_requests {
            return false;
        }
        hits.push_back(now);
        true
    }

    pub fn check(&self, ip: &str) -> bool {
        self.check_at(ip, Instant::now())
    }

    /// Drops IPs with no hit inside the window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.hits.retain(|_, hits| {
            hits.back()
                .is_some_and(|last| now.duration_since(*last) < self.window)
        });
    }

    pub fn tracked_ips(&self) -> usize {
        self.hits.len()
    }
}

/// Client IP: the peer address, or the first `X-Forwarded-For` entry when the proxy is trusted.
fn extract_ip(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for
        && let Some(forwarded) = request.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
    {
        let ip = first.trim();
        if !ip.is_empty() {
            return ip.to_owned();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_owned(), |ci| ci.0.ip().to_string())
}

fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({"error": "Too many requests, try again later"})),
    )
        .into_response()
}

/// Middleware applied to `/api/webhooks/*`.
pub async fn webhook_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = extract_ip(&request, state.config.webhooks.trust_forwarded_for);
    if !state.webhook_limiter.check(&ip) {
        tracing::warn!(%ip, "Webhook rate limit exceeded");
        return too_many_requests();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(limiter.check_at("1.2.3.4", t0));
        assert!(limiter.check_at("1.2.3.4", t0 + Duration::from_secs(10)));
        assert!(!limiter.check_at("1.2.3.4", t0 + Duration::from_secs(20)));
        // Other clients are counted separately
        assert!(limiter.check_at("5.6.7.8", t0 + Duration::from_secs(20)));
        // The first hit has left the window
        assert!(limiter.check_at("1.2.3.4", t0 + Duration::from_secs(61)));
        assert!(!limiter.check_at("1.2.3.4", t0 + Duration::from_secs(62)));
    }

    #[test]
    fn test_extract_ip_forwarded_for_only_when_trusted() {
        let mut request = Request::builder()
            .header("x-forwarded-for", "10.0.0.7, 172.16.0.1")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_ip(&request, true), "10.0.0.7");
        assert_eq!(extract_ip(&request, false), "unknown");

        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 20], 40000))));
        assert_eq!(extract_ip(&request, false), "192.168.1.20");

        let bare = Request::new(axum::body::Body::empty());
        assert_eq!(extract_ip(&bare, true), "unknown");
    }
}
