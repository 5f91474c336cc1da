//! PIN login, in-memory bearer sessions and the authenticated-staff extractor.
//!
//! A successful PIN login returns a random bearer token. Sessions live only in memory and expire
//! after `server.session_ttl_minutes`; a restart logs everybody out. The extractor reloads the
//! staff row on every request so a deactivated account or a changed role takes effect at once.

use crate::{
    core::{
        permissions::{self, Permission},
        staff,
    },
    entities::StaffModel,
    errors::{Error, Result},
    state::AppState,
};
use axum::{
    Json,
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts},
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Session {
    staff_id: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Opens a session and returns its token and expiry.
    pub fn create(&self, staff_id: i64, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let expires_at = now + self.ttl;
        self.sessions.insert(
            token.clone(),
            Session {
                staff_id,
                expires_at,
            },
        );
        (token, expires_at)
    }

    /// Staff id behind a live token. Expired tokens are removed.
    pub fn resolve(&self, token: &str, now: DateTime<Utc>) -> Option<i64> {
        let staff_id = {
            let session = self.sessions.get(token)?;
            (session.expires_at > now).then_some(session.staff_id)
        };
        if staff_id.is_none() {
            self.sessions.remove(token);
        }
        staff_id
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    /// Ends every session of one staff member, e.g. after deactivation.
    pub fn revoke_staff(&self, staff_id: i64) {
        self.sessions.retain(|_, s| s.staff_id != staff_id);
    }

    /// Returns how many sessions were dropped.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now);
        before - self.sessions.len()
    }
}

/// The staff member behind the bearer token of the current request
#[derive(Debug, Clone)]
pub struct AuthStaff {
    pub staff: StaffModel,
    pub token: String,
}

impl AuthStaff {
    pub fn require(&self, permission: Permission) -> Result<()> {
        permissions::require(self.staff.role, permission)
    }

    /// Acting on one's own record, or holding `permission` to act on others.
    pub fn require_self_or(&self, staff_id: i64, permission: Permission) -> Result<()> {
        if self.staff.id == staff_id {
            Ok(())
        } else {
            self.require(permission)
        }
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<AppState> for AuthStaff {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = bearer_token(parts).ok_or(Error::Unauthorized)?.to_string();
        let staff_id = state
            .sessions
            .resolve(&token, Utc::now())
            .ok_or(Error::Unauthorized)?;
        let staff = staff::get_staff(&state.db, staff_id)
            .await?
            .filter(|s| s.is_active)
            .ok_or(Error::Unauthorized)?;
        Ok(Self { staff, token })
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub pin: String,
    /// Required with the universal PIN
    pub staff_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub staff: StaffModel,
    pub permissions: &'static [Permission],
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let settings = state.settings.current().await;
    let member = staff::pin_login(
        &state.db,
        request.pin.trim(),
        settings.universal_pin_hash.as_deref(),
        request.staff_id,
    )
    .await?;
    let (token, expires_at) = state.sessions.create(member.id, Utc::now());
    Ok(Json(LoginResponse {
        token,
        expires_at,
        permissions: permissions::permissions_for(member.role),
        staff: member,
    }))
}

pub async fn logout(State(state): State<AppState>, auth: AuthStaff) -> Json<serde_json::Value> {
    state.sessions.revoke(&auth.token);
    tracing::info!(staff_id = auth.staff.id, "Logged out");
    Json(serde_json::json!({ "logged_out": true }))
}

#[derive(Debug, Serialize)]
pub struct Me {
    pub staff: StaffModel,
    pub permissions: &'static [Permission],
}

pub async fn me(auth: AuthStaff) -> Json<Me> {
    Json(Me {
        permissions: permissions::permissions_for(auth.staff.role),
        staff: auth.staff,
    })
}
