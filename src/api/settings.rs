//! Runtime salon settings.

use crate::{
    api::auth::AuthStaff,
    core::{
        permissions::Permission,
        settings::{self, KNOWN_KEYS, SECRET_KEYS, UNIVERSAL_PIN_HASH},
        staff,
    },
    errors::{Error, Result},
    state::AppState,
};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, put},
};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Shown instead of a stored credential
pub const REDACTED: &str = "********";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/settings", get(show).put(update))
        .route("/api/settings/universal-pin", put(set_universal_pin))
}

fn redact(values: impl IntoIterator<Item = (String, String)>) -> BTreeMap<String, String> {
    values
        .into_iter()
        .map(|(key, value)| {
            if SECRET_KEYS.contains(&key.as_str()) && !value.is_empty() {
                (key, REDACTED.to_string())
            } else {
                (key, value)
            }
        })
        .collect()
}

/// GET /api/settings - stored values, credentials redacted
async fn show(State(state): State<AppState>, auth: AuthStaff) -> Result<Json<BTreeMap<String, String>>> {
    auth.require(Permission::ManageSettings)?;
    Ok(Json(redact(settings::get_all_values(&state.db).await?)))
}

/// PUT /api/settings - `{ key: value }`; a redacted placeholder leaves the credential as is
async fn update(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(changes): Json<BTreeMap<String, String>>,
) -> Result<Json<BTreeMap<String, String>>> {
    auth.require(Permission::ManageSettings)?;
    if let Some(unknown) = changes.keys().find(|k| !KNOWN_KEYS.contains(&k.as_str())) {
        return Err(Error::bad_request(format!("Unknown setting '{unknown}'")));
    }

    let mut vipps_changed = false;
    for (key, value) in &changes {
        if value == REDACTED {
            continue;
        }
        settings::update_setting(&state.db, key, value).await?;
        vipps_changed |= key.starts_with("vipps_");
    }

    state.settings.refresh(&state.db).await?;
    if vipps_changed {
        state.vipps_tokens.clear().await;
    }
    tracing::info!(staff_id = auth.staff.id, keys = changes.len(), "Settings updated");
    Ok(Json(redact(settings::get_all_values(&state.db).await?)))
}

#[derive(Debug, Deserialize)]
struct UniversalPin {
    pin: String,
}

/// PUT /api/settings/universal-pin
async fn set_universal_pin(
    State(state): State<AppState>,
    auth: AuthStaff,
    Json(request): Json<UniversalPin>,
) -> Result<StatusCode> {
    auth.require(Permission::ManageSettings)?;
    let hash = staff::hash_pin(&request.pin)?;
    settings::set_setting(&state.db, UNIVERSAL_PIN_HASH, &hash).await?;
    state.settings.refresh(&state.db).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{
        api,
        core::settings::{SALON_NAME, VIPPS_CLIENT_SECRET},
        entities::StaffRole,
        test_utils::{api_request, create_test_session, response_json, setup_test_state},
    };
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_update_refreshes_and_redacts() -> Result<()> {
        let state = setup_test_state().await?;
        let (_, owner) = create_test_session(&state, "Eva", StaffRole::Owner).await?;
        let handle = state.settings.clone();
        let db = state.db.clone();
        let app = api::router(state);

        let response = app
            .clone()
            .oneshot(api_request(
                "PUT",
                "/api/settings",
                Some(&owner),
                Some(json!({ SALON_NAME: "Klipp & Stell", VIPPS_CLIENT_SECRET: "s3cret" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json[SALON_NAME], "Klipp & Stell");
        assert_eq!(json[VIPPS_CLIENT_SECRET], REDACTED);
        assert_eq!(handle.current().await.salon_name, "Klipp & Stell");

        // Echoing the placeholder back keeps the stored secret
        app.oneshot(api_request(
            "PUT",
            "/api/settings",
            Some(&owner),
            Some(json!({ VIPPS_CLIENT_SECRET: REDACTED })),
        ))
        .await
        .unwrap();
        assert_eq!(
            settings::get_setting(&db, VIPPS_CLIENT_SECRET).await?.as_deref(),
            Some("s3cret")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_managers_cannot_change_settings() -> Result<()> {
        let state = setup_test_state().await?;
        let (_, manager) = create_test_session(&state, "Mona", StaffRole::Manager).await?;
        let (_, owner) = create_test_session(&state, "Eva", StaffRole::Owner).await?;
        let app = api::router(state);

        let denied = app
            .clone()
            .oneshot(api_request("GET", "/api/settings", Some(&manager), None))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let unknown = app
            .oneshot(api_request(
                "PUT",
                "/api/settings",
                Some(&owner),
                Some(json!({ "favourite_colour": "blue" })),
            ))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn test_universal_pin_is_hashed() -> Result<()> {
        let state = setup_test_state().await?;
        let (_, owner) = create_test_session(&state, "Eva", StaffRole::Owner).await?;
        let handle = state.settings.clone();
        let app = api::router(state);

        let response = app
            .oneshot(api_request(
                "PUT",
                "/api/settings/universal-pin",
                Some(&owner),
                Some(json!({ "pin": "9999" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let hash = handle.current().await.universal_pin_hash.clone().unwrap();
        assert!(staff::verify_pin("9999", &hash));
        Ok(())
    }
}
