//! Staff management and PIN login.
//!
//! Staff are created by an admin or upserted by email on first login, soft-deactivated, and
//! only hard-deleted on explicit request. PINs are stored as argon2 hashes; the salon-wide
//! universal PIN lives in the settings table and is checked after personal PINs.

use crate::{
    config::owner::OwnerBootstrap,
    entities::{Appointment, SkillLevel, Staff, StaffModel, StaffRole, TimeEntry, appointment, staff, time_entry},
    errors::{Error, Result},
};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use chrono::Utc;
use sea_orm::{QueryOrder, Set, prelude::*};
use serde::Deserialize;

/// Input for creating a staff member
#[derive(Debug, Clone, Deserialize)]
pub struct NewStaff {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: StaffRole,
    #[serde(default = "default_skill_level")]
    pub skill_level: SkillLevel,
    #[serde(default = "default_multiplier")]
    pub duration_multiplier: f64,
}

const fn default_skill_level() -> SkillLevel {
    SkillLevel::Standard
}

const fn default_multiplier() -> f64 {
    1.0
}

/// Partial update; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaffPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: Option<StaffRole>,
    pub skill_level: Option<SkillLevel>,
    pub duration_multiplier: Option<f64>,
    pub is_active: Option<bool>,
}

/// Hashes a PIN with argon2 and a random salt.
pub fn hash_pin(pin: &str) -> Result<String> {
    validate_pin(pin)?;
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(pin.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Config {
            message: format!("Failed to hash PIN: {e}"),
        })
}

/// Checks a PIN against a stored hash. Malformed hashes never verify.
#[must_use]
pub fn verify_pin(pin: &str, hash: &str) -> bool {
    PasswordHash::new(hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(pin.as_bytes(), &parsed)
            .is_ok()
    })
}

fn validate_pin(pin: &str) -> Result<()> {
    if (4..=8).contains(&pin.len()) && pin.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(Error::bad_request("PIN must be 4 to 8 digits"))
    }
}

fn validate_multiplier(multiplier: f64) -> Result<()> {
    if multiplier.is_finite() && multiplier > 0.0 {
        Ok(())
    } else {
        Err(Error::bad_request("duration_multiplier must be positive"))
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

async fn ensure_email_free(db: &DatabaseConnection, email: &str, except: Option<i64>) -> Result<()> {
    let existing = Staff::find()
        .filter(staff::Column::Email.eq(email))
        .one(db)
        .await?;
    match existing {
        Some(other) if Some(other.id) != except => Err(Error::conflict(format!(
            "Email {email} is already used by another staff member"
        ))),
        _ => Ok(()),
    }
}

/// Creates a staff member.
pub async fn create_staff(db: &DatabaseConnection, input: NewStaff) -> Result<StaffModel> {
    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::bad_request("Staff name cannot be empty"));
    }
    validate_multiplier(input.duration_multiplier)?;

    let email = input
        .email
        .as_deref()
        .map(normalize_email)
        .filter(|e| !e.is_empty());
    if let Some(email) = &email {
        ensure_email_free(db, email, None).await?;
    }

    let now = Utc::now();
    let created = staff::ActiveModel {
        name: Set(name),
        email: Set(email),
        phone: Set(input.phone),
        role: Set(input.role),
        pin_hash: Set(None),
        skill_level: Set(input.skill_level),
        duration_multiplier: Set(input.duration_multiplier),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;

    tracing::info!(staff_id = created.id, role = ?created.role, "Created staff member");
    Ok(created)
}

/// Returns the staff member with this email, creating a `customer`-role account on first login.
pub async fn upsert_staff_by_email(
    db: &DatabaseConnection,
    email: &str,
    name: &str,
) -> Result<StaffModel> {
    let email = normalize_email(email);
    if email.is_empty() {
        return Err(Error::bad_request("Email cannot be empty"));
    }

    if let Some(existing) = Staff::find()
        .filter(staff::Column::Email.eq(email.as_str()))
        .one(db)
        .await?
    {
        return Ok(existing);
    }

    let display_name = if name.trim().is_empty() {
        email.split('@').next().unwrap_or(email.as_str()).to_string()
    } else {
        name.to_string()
    };

    create_staff(
        db,
        NewStaff {
            name: display_name,
            email: Some(email),
            phone: None,
            role: StaffRole::Customer,
            skill_level: SkillLevel::Standard,
            duration_multiplier: 1.0,
        },
    )
    .await
}

/// Retrieves a staff member by ID.
pub async fn get_staff(db: &DatabaseConnection, staff_id: i64) -> Result<Option<StaffModel>> {
    Staff::find_by_id(staff_id).one(db).await.map_err(Into::into)
}

/// Lists staff ordered by name, optionally including deactivated accounts.
pub async fn list_staff(db: &DatabaseConnection, include_inactive: bool) -> Result<Vec<StaffModel>> {
    let mut query = Staff::find().order_by_asc(staff::Column::Name);
    if !include_inactive {
        query = query.filter(staff::Column::IsActive.eq(true));
    }
    query.all(db).await.map_err(Into::into)
}

/// Applies a partial update to a staff member.
pub async fn update_staff(
    db: &DatabaseConnection,
    staff_id: i64,
    patch: StaffPatch,
) -> Result<StaffModel> {
    let existing = get_staff(db, staff_id)
        .await?
        .ok_or_else(|| Error::not_found("Staff", staff_id))?;

    let mut active: staff::ActiveModel = existing.into();
    if let Some(name) = patch.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(Error::bad_request("Staff name cannot be empty"));
        }
        active.name = Set(name);
    }
    if let Some(email) = patch.email {
        let email = normalize_email(&email);
        if email.is_empty() {
            active.email = Set(None);
        } else {
            ensure_email_free(db, &email, Some(staff_id)).await?;
            active.email = Set(Some(email));
        }
    }
    if let Some(phone) = patch.phone {
        active.phone = Set(Some(phone).filter(|p| !p.trim().is_empty()));
    }
    if let Some(role) = patch.role {
        active.role = Set(role);
    }
    if let Some(skill_level) = patch.skill_level {
        active.skill_level = Set(skill_level);
    }
    if let Some(multiplier) = patch.duration_multiplier {
        validate_multiplier(multiplier)?;
        active.duration_multiplier = Set(multiplier);
    }
    if let Some(is_active) = patch.is_active {
        active.is_active = Set(is_active);
    }
    active.updated_at = Set(Utc::now());

    let updated = active.update(db).await?;
    tracing::info!(staff_id, "Updated staff member");
    Ok(updated)
}

/// Sets (or replaces) the personal PIN of a staff member.
pub async fn set_pin(db: &DatabaseConnection, staff_id: i64, pin: &str) -> Result<()> {
    let existing = get_staff(db, staff_id)
        .await?
        .ok_or_else(|| Error::not_found("Staff", staff_id))?;
    let hash = hash_pin(pin)?;

    let mut active: staff::ActiveModel = existing.into();
    active.pin_hash = Set(Some(hash));
    active.updated_at = Set(Utc::now());
    active.update(db).await?;

    tracing::info!(staff_id, "PIN updated");
    Ok(())
}

/// Soft-deactivates a staff member. Deactivated staff cannot log in.
pub async fn deactivate_staff(db: &DatabaseConnection, staff_id: i64) -> Result<StaffModel> {
    update_staff(
        db,
        staff_id,
        StaffPatch {
            is_active: Some(false),
            ..Default::default()
        },
    )
    .await
}

/// Permanently deletes a staff member who has no appointment or time-entry history.
pub async fn delete_staff(db: &DatabaseConnection, staff_id: i64) -> Result<()> {
    get_staff(db, staff_id)
        .await?
        .ok_or_else(|| Error::not_found("Staff", staff_id))?;

    let appointments = Appointment::find()
        .filter(appointment::Column::StaffId.eq(staff_id))
        .count(db)
        .await?;
    let entries = TimeEntry::find()
        .filter(time_entry::Column::StaffId.eq(staff_id))
        .count(db)
        .await?;
    if appointments > 0 || entries > 0 {
        return Err(Error::conflict(format!(
            "Staff {staff_id} has {appointments} appointments and {entries} time entries; deactivate instead"
        )));
    }

    Staff::delete_by_id(staff_id).exec(db).await?;
    tracing::info!(staff_id, "Deleted staff member");
    Ok(())
}

/// Logs in with a PIN.
///
/// Personal PINs of active staff are tried first. If none match and `universal_pin_hash`
/// verifies, the active staff member named by `staff_id` is logged in.
pub async fn pin_login(
    db: &DatabaseConnection,
    pin: &str,
    universal_pin_hash: Option<&str>,
    staff_id: Option<i64>,
) -> Result<StaffModel> {
    if pin.is_empty() {
        return Err(Error::Unauthorized);
    }

    let candidates = Staff::find()
        .filter(staff::Column::IsActive.eq(true))
        .filter(staff::Column::PinHash.is_not_null())
        .all(db)
        .await?;
    if let Some(member) = candidates
        .into_iter()
        .find(|s| s.pin_hash.as_deref().is_some_and(|hash| verify_pin(pin, hash)))
    {
        tracing::info!(staff_id = member.id, "PIN login");
        return Ok(member);
    }

    if universal_pin_hash.is_some_and(|hash| verify_pin(pin, hash)) {
        let Some(staff_id) = staff_id else {
            return Err(Error::bad_request(
                "staff_id is required when logging in with the universal PIN",
            ));
        };
        let member = get_staff(db, staff_id)
            .await?
            .filter(|s| s.is_active)
            .ok_or(Error::Unauthorized)?;
        tracing::info!(staff_id, "Universal PIN login");
        return Ok(member);
    }

    tracing::warn!("Rejected PIN login");
    Err(Error::Unauthorized)
}

/// Creates the first owner when no owner account exists. Returns the new owner, if any.
pub async fn bootstrap_owner(db: &DatabaseConnection, owner: &OwnerBootstrap) -> Result<Option<StaffModel>> {
    let owners = Staff::find()
        .filter(staff::Column::Role.eq(StaffRole::Owner))
        .count(db)
        .await?;
    if owners > 0 {
        return Ok(None);
    }

    let created = create_staff(
        db,
        NewStaff {
            name: owner.name.clone(),
            email: None,
            phone: None,
            role: StaffRole::Owner,
            skill_level: SkillLevel::Master,
            duration_multiplier: 1.0,
        },
    )
    .await?;
    set_pin(db, created.id, &owner.pin).await?;
    tracing::info!(staff_id = created.id, "Bootstrapped owner account");
    Ok(Some(created))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::{create_test_staff, setup_test_db};

    #[test]
    fn test_pin_hash_roundtrip() -> Result<()> {
        let hash = hash_pin("1234")?;
        assert!(verify_pin("1234", &hash));
        assert!(!verify_pin("4321", &hash));
        assert!(!verify_pin("1234", "not-a-hash"));
        assert!(hash_pin("12").is_err());
        assert!(hash_pin("12ab").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_create_staff_rejects_duplicate_email() -> Result<()> {
        let db = setup_test_db().await?;
        let input = NewStaff {
            name: "Kari".to_string(),
            email: Some("Kari@Salon.no".to_string()),
            phone: None,
            role: StaffRole::Barber,
            skill_level: SkillLevel::Senior,
            duration_multiplier: 0.8,
        };
        let created = create_staff(&db, input.clone()).await?;
        assert_eq!(created.email.as_deref(), Some("kari@salon.no"));

        let result = create_staff(&db, input).await;
        assert!(matches!(result, Err(Error::Conflict { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_upsert_by_email_is_idempotent() -> Result<()> {
        let db = setup_test_db().await?;
        let first = upsert_staff_by_email(&db, "new@salon.no", "").await?;
        let second = upsert_staff_by_email(&db, "NEW@salon.no", "Other").await?;
        assert_eq!(first.id, second.id);
        assert_eq!(first.name, "new");
        assert_eq!(first.role, StaffRole::Customer);
        Ok(())
    }

    #[tokio::test]
    async fn test_pin_login_personal_and_universal() -> Result<()> {
        let db = setup_test_db().await?;
        let ola = create_test_staff(&db, "Ola", StaffRole::Barber).await?;
        let kari = create_test_staff(&db, "Kari", StaffRole::Cashier).await?;
        set_pin(&db, ola.id, "1111").await?;
        let universal = hash_pin("9999")?;

        let logged_in = pin_login(&db, "1111", Some(&universal), None).await?;
        assert_eq!(logged_in.id, ola.id);

        let via_universal = pin_login(&db, "9999", Some(&universal), Some(kari.id)).await?;
        assert_eq!(via_universal.id, kari.id);

        assert!(matches!(
            pin_login(&db, "9999", Some(&universal), None).await,
            Err(Error::BadRequest { .. })
        ));
        assert!(matches!(
            pin_login(&db, "5555", Some(&universal), Some(kari.id)).await,
            Err(Error::Unauthorized)
        ));

        deactivate_staff(&db, ola.id).await?;
        assert!(matches!(
            pin_login(&db, "1111", None, None).await,
            Err(Error::Unauthorized)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_staff_without_history() -> Result<()> {
        let db = setup_test_db().await?;
        let member = create_test_staff(&db, "Temp", StaffRole::Cashier).await?;
        delete_staff(&db, member.id).await?;
        assert!(get_staff(&db, member.id).await?.is_none());
        assert!(matches!(
            delete_staff(&db, member.id).await,
            Err(Error::NotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_bootstrap_owner_runs_once() -> Result<()> {
        let db = setup_test_db().await?;
        let owner = OwnerBootstrap {
            name: "Eva".to_string(),
            pin: "2468".to_string(),
        };

        let created = bootstrap_owner(&db, &owner).await?.unwrap();
        assert_eq!(created.role, StaffRole::Owner);
        assert!(bootstrap_owner(&db, &owner).await?.is_none());

        let logged_in = pin_login(&db, "2468", None, None).await?;
        assert_eq!(logged_in.id, created.id);
        Ok(())
    }
}
