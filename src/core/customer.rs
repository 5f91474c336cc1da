//! Customer relationship management - customers, tags, notes, merge and GDPR erase.
//!
//! Phone numbers are normalized before they are stored or looked up, so `get_or_create_by_phone`
//! is the single dedup point for booking and POS flows.

use crate::{
    entities::{
        Appointment, Customer, CustomerModel, CustomerNote, CustomerNoteModel, CustomerTag,
        CustomerTagEntity, CustomerTagModel, Order, appointment, customer, customer_note,
        customer_tag, order,
    },
    errors::{Error, Result},
};
use chrono::Utc;
use sea_orm::{
    Condition, QueryOrder, QuerySelect, Set, TransactionTrait, prelude::*, sea_query::Expr,
};
use serde::Deserialize;

/// Input for creating a customer
#[derive(Debug, Clone, Deserialize)]
pub struct NewCustomer {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerPatch {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

/// Normalizes a phone number to `+<digits>`.
///
/// Spaces, dashes and parentheses are dropped, a `00` prefix becomes `+`, and bare 8-digit
/// numbers are treated as Norwegian (`+47`).
pub fn normalize_phone(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();

    let normalized = if has_plus {
        format!("+{digits}")
    } else if let Some(rest) = digits.strip_prefix("00") {
        format!("+{rest}")
    } else if digits.len() == 8 {
        format!("+47{digits}")
    } else {
        format!("+{digits}")
    };

    if !(8..=16).contains(&normalized.len()) {
        return Err(Error::bad_request(format!("Invalid phone number '{raw}'")));
    }
    Ok(normalized)
}

/// Creates a customer. Fails with `Conflict` when the phone number is taken.
pub async fn create_customer(db: &DatabaseConnection, input: NewCustomer) -> Result<CustomerModel> {
    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::bad_request("Customer name cannot be empty"));
    }
    let phone = normalize_phone(&input.phone)?;

    if find_by_phone(db, &phone).await?.is_some() {
        return Err(Error::conflict(format!(
            "A customer with phone {phone} already exists"
        )));
    }

    insert_customer(db, name, phone, input.email).await
}

async fn insert_customer<C>(
    db: &C,
    name: String,
    phone: String,
    email: Option<String>,
) -> Result<CustomerModel>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let created = customer::ActiveModel {
        name: Set(name),
        phone: Set(phone),
        email: Set(email.filter(|e| !e.trim().is_empty())),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;
    tracing::info!(customer_id = created.id, "Created customer");
    Ok(created)
}

/// Looks a customer up by an already-normalized phone number.
pub async fn find_by_phone<C>(db: &C, phone: &str) -> Result<Option<CustomerModel>>
where
    C: ConnectionTrait,
{
    Customer::find()
        .filter(customer::Column::Phone.eq(phone))
        .one(db)
        .await
        .map_err(Into::into)
}

/// Returns the customer with this phone number, creating one if needed.
///
/// An existing customer is returned untouched; `name` and `email` only apply on creation.
pub async fn get_or_create_by_phone<C>(
    db: &C,
    phone: &str,
    name: &str,
    email: Option<String>,
) -> Result<CustomerModel>
where
    C: ConnectionTrait,
{
    let phone = normalize_phone(phone)?;
    if let Some(existing) = find_by_phone(db, &phone).await? {
        return Ok(existing);
    }
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::bad_request("Customer name cannot be empty"));
    }
    insert_customer(db, name.to_string(), phone, email).await
}

pub async fn get_customer(db: &DatabaseConnection, customer_id: i64) -> Result<Option<CustomerModel>> {
    Customer::find_by_id(customer_id)
        .one(db)
        .await
        .map_err(Into::into)
}

pub async fn update_customer(
    db: &DatabaseConnection,
    customer_id: i64,
    patch: CustomerPatch,
) -> Result<CustomerModel> {
    let existing = get_customer(db, customer_id)
        .await?
        .ok_or_else(|| Error::not_found("Customer", customer_id))?;

    let mut active: customer::ActiveModel = existing.into();
    if let Some(name) = patch.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(Error::bad_request("Customer name cannot be empty"));
        }
        active.name = Set(name);
    }
    if let Some(phone) = patch.phone {
        let phone = normalize_phone(&phone)?;
        if let Some(other) = find_by_phone(db, &phone).await?
            && other.id != customer_id
        {
            return Err(Error::conflict(format!(
                "A customer with phone {phone} already exists"
            )));
        }
        active.phone = Set(phone);
    }
    if let Some(email) = patch.email {
        active.email = Set(Some(email).filter(|e| !e.trim().is_empty()));
    }
    active.updated_at = Set(Utc::now());

    active.update(db).await.map_err(Into::into)
}

/// Searches customers by name or phone substring.
pub async fn search_customers(
    db: &DatabaseConnection,
    query: &str,
    limit: u64,
) -> Result<Vec<CustomerModel>> {
    let query = query.trim();
    let mut select = Customer::find().order_by_asc(customer::Column::Name);
    if !query.is_empty() {
        let mut condition = Condition::any().add(customer::Column::Name.contains(query));
        let digits: String = query.chars().filter(char::is_ascii_digit).collect();
        if !digits.is_empty() {
            condition = condition.add(customer::Column::Phone.contains(digits.as_str()));
        }
        select = select.filter(condition);
    }
    select.limit(limit).all(db).await.map_err(Into::into)
}

/// Tags a customer. Returns `None` when the customer already has the tag.
pub async fn add_tag(
    db: &DatabaseConnection,
    customer_id: i64,
    tag: CustomerTag,
) -> Result<Option<CustomerTagModel>> {
    get_customer(db, customer_id)
        .await?
        .ok_or_else(|| Error::not_found("Customer", customer_id))?;

    let existing = CustomerTagEntity::find()
        .filter(customer_tag::Column::CustomerId.eq(customer_id))
        .filter(customer_tag::Column::Tag.eq(tag))
        .one(db)
        .await?;
    if existing.is_some() {
        return Ok(None);
    }

    let created = customer_tag::ActiveModel {
        customer_id: Set(customer_id),
        tag: Set(tag),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(Some(created))
}

/// Removes a tag. Returns whether a tag was removed.
pub async fn remove_tag(db: &DatabaseConnection, customer_id: i64, tag: CustomerTag) -> Result<bool> {
    let result = CustomerTagEntity::delete_many()
        .filter(customer_tag::Column::CustomerId.eq(customer_id))
        .filter(customer_tag::Column::Tag.eq(tag))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

pub async fn list_tags(db: &DatabaseConnection, customer_id: i64) -> Result<Vec<CustomerTag>> {
    let rows = CustomerTagEntity::find()
        .filter(customer_tag::Column::CustomerId.eq(customer_id))
        .order_by_asc(customer_tag::Column::Id)
        .all(db)
        .await?;
    Ok(rows.into_iter().map(|row| row.tag).collect())
}

/// Adds a note to a customer, attributed to the staff member who wrote it.
pub async fn add_note(
    db: &DatabaseConnection,
    customer_id: i64,
    staff_id: Option<i64>,
    body: &str,
) -> Result<CustomerNoteModel> {
    let body = body.trim();
    if body.is_empty() {
        return Err(Error::bad_request("Note cannot be empty"));
    }
    get_customer(db, customer_id)
        .await?
        .ok_or_else(|| Error::not_found("Customer", customer_id))?;

    customer_note::ActiveModel {
        customer_id: Set(customer_id),
        staff_id: Set(staff_id),
        body: Set(body.to_string()),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// Lists a customer's notes, newest first.
pub async fn list_notes(db: &DatabaseConnection, customer_id: i64) -> Result<Vec<CustomerNoteModel>> {
    CustomerNote::find()
        .filter(customer_note::Column::CustomerId.eq(customer_id))
        .order_by_desc(customer_note::Column::CreatedAt)
        .order_by_desc(customer_note::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Merges customer `merged_id` into `survivor_id` and deletes the merged record.
///
/// Appointments, orders, notes and tags move to the survivor; tags the survivor already holds
/// are dropped. Everything happens in one transaction.
pub async fn merge_customers(
    db: &DatabaseConnection,
    survivor_id: i64,
    merged_id: i64,
) -> Result<CustomerModel> {
    if survivor_id == merged_id {
        return Err(Error::bad_request("Cannot merge a customer into itself"));
    }

    let txn = db.begin().await?;

    let survivor = Customer::find_by_id(survivor_id)
        .one(&txn)
        .await?
        .ok_or_else(|| Error::not_found("Customer", survivor_id))?;
    Customer::find_by_id(merged_id)
        .one(&txn)
        .await?
        .ok_or_else(|| Error::not_found("Customer", merged_id))?;

    let moved_appointments = Appointment::update_many()
        .col_expr(appointment::Column::CustomerId, Expr::value(survivor_id))
        .filter(appointment::Column::CustomerId.eq(merged_id))
        .exec(&txn)
        .await?
        .rows_affected;
    Order::update_many()
        .col_expr(order::Column::CustomerId, Expr::value(survivor_id))
        .filter(order::Column::CustomerId.eq(merged_id))
        .exec(&txn)
        .await?;
    CustomerNote::update_many()
        .col_expr(customer_note::Column::CustomerId, Expr::value(survivor_id))
        .filter(customer_note::Column::CustomerId.eq(merged_id))
        .exec(&txn)
        .await?;

    let survivor_tags: Vec<CustomerTag> = CustomerTagEntity::find()
        .filter(customer_tag::Column::CustomerId.eq(survivor_id))
        .all(&txn)
        .await?
        .into_iter()
        .map(|row| row.tag)
        .collect();
    let merged_tags = CustomerTagEntity::find()
        .filter(customer_tag::Column::CustomerId.eq(merged_id))
        .all(&txn)
        .await?;
    for row in merged_tags {
        if survivor_tags.contains(&row.tag) {
            CustomerTagEntity::delete_by_id(row.id).exec(&txn).await?;
        } else {
            let mut active: customer_tag::ActiveModel = row.into();
            active.customer_id = Set(survivor_id);
            active.update(&txn).await?;
        }
    }

    Customer::delete_by_id(merged_id).exec(&txn).await?;
    txn.commit().await?;

    tracing::info!(
        survivor_id,
        merged_id,
        moved_appointments,
        "Merged customers"
    );
    Ok(survivor)
}

/// Erases a customer (GDPR).
///
/// Notes, tags and appointments are deleted. Orders are kept for bookkeeping with the customer
/// reference cleared.
pub async fn erase_customer(db: &DatabaseConnection, customer_id: i64) -> Result<()> {
    let txn = db.begin().await?;

    Customer::find_by_id(customer_id)
        .one(&txn)
        .await?
        .ok_or_else(|| Error::not_found("Customer", customer_id))?;

    CustomerNote::delete_many()
        .filter(customer_note::Column::CustomerId.eq(customer_id))
        .exec(&txn)
        .await?;
    CustomerTagEntity::delete_many()
        .filter(customer_tag::Column::CustomerId.eq(customer_id))
        .exec(&txn)
        .await?;
    Appointment::delete_many()
        .filter(appointment::Column::CustomerId.eq(customer_id))
        .exec(&txn)
        .await?;
    Order::update_many()
        .col_expr(order::Column::CustomerId, Expr::value(Option::<i64>::None))
        .filter(order::Column::CustomerId.eq(customer_id))
        .exec(&txn)
        .await?;
    Customer::delete_by_id(customer_id).exec(&txn).await?;

    txn.commit().await?;
    tracing::info!(customer_id, "Erased customer data");
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{
        entities::StaffRole,
        test_utils::{
            create_test_appointment, create_test_customer, create_test_service, create_test_staff,
            setup_test_db,
        },
    };

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("412 34 567").unwrap(), "+4741234567");
        assert_eq!(normalize_phone("+47 412-34-567").unwrap(), "+4741234567");
        assert_eq!(normalize_phone("0046 70 123 45 67").unwrap(), "+46701234567");
        assert!(normalize_phone("123").is_err());
    }

    #[tokio::test]
    async fn test_get_or_create_by_phone_dedups() -> Result<()> {
        let db = setup_test_db().await?;
        let first = get_or_create_by_phone(&db, "41234567", "Ola", None).await?;
        let second = get_or_create_by_phone(&db, "+47 412 34 567", "Someone Else", None).await?;
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Ola");

        let duplicate = create_customer(
            &db,
            NewCustomer {
                name: "Dup".to_string(),
                phone: "412 34 567".to_string(),
                email: None,
            },
        )
        .await;
        assert!(matches!(duplicate, Err(Error::Conflict { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_tagging_twice_returns_none() -> Result<()> {
        let db = setup_test_db().await?;
        let customer = create_test_customer(&db, "Kari", "41111111").await?;

        let first = add_tag(&db, customer.id, CustomerTag::Vip).await?;
        assert!(first.is_some());
        let second = add_tag(&db, customer.id, CustomerTag::Vip).await?;
        assert!(second.is_none());
        assert_eq!(list_tags(&db, customer.id).await?, vec![CustomerTag::Vip]);

        assert!(remove_tag(&db, customer.id, CustomerTag::Vip).await?);
        assert!(!remove_tag(&db, customer.id, CustomerTag::Vip).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_search_by_name_and_phone() -> Result<()> {
        let db = setup_test_db().await?;
        create_test_customer(&db, "Kari Nordmann", "41111111").await?;
        create_test_customer(&db, "Ola Hansen", "92222222").await?;

        let by_name = search_customers(&db, "Nord", 20).await?;
        assert_eq!(by_name.len(), 1);
        let by_phone = search_customers(&db, "9222", 20).await?;
        assert_eq!(by_phone.len(), 1);
        assert_eq!(by_phone[0].name, "Ola Hansen");
        assert_eq!(search_customers(&db, "", 20).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_merge_moves_history_and_deletes_merged() -> Result<()> {
        let db = setup_test_db().await?;
        let staff = create_test_staff(&db, "Barber", StaffRole::Barber).await?;
        let service = create_test_service(&db, "Cut", 30).await?;
        let a = create_test_customer(&db, "A", "41111111").await?;
        let b = create_test_customer(&db, "B", "42222222").await?;

        let appt = create_test_appointment(&db, b.id, staff.id, service.id, "10:00", "10:30").await?;
        add_note(&db, b.id, Some(staff.id), "Likes it short").await?;
        add_tag(&db, a.id, CustomerTag::Vip).await?;
        add_tag(&db, b.id, CustomerTag::Vip).await?;
        add_tag(&db, b.id, CustomerTag::Allergy).await?;

        merge_customers(&db, a.id, b.id).await?;

        assert!(get_customer(&db, b.id).await?.is_none());
        let moved = Appointment::find_by_id(appt.id).one(&db).await?.unwrap();
        assert_eq!(moved.customer_id, a.id);
        assert_eq!(list_notes(&db, a.id).await?.len(), 1);
        let tags = list_tags(&db, a.id).await?;
        assert_eq!(tags.len(), 2);
        assert!(tags.contains(&CustomerTag::Allergy));

        assert!(matches!(
            merge_customers(&db, a.id, a.id).await,
            Err(Error::BadRequest { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_erase_removes_customer_data() -> Result<()> {
        let db = setup_test_db().await?;
        let staff = create_test_staff(&db, "Barber", StaffRole::Barber).await?;
        let service = create_test_service(&db, "Cut", 30).await?;
        let customer = create_test_customer(&db, "Gone", "43333333").await?;
        create_test_appointment(&db, customer.id, staff.id, service.id, "11:00", "11:30").await?;
        add_note(&db, customer.id, None, "note").await?;
        add_tag(&db, customer.id, CustomerTag::Regular).await?;

        erase_customer(&db, customer.id).await?;

        assert!(get_customer(&db, customer.id).await?.is_none());
        assert!(list_notes(&db, customer.id).await?.is_empty());
        assert!(list_tags(&db, customer.id).await?.is_empty());
        let remaining = Appointment::find()
            .filter(appointment::Column::CustomerId.eq(customer.id))
            .count(&db)
            .await?;
        assert_eq!(remaining, 0);
        Ok(())
    }
}
