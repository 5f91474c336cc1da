//! Catalog business logic - services and retail products.
//!
//! Prices are stored tax-exclusive with a percentage `tax_rate`. Items are never hard-deleted
//! because order lines reference them; deactivation hides them from the POS and booking lists.
//! Product stock may go negative (the POS sells what is on the shelf even if the count is off).

use crate::{
    config::app::{ProductSeed, ServiceSeed},
    entities::{Product, ProductModel, Service, ServiceModel, product, service},
    errors::{Error, Result},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{QueryOrder, Set, prelude::*, sea_query::Expr};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct NewService {
    pub name: String,
    pub duration_minutes: i32,
    pub price: Decimal,
    #[serde(default = "default_tax_rate")]
    pub tax_rate: Decimal,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicePatch {
    pub name: Option<String>,
    pub duration_minutes: Option<i32>,
    pub price: Option<Decimal>,
    pub tax_rate: Option<Decimal>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub sku: Option<String>,
    pub price: Decimal,
    #[serde(default = "default_tax_rate")]
    pub tax_rate: Decimal,
    #[serde(default)]
    pub stock: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub sku: Option<String>,
    pub price: Option<Decimal>,
    pub tax_rate: Option<Decimal>,
    pub is_active: Option<bool>,
}

fn default_tax_rate() -> Decimal {
    Decimal::from(25)
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::bad_request("Name cannot be empty"));
    }
    Ok(name.to_string())
}

fn validate_price(price: Decimal) -> Result<()> {
    if price.is_sign_negative() {
        return Err(Error::bad_request(format!("Price cannot be negative: {price}")));
    }
    Ok(())
}

fn validate_tax_rate(rate: Decimal) -> Result<()> {
    if rate.is_sign_negative() || rate > Decimal::ONE_HUNDRED {
        return Err(Error::bad_request(format!("Invalid tax rate: {rate}")));
    }
    Ok(())
}

fn validate_duration(minutes: i32) -> Result<()> {
    if minutes <= 0 {
        return Err(Error::bad_request("Service duration must be positive"));
    }
    Ok(())
}

// Services

pub async fn create_service(db: &DatabaseConnection, input: NewService) -> Result<ServiceModel> {
    let name = validate_name(&input.name)?;
    validate_duration(input.duration_minutes)?;
    validate_price(input.price)?;
    validate_tax_rate(input.tax_rate)?;

    let now = Utc::now();
    let created = service::ActiveModel {
        name: Set(name),
        duration_minutes: Set(input.duration_minutes),
        price: Set(input.price),
        tax_rate: Set(input.tax_rate),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;
    tracing::info!(service_id = created.id, name = %created.name, "Created service");
    Ok(created)
}

pub async fn get_service<C>(db: &C, service_id: i64) -> Result<Option<ServiceModel>>
where
    C: ConnectionTrait,
{
    Service::find_by_id(service_id)
        .one(db)
        .await
        .map_err(Into::into)
}

pub async fn list_services(db: &DatabaseConnection, include_inactive: bool) -> Result<Vec<ServiceModel>> {
    let mut query = Service::find().order_by_asc(service::Column::Name);
    if !include_inactive {
        query = query.filter(service::Column::IsActive.eq(true));
    }
    query.all(db).await.map_err(Into::into)
}

pub async fn update_service(
    db: &DatabaseConnection,
    service_id: i64,
    patch: ServicePatch,
) -> Result<ServiceModel> {
    let existing = get_service(db, service_id)
        .await?
        .ok_or_else(|| Error::not_found("Service", service_id))?;

    let mut active: service::ActiveModel = existing.into();
    if let Some(name) = patch.name {
        active.name = Set(validate_name(&name)?);
    }
    if let Some(minutes) = patch.duration_minutes {
        validate_duration(minutes)?;
        active.duration_minutes = Set(minutes);
    }
    if let Some(price) = patch.price {
        validate_price(price)?;
        active.price = Set(price);
    }
    if let Some(rate) = patch.tax_rate {
        validate_tax_rate(rate)?;
        active.tax_rate = Set(rate);
    }
    if let Some(is_active) = patch.is_active {
        active.is_active = Set(is_active);
    }
    active.updated_at = Set(Utc::now());
    active.update(db).await.map_err(Into::into)
}

pub async fn deactivate_service(db: &DatabaseConnection, service_id: i64) -> Result<ServiceModel> {
    update_service(
        db,
        service_id,
        ServicePatch {
            is_active: Some(false),
            ..Default::default()
        },
    )
    .await
}

// Products

pub async fn create_product(db: &DatabaseConnection, input: NewProduct) -> Result<ProductModel> {
    let name = validate_name(&input.name)?;
    validate_price(input.price)?;
    validate_tax_rate(input.tax_rate)?;

    let now = Utc::now();
    let created = product::ActiveModel {
        name: Set(name),
        sku: Set(input.sku.filter(|s| !s.trim().is_empty())),
        price: Set(input.price),
        tax_rate: Set(input.tax_rate),
        stock: Set(input.stock),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;
    tracing::info!(product_id = created.id, name = %created.name, "Created product");
    Ok(created)
}

pub async fn get_product<C>(db: &C, product_id: i64) -> Result<Option<ProductModel>>
where
    C: ConnectionTrait,
{
    Product::find_by_id(product_id)
        .one(db)
        .await
        .map_err(Into::into)
}

pub async fn list_products(db: &DatabaseConnection, include_inactive: bool) -> Result<Vec<ProductModel>> {
    let mut query = Product::find().order_by_asc(product::Column::Name);
    if !include_inactive {
        query = query.filter(product::Column::IsActive.eq(true));
    }
    query.all(db).await.map_err(Into::into)
}

pub async fn update_product(
    db: &DatabaseConnection,
    product_id: i64,
    patch: ProductPatch,
) -> Result<ProductModel> {
    let existing = get_product(db, product_id)
        .await?
        .ok_or_else(|| Error::not_found("Product", product_id))?;

    let mut active: product::ActiveModel = existing.into();
    if let Some(name) = patch.name {
        active.name = Set(validate_name(&name)?);
    }
    if let Some(sku) = patch.sku {
        active.sku = Set(Some(sku).filter(|s| !s.trim().is_empty()));
    }
    if let Some(price) = patch.price {
        validate_price(price)?;
        active.price = Set(price);
    }
    if let Some(rate) = patch.tax_rate {
        validate_tax_rate(rate)?;
        active.tax_rate = Set(rate);
    }
    if let Some(is_active) = patch.is_active {
        active.is_active = Set(is_active);
    }
    active.updated_at = Set(Utc::now());
    active.update(db).await.map_err(Into::into)
}

pub async fn deactivate_product(db: &DatabaseConnection, product_id: i64) -> Result<ProductModel> {
    update_product(
        db,
        product_id,
        ProductPatch {
            is_active: Some(false),
            ..Default::default()
        },
    )
    .await
}

/// Atomically adds `delta` (which may be negative) to a product's stock.
///
/// The update is a single `stock = stock + delta` statement so concurrent sales never lose a
/// decrement. Stock is allowed to go negative; that is logged as a warning.
pub async fn adjust_stock<C>(db: &C, product_id: i64, delta: i32) -> Result<ProductModel>
where
    C: ConnectionTrait,
{
    let result = Product::update_many()
        .col_expr(
            product::Column::Stock,
            Expr::col(product::Column::Stock).add(delta),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(product_id))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        return Err(Error::not_found("Product", product_id));
    }

    let updated = get_product(db, product_id)
        .await?
        .ok_or_else(|| Error::not_found("Product", product_id))?;
    if updated.stock < 0 {
        tracing::warn!(
            product_id,
            stock = updated.stock,
            "Product stock is negative"
        );
    }
    Ok(updated)
}

/// Seeds services and products from the config file when the catalog is empty.
///
/// Returns the number of rows created.
pub async fn seed_catalog(
    db: &DatabaseConnection,
    services: &[ServiceSeed],
    products: &[ProductSeed],
) -> Result<usize> {
    let mut created = 0;

    if Service::find().count(db).await? == 0 {
        for seed in services {
            create_service(
                db,
                NewService {
                    name: seed.name.clone(),
                    duration_minutes: seed.duration_minutes,
                    price: seed.price,
                    tax_rate: seed.tax_rate,
                },
            )
            .await?;
            created += 1;
        }
    }

    if Product::find().count(db).await? == 0 {
        for seed in products {
            create_product(
                db,
                NewProduct {
                    name: seed.name.clone(),
                    sku: seed.sku.clone(),
                    price: seed.price,
                    tax_rate: seed.tax_rate,
                    stock: seed.stock,
                },
            )
            .await?;
            created += 1;
        }
    }

    if created > 0 {
        tracing::info!(created, "Seeded catalog from config");
    }
    Ok(created)
}
