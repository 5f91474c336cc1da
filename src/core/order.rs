//! Order business logic - POS checkout, totals, refunds and daily sales.
//!
//! Prices are tax-exclusive. Each line's tax is rounded to two decimals (midpoint away from zero)
//! before summing, which is also how the accounting export rounds, so local and Fiken totals agree.
//! An order header, its items and the stock decrements are written in one database transaction.

use crate::{
    core::{catalog, time_tracking::local_day_bounds},
    entities::{
        Appointment, ItemType, Order, OrderItem, OrderItemModel, OrderModel, OrderStatus, Payment,
        PaymentState, PaymentStatus, appointment, order, order_item, payment,
    },
    errors::{Error, Result},
};
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*, sea_query::Expr};
use serde::{Deserialize, Serialize};

/// Quantity, price and tax rate of one line, as used for totals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricedLine {
    pub quantity: i32,
    pub unit_price: Decimal,
    /// Percent, e.g. `25`
    pub tax_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineTotals {
    pub line_total: Decimal,
    pub line_tax: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderTotals {
    pub lines: Vec<LineTotals>,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub tip: Decimal,
    pub total: Decimal,
}

/// Rounds a money amount to two decimals, midpoint away from zero.
#[must_use]
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Tax on a tax-exclusive amount, rounded per line.
#[must_use]
pub fn line_tax(line_total: Decimal, tax_rate: Decimal) -> Decimal {
    round_money(line_total * tax_rate / Decimal::ONE_HUNDRED)
}

/// Computes line totals, subtotal, tax and total.
///
/// `total = subtotal + tax - discount + tip`. Amounts too large for a `Decimal` are rejected.
pub fn compute_totals(lines: &[PricedLine], discount: Decimal, tip: Decimal) -> Result<OrderTotals> {
    let overflow = || Error::bad_request("Order amount is too large");

    let mut totals = Vec::with_capacity(lines.len());
    let mut subtotal = Decimal::ZERO;
    let mut tax = Decimal::ZERO;
    for line in lines {
        let line_total = Decimal::from(line.quantity)
            .checked_mul(line.unit_price)
            .ok_or_else(overflow)?;
        let line_tax = line_total
            .checked_mul(line.tax_rate)
            .map(|t| round_money(t / Decimal::ONE_HUNDRED))
            .ok_or_else(overflow)?;
        subtotal = subtotal.checked_add(line_total).ok_or_else(overflow)?;
        tax = tax.checked_add(line_tax).ok_or_else(overflow)?;
        totals.push(LineTotals { line_total, line_tax });
    }

    let total = subtotal
        .checked_add(tax)
        .and_then(|t| t.checked_sub(discount))
        .and_then(|t| t.checked_add(tip))
        .ok_or_else(overflow)?;

    Ok(OrderTotals {
        lines: totals,
        subtotal,
        tax,
        discount,
        tip,
        total,
    })
}

/// Whether `amount` has at most two decimals (øre precision).
fn is_money(amount: Decimal) -> bool {
    amount.normalize().scale() <= 2
}

/// One line of a checkout request
#[derive(Debug, Clone, Deserialize)]
pub struct NewOrderItem {
    pub item_type: ItemType,
    pub item_id: i64,
    pub quantity: i32,
    /// Overrides the catalog price (e.g. a manual price on the POS)
    pub unit_price: Option<Decimal>,
}

/// A checkout request
#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub customer_id: Option<i64>,
    pub staff_id: Option<i64>,
    pub appointment_id: Option<i64>,
    pub items: Vec<NewOrderItem>,
    #[serde(default)]
    pub discount: Decimal,
    #[serde(default)]
    pub tip: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundKind {
    Full,
    Partial,
}

struct ResolvedLine {
    input: NewOrderItem,
    name: String,
    priced: PricedLine,
}

async fn resolve_line<C>(db: &C, item: NewOrderItem) -> Result<ResolvedLine>
where
    C: ConnectionTrait,
{
    if item.quantity <= 0 {
        return Err(Error::bad_request(format!(
            "Quantity must be positive (item {})",
            item.item_id
        )));
    }
    if item.unit_price.is_some_and(|p| p.is_sign_negative()) {
        return Err(Error::bad_request("Unit price cannot be negative"));
    }
    if item.unit_price.is_some_and(|p| !is_money(p)) {
        return Err(Error::bad_request("Unit price can have at most two decimals"));
    }

    let (name, catalog_price, tax_rate) = match item.item_type {
        ItemType::Service => {
            let service = catalog::get_service(db, item.item_id)
                .await?
                .ok_or_else(|| Error::not_found("Service", item.item_id))?;
            (service.name, service.price, service.tax_rate)
        }
        ItemType::Product => {
            let product = catalog::get_product(db, item.item_id)
                .await?
                .ok_or_else(|| Error::not_found("Product", item.item_id))?;
            (product.name, product.price, product.tax_rate)
        }
    };

    let priced = PricedLine {
        quantity: item.quantity,
        unit_price: item.unit_price.unwrap_or(catalog_price),
        tax_rate,
    };
    Ok(ResolvedLine {
        input: item,
        name,
        priced,
    })
}

/// Creates an order with its items and decrements product stock, all in one transaction.
///
/// Stock is not checked for sufficiency; a line may take stock negative (logged as a warning).
/// The order starts `pending` and is completed when a payment is captured.
#[tracing::instrument(skip(db, input), fields(lines = input.items.len()))]
pub async fn create_order(db: &DatabaseConnection, input: NewOrder) -> Result<OrderWithItems> {
    if input.items.is_empty() {
        return Err(Error::bad_request("An order needs at least one item"));
    }
    if input.discount.is_sign_negative() || input.tip.is_sign_negative() {
        return Err(Error::bad_request("Discount and tip cannot be negative"));
    }
    if !is_money(input.discount) || !is_money(input.tip) {
        return Err(Error::bad_request("Discount and tip can have at most two decimals"));
    }

    let txn = db.begin().await?;

    let mut resolved = Vec::with_capacity(input.items.len());
    for item in input.items {
        resolved.push(resolve_line(&txn, item).await?);
    }

    let priced: Vec<PricedLine> = resolved.iter().map(|r| r.priced).collect();
    let totals = compute_totals(&priced, input.discount, input.tip)?;
    if totals.total.is_sign_negative() {
        return Err(Error::bad_request(format!(
            "Discount {} exceeds the order amount",
            input.discount
        )));
    }

    let now = Utc::now();
    let created = order::ActiveModel {
        customer_id: Set(input.customer_id),
        staff_id: Set(input.staff_id),
        appointment_id: Set(input.appointment_id),
        subtotal: Set(totals.subtotal),
        tax: Set(totals.tax),
        discount: Set(totals.discount),
        tip: Set(totals.tip),
        total: Set(totals.total),
        status: Set(OrderStatus::Pending),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    let mut items = Vec::with_capacity(resolved.len());
    for (line, line_totals) in resolved.into_iter().zip(&totals.lines) {
        let item = order_item::ActiveModel {
            order_id: Set(created.id),
            item_type: Set(line.input.item_type),
            item_id: Set(line.input.item_id),
            name: Set(line.name),
            quantity: Set(line.priced.quantity),
            unit_price: Set(line.priced.unit_price),
            tax_rate: Set(line.priced.tax_rate),
            line_total: Set(line_totals.line_total),
            restocked: Set(false),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        if item.item_type == ItemType::Product {
            catalog::adjust_stock(&txn, item.item_id, -item.quantity).await?;
        }
        items.push(item);
    }

    txn.commit().await?;

    tracing::info!(
        order_id = created.id,
        total = %created.total,
        "Order created"
    );
    Ok(OrderWithItems {
        order: created,
        items,
    })
}

pub async fn get_order<C>(db: &C, order_id: i64) -> Result<Option<OrderModel>>
where
    C: ConnectionTrait,
{
    Order::find_by_id(order_id).one(db).await.map_err(Into::into)
}

pub async fn get_order_with_items(db: &DatabaseConnection, order_id: i64) -> Result<OrderWithItems> {
    let order = get_order(db, order_id)
        .await?
        .ok_or_else(|| Error::not_found("Order", order_id))?;
    let items = OrderItem::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::Id)
        .all(db)
        .await?;
    Ok(OrderWithItems { order, items })
}

/// Orders created on a local date, oldest first.
pub async fn list_orders_for_day(db: &DatabaseConnection, date: NaiveDate, tz: Tz) -> Result<Vec<OrderModel>> {
    let (start, end) = local_day_bounds(date, tz);
    Order::find()
        .filter(order::Column::CreatedAt.gte(start))
        .filter(order::Column::CreatedAt.lt(end))
        .order_by_asc(order::Column::CreatedAt)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Marks a pending order completed. Orders in any other status are left unchanged.
pub async fn complete_order<C>(db: &C, order_id: i64) -> Result<OrderModel>
where
    C: ConnectionTrait,
{
    let existing = get_order(db, order_id)
        .await?
        .ok_or_else(|| Error::not_found("Order", order_id))?;
    if existing.status != OrderStatus::Pending {
        return Ok(existing);
    }

    let mut active: order::ActiveModel = existing.into();
    active.status = Set(OrderStatus::Completed);
    active.updated_at = Set(Utc::now());
    let updated = active.update(db).await?;
    tracing::info!(order_id, "Order completed");
    Ok(updated)
}

/// Refunds an order.
///
/// Full refunds also mark the order's captured payments (and its appointment) refunded.
/// Inventory is not restored; see `restock_item`.
pub async fn refund_order(db: &DatabaseConnection, order_id: i64, kind: RefundKind) -> Result<OrderModel> {
    let txn = db.begin().await?;

    let existing = get_order(&txn, order_id)
        .await?
        .ok_or_else(|| Error::not_found("Order", order_id))?;
    match existing.status {
        OrderStatus::Refunded => {
            return Err(Error::bad_request(format!("Order {order_id} is already refunded")));
        }
        OrderStatus::Pending => {
            return Err(Error::bad_request(format!(
                "Order {order_id} has not been paid and cannot be refunded"
            )));
        }
        OrderStatus::Completed | OrderStatus::PartiallyRefunded => {}
    }

    let appointment_id = existing.appointment_id;
    let now = Utc::now();
    let mut active: order::ActiveModel = existing.into();
    active.status = Set(match kind {
        RefundKind::Full => OrderStatus::Refunded,
        RefundKind::Partial => OrderStatus::PartiallyRefunded,
    });
    active.updated_at = Set(now);
    let updated = active.update(&txn).await?;

    if kind == RefundKind::Full {
        Payment::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentState::Refunded))
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.eq(PaymentState::Captured))
            .exec(&txn)
            .await?;
        if let Some(appointment_id) = appointment_id {
            Appointment::update_many()
                .col_expr(
                    appointment::Column::PaymentStatus,
                    Expr::value(PaymentStatus::Refunded),
                )
                .filter(appointment::Column::Id.eq(appointment_id))
                .exec(&txn)
                .await?;
        }
    }

    txn.commit().await?;
    tracing::info!(order_id, ?kind, "Order refunded");
    Ok(updated)
}

/// Puts one refunded product line back in stock. Each line can be restocked once.
pub async fn restock_item(db: &DatabaseConnection, order_item_id: i64) -> Result<OrderItemModel> {
    let txn = db.begin().await?;

    let item = OrderItem::find_by_id(order_item_id)
        .one(&txn)
        .await?
        .ok_or_else(|| Error::not_found("OrderItem", order_item_id))?;
    if item.item_type != ItemType::Product {
        return Err(Error::bad_request("Only product lines can be restocked"));
    }
    if item.restocked {
        return Err(Error::bad_request(format!(
            "Order line {order_item_id} was already restocked"
        )));
    }
    let order = get_order(&txn, item.order_id)
        .await?
        .ok_or_else(|| Error::not_found("Order", item.order_id))?;
    if !matches!(
        order.status,
        OrderStatus::Refunded | OrderStatus::PartiallyRefunded
    ) {
        return Err(Error::bad_request(format!(
            "Order {} has not been refunded",
            order.id
        )));
    }

    catalog::adjust_stock(&txn, item.item_id, item.quantity).await?;
    let mut active: order_item::ActiveModel = item.into();
    active.restocked = Set(true);
    let updated = active.update(&txn).await?;

    txn.commit().await?;
    tracing::info!(order_item_id, quantity = updated.quantity, "Order line restocked");
    Ok(updated)
}

/// Count and total of completed orders on a local date
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySales {
    pub date: NaiveDate,
    pub count: usize,
    pub total: Decimal,
    pub order_ids: Vec<i64>,
}

/// Sums completed orders created on `date` in the salon timezone.
pub async fn daily_sales(db: &DatabaseConnection, date: NaiveDate, tz: Tz) -> Result<DailySales> {
    let orders: Vec<OrderModel> = list_orders_for_day(db, date, tz)
        .await?
        .into_iter()
        .filter(|o| o.status == OrderStatus::Completed)
        .collect();

    Ok(DailySales {
        date,
        count: orders.len(),
        total: orders.iter().map(|o| o.total).sum(),
        order_ids: orders.iter().map(|o| o.id).collect(),
    })
}
