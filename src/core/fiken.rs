//! Fiken reconciliation - pushing completed sales to the accounting system.
//!
//! Creating a sale in Fiken takes three remote calls (draft, sale from draft, settlement). A
//! `fiken_sale_attempts` row per order records the last step that succeeded, so a retry resumes
//! where the previous attempt stopped instead of creating a second draft. Nothing is rolled back
//! remotely. The daily sync pushes every completed order of a date and writes an append-only
//! `fiken_sync_logs` row; failures notify the owner.

use crate::{
    core::{
        notification::notify_owner,
        order::{self, OrderWithItems, line_tax},
    },
    entities::{
        FikenSaleAttempt, FikenSaleAttemptModel, FikenSyncLog, FikenSyncLogModel, OrderStatus,
        SagaStep, SyncStatus, SyncType, fiken_sale_attempt, fiken_sync_log,
    },
    errors::{Error, Result},
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use sea_orm::{QueryOrder, QuerySelect, Set, prelude::*};
use serde::{Deserialize, Serialize};

/// Totals closer than this are considered equal.
pub const MONEY_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Fiken income account for salon sales
pub const INCOME_ACCOUNT: &str = "3000";

/// Fiken VAT classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VatType {
    High,
    Medium,
    Low,
    None,
}

/// Maps a tax percentage to a Fiken VAT class.
///
/// 25 → HIGH, 15 → MEDIUM, 12 → LOW, 0 → NONE. Any other rate falls back to HIGH with a warning.
#[must_use]
pub fn vat_type_for_rate(rate: Decimal) -> VatType {
    match rate.normalize().to_u32() {
        Some(25) if rate.fract().is_zero() => VatType::High,
        Some(15) if rate.fract().is_zero() => VatType::Medium,
        Some(12) if rate.fract().is_zero() => VatType::Low,
        Some(0) if rate.is_zero() => VatType::None,
        _ => {
            tracing::warn!(%rate, "Unknown VAT rate, defaulting to HIGH");
            VatType::High
        }
    }
}

/// Converts kroner to øre, rounding to the nearest øre.
#[must_use]
pub fn to_ore(amount: Decimal) -> i64 {
    amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|ore| ore.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|ore| ore.to_i64())
        .unwrap_or_default()
}

#[must_use]
pub fn from_ore(ore: i64) -> Decimal {
    Decimal::new(ore, 2)
}

/// One line of a Fiken sale. Amounts are in øre.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleLine {
    pub description: String,
    pub net_price: i64,
    pub vat: i64,
    pub vat_type: VatType,
    pub income_account: String,
}

/// A cash-sale draft for one order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleDraft {
    pub date: NaiveDate,
    /// `ORD-<id>`, used to find the sale again in Fiken
    pub reference: String,
    pub lines: Vec<SaleLine>,
    pub payment_account: String,
}

impl SaleDraft {
    /// Gross amount of the draft in øre.
    #[must_use]
    pub fn gross_ore(&self) -> i64 {
        self.lines.iter().map(|l| l.net_price + l.vat).sum()
    }
}

/// Settlement of a created sale
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub payment_date: NaiveDate,
    pub amount: i64,
    pub payment_account: String,
}

/// A sale as reported by Fiken
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSale {
    pub sale_id: i64,
    pub date: NaiveDate,
    pub total: Decimal,
}

/// The Fiken operations reconciliation needs. Implemented by `integrations::fiken::FikenClient`
/// and by fakes in tests.
#[async_trait]
pub trait FikenApi: Send + Sync {
    /// Returns the draft id.
    async fn create_sale_draft(&self, draft: &SaleDraft) -> Result<i64>;
    /// Returns the sale id.
    async fn create_sale_from_draft(&self, draft_id: i64) -> Result<i64>;
    async fn settle_sale(&self, sale_id: i64, settlement: &Settlement) -> Result<()>;
    async fn sales_for_date(&self, date: NaiveDate) -> Result<Vec<RemoteSale>>;
}

/// Builds the Fiken sale for an order.
///
/// Each item keeps its own rounded VAT so Fiken's gross equals the local total. Tip and discount
/// are VAT-free lines.
#[must_use]
pub fn build_sale_draft(order: &OrderWithItems, date: NaiveDate, payment_account: &str) -> SaleDraft {
    let mut lines: Vec<SaleLine> = order
        .items
        .iter()
        .map(|item| SaleLine {
            description: if item.quantity == 1 {
                item.name.clone()
            } else {
                format!("{} x{}", item.name, item.quantity)
            },
            net_price: to_ore(item.line_total),
            vat: to_ore(line_tax(item.line_total, item.tax_rate)),
            vat_type: vat_type_for_rate(item.tax_rate),
            income_account: INCOME_ACCOUNT.to_string(),
        })
        .collect();

    if order.order.tip > Decimal::ZERO {
        lines.push(SaleLine {
            description: "Tips".to_string(),
            net_price: to_ore(order.order.tip),
            vat: 0,
            vat_type: VatType::None,
            income_account: INCOME_ACCOUNT.to_string(),
        });
    }
    if order.order.discount > Decimal::ZERO {
        lines.push(SaleLine {
            description: "Rabatt".to_string(),
            net_price: -to_ore(order.order.discount),
            vat: 0,
            vat_type: VatType::None,
            income_account: INCOME_ACCOUNT.to_string(),
        });
    }

    SaleDraft {
        date,
        reference: format!("ORD-{}", order.order.id),
        lines,
        payment_account: payment_account.to_string(),
    }
}

/// Result of comparing local and Fiken totals
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TotalsCheck {
    pub local: Decimal,
    pub external: Decimal,
    /// `local - external`
    pub difference: Decimal,
    pub matches: bool,
}

/// Compares two totals. Never corrects anything.
#[must_use]
pub fn verify_totals(local: Decimal, external: Decimal) -> TotalsCheck {
    TotalsCheck {
        local,
        external,
        difference: local - external,
        matches: (external - local).abs() < MONEY_TOLERANCE,
    }
}

async fn load_attempt(db: &DatabaseConnection, order_id: i64) -> Result<FikenSaleAttemptModel> {
    if let Some(existing) = FikenSaleAttempt::find()
        .filter(fiken_sale_attempt::Column::OrderId.eq(order_id))
        .one(db)
        .await?
    {
        return Ok(existing);
    }

    let now = Utc::now();
    fiken_sale_attempt::ActiveModel {
        order_id: Set(order_id),
        step: Set(SagaStep::Started),
        draft_id: Set(None),
        sale_id: Set(None),
        last_error: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

async fn save_step(
    db: &DatabaseConnection,
    attempt: FikenSaleAttemptModel,
    step: SagaStep,
    draft_id: Option<i64>,
    sale_id: Option<i64>,
) -> Result<FikenSaleAttemptModel> {
    let mut active: fiken_sale_attempt::ActiveModel = attempt.into();
    active.step = Set(step);
    if draft_id.is_some() {
        active.draft_id = Set(draft_id);
    }
    if sale_id.is_some() {
        active.sale_id = Set(sale_id);
    }
    active.last_error = Set(None);
    active.updated_at = Set(Utc::now());
    active.update(db).await.map_err(Into::into)
}

async fn record_failure(db: &DatabaseConnection, attempt: FikenSaleAttemptModel, error: &Error) -> Result<()> {
    let order_id = attempt.order_id;
    let step = attempt.step;
    let mut active: fiken_sale_attempt::ActiveModel = attempt.into();
    active.last_error = Set(Some(error.to_string()));
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    tracing::warn!(order_id, ?step, %error, "Fiken sale step failed");
    Ok(())
}

/// Pushes one completed order to Fiken, resuming from the last completed step.
#[tracing::instrument(skip(db, api, payment_account))]
pub async fn sync_order_to_fiken(
    db: &DatabaseConnection,
    api: &dyn FikenApi,
    order_id: i64,
    date: NaiveDate,
    payment_account: &str,
) -> Result<FikenSaleAttemptModel> {
    let order = order::get_order_with_items(db, order_id).await?;
    if order.order.status != OrderStatus::Completed {
        return Err(Error::bad_request(format!(
            "Order {order_id} is not completed and cannot be sent to Fiken"
        )));
    }

    let mut attempt = load_attempt(db, order_id).await?;
    let draft = build_sale_draft(&order, date, payment_account);

    loop {
        let step_result = match (attempt.step, attempt.draft_id, attempt.sale_id) {
            (SagaStep::Settled, _, _) => return Ok(attempt),
            (SagaStep::Started, _, _) => api
                .create_sale_draft(&draft)
                .await
                .map(|draft_id| (SagaStep::DraftCreated, Some(draft_id), None)),
            (SagaStep::DraftCreated, Some(draft_id), _) => api
                .create_sale_from_draft(draft_id)
                .await
                .map(|sale_id| (SagaStep::SaleCreated, None, Some(sale_id))),
            (SagaStep::SaleCreated, _, Some(sale_id)) => {
                let settlement = Settlement {
                    payment_date: date,
                    amount: draft.gross_ore(),
                    payment_account: payment_account.to_string(),
                };
                api.settle_sale(sale_id, &settlement)
                    .await
                    .map(|()| (SagaStep::Settled, None, None))
            }
            (step, _, _) => Err(Error::Config {
                message: format!("Fiken attempt for order {order_id} is at {step:?} without an id"),
            }),
        };

        match step_result {
            Ok((step, draft_id, sale_id)) => {
                attempt = save_step(db, attempt, step, draft_id, sale_id).await?;
                tracing::debug!(order_id, ?step, "Fiken sale step completed");
            }
            Err(error) => {
                record_failure(db, attempt, &error).await?;
                return Err(error);
            }
        }
    }
}

/// Compares the local completed-sales total of a date with the sum of Fiken sales.
pub async fn verify_day(
    db: &DatabaseConnection,
    api: &dyn FikenApi,
    date: NaiveDate,
    tz: Tz,
) -> Result<TotalsCheck> {
    let local = order::daily_sales(db, date, tz).await?;
    let remote: Decimal = api
        .sales_for_date(date)
        .await?
        .iter()
        .map(|sale| sale.total)
        .sum();
    let check = verify_totals(local.total, remote);
    if !check.matches {
        tracing::warn!(%date, local = %check.local, external = %check.external, "Fiken totals differ");
    }
    Ok(check)
}

/// Outcome of a daily sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Integration disabled or credentials missing; nothing was written
    Skipped,
    Completed { log: FikenSyncLogModel },
    Failed { log: FikenSyncLogModel },
}

/// Pushes every completed order of `date` to Fiken and records the run.
///
/// `api` is `None` when the integration is disabled or not configured. Failures are recorded in
/// the sync log and reported to the owner; there is no automatic retry.
#[tracing::instrument(skip(db, api, payment_account, tz))]
pub async fn run_daily_sync(
    db: &DatabaseConnection,
    api: Option<&dyn FikenApi>,
    payment_account: &str,
    tz: Tz,
    date: NaiveDate,
    sync_type: SyncType,
) -> Result<SyncOutcome> {
    let Some(api) = api else {
        tracing::info!("Fiken integration not configured, skipping sync");
        return Ok(SyncOutcome::Skipped);
    };

    let log = fiken_sync_log::ActiveModel {
        sync_date: Set(date),
        started_at: Set(Utc::now()),
        finished_at: Set(None),
        status: Set(SyncStatus::InProgress),
        sales_count: Set(0),
        total_amount: Set(Decimal::ZERO),
        error_message: Set(None),
        sync_type: Set(sync_type),
        ..Default::default()
    }
    .insert(db)
    .await?;

    let mut synced = 0_i32;
    let mut synced_total = Decimal::ZERO;
    let mut errors = Vec::new();

    let order_ids = match order::daily_sales(db, date, tz).await {
        Ok(sales) => sales.order_ids,
        Err(error) => {
            errors.push(format!("Loading sales failed: {error}"));
            Vec::new()
        }
    };

    for order_id in &order_ids {
        match sync_order_to_fiken(db, api, *order_id, date, payment_account).await {
            Ok(_) => {
                synced += 1;
                match order::get_order(db, *order_id).await {
                    Ok(Some(order)) => synced_total += order.total,
                    Ok(None) => {}
                    Err(error) => errors.push(format!("ORD-{order_id}: {error}")),
                }
            }
            Err(error) => errors.push(format!("ORD-{order_id}: {error}")),
        }
    }

    if errors.is_empty() {
        match verify_day(db, api, date, tz).await {
            Ok(check) if !check.matches => errors.push(format!(
                "Totals differ: local {} vs Fiken {} (difference {})",
                check.local, check.external, check.difference
            )),
            Ok(_) => {}
            Err(error) => errors.push(format!("Verification failed: {error}")),
        }
    }

    let failed = !errors.is_empty();
    let mut active: fiken_sync_log::ActiveModel = log.into();
    active.finished_at = Set(Some(Utc::now()));
    active.sales_count = Set(synced);
    active.total_amount = Set(synced_total);
    active.status = Set(if failed {
        SyncStatus::Failure
    } else {
        SyncStatus::Success
    });
    active.error_message = Set(failed.then(|| errors.join("; ")));
    let log = active.update(db).await?;

    if failed {
        let body = format!(
            "Fiken sync for {date} failed: {}",
            log.error_message.as_deref().unwrap_or_default()
        );
        tracing::error!(%date, errors = errors.len(), "Fiken sync failed");
        if let Err(error) = notify_owner(db, "Fiken sync failed", &body).await {
            tracing::error!(%date, %error, "Could not notify owner of failed Fiken sync");
        }
        Ok(SyncOutcome::Failed { log })
    } else {
        tracing::info!(%date, sales = synced, total = %synced_total, "Fiken sync completed");
        Ok(SyncOutcome::Completed { log })
    }
}

/// Most recent sync runs first.
pub async fn list_sync_logs(db: &DatabaseConnection, limit: u64) -> Result<Vec<FikenSyncLogModel>> {
    FikenSyncLog::find()
        .order_by_desc(fiken_sync_log::Column::StartedAt)
        .order_by_desc(fiken_sync_log::Column::Id)
        .limit(limit)
        .all(db)
        .await
        .map_err(Into::into)
}

pub async fn get_attempt(db: &DatabaseConnection, order_id: i64) -> Result<Option<FikenSaleAttemptModel>> {
    FikenSaleAttempt::find()
        .filter(fiken_sale_attempt::Column::OrderId.eq(order_id))
        .one(db)
        .await
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;
    use crate::{
        core::{notification::list_notifications, order::complete_order},
        test_utils::{create_test_order, setup_test_db},
    };
    use std::sync::Mutex;

    /// In-memory Fiken that can be told to fail one call of a given step
    #[derive(Default)]
    struct FakeFiken {
        drafts: Mutex<Vec<SaleDraft>>,
        sales: Mutex<Vec<RemoteSale>>,
        settled: Mutex<Vec<i64>>,
        fail_next_sale_from_draft: Mutex<bool>,
    }

    #[async_trait]
    impl FikenApi for FakeFiken {
        async fn create_sale_draft(&self, draft: &SaleDraft) -> Result<i64> {
            let mut drafts = self.drafts.lock().unwrap();
            drafts.push(draft.clone());
            Ok(i64::try_from(drafts.len()).unwrap() + 100)
        }

        async fn create_sale_from_draft(&self, draft_id: i64) -> Result<i64> {
            let mut fail = self.fail_next_sale_from_draft.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(Error::Upstream {
                    provider: "fiken",
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            let drafts = self.drafts.lock().unwrap();
            let index = usize::try_from(draft_id - 101).unwrap();
            let draft = &drafts[index];
            let sale_id = draft_id + 1000;
            self.sales.lock().unwrap().push(RemoteSale {
                sale_id,
                date: draft.date,
                total: from_ore(draft.gross_ore()),
            });
            Ok(sale_id)
        }

        async fn settle_sale(&self, sale_id: i64, _settlement: &Settlement) -> Result<()> {
            self.settled.lock().unwrap().push(sale_id);
            Ok(())
        }

        async fn sales_for_date(&self, date: NaiveDate) -> Result<Vec<RemoteSale>> {
            Ok(self
                .sales
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.date == date)
                .cloned()
                .collect())
        }
    }

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn test_vat_type_mapping() {
        assert_eq!(vat_type_for_rate(dec("25")), VatType::High);
        assert_eq!(vat_type_for_rate(dec("25.00")), VatType::High);
        assert_eq!(vat_type_for_rate(dec("15")), VatType::Medium);
        assert_eq!(vat_type_for_rate(dec("12")), VatType::Low);
        assert_eq!(vat_type_for_rate(dec("0")), VatType::None);
        assert_eq!(vat_type_for_rate(dec("8")), VatType::High);
        assert_eq!(vat_type_for_rate(dec("12.5")), VatType::High);
    }

    #[test]
    fn test_to_ore_rounds_half_away_from_zero() {
        assert_eq!(to_ore(dec("350.00")), 35000);
        assert_eq!(to_ore(dec("0.125")), 13);
        assert_eq!(to_ore(dec("0.135")), 14);
        assert_eq!(to_ore(dec("-0.125")), -13);
        assert_eq!(to_ore(Decimal::MAX), 0);
    }

    #[test]
    fn test_verify_totals() {
        let close = verify_totals(dec("1000.00"), dec("1000.005"));
        assert!(close.matches);

        let off = verify_totals(dec("1000.00"), dec("800.00"));
        assert!(!off.matches);
        assert_eq!(off.difference, dec("200.00"));
        assert_eq!(off.local, dec("1000.00"));
        assert_eq!(off.external, dec("800.00"));
    }

    #[tokio::test]
    async fn test_saga_resumes_without_duplicate_draft() -> Result<()> {
        let db = setup_test_db().await?;
        let created = create_test_order(&db).await?;
        complete_order(&db, created.id).await?;
        let fake = FakeFiken::default();
        *fake.fail_next_sale_from_draft.lock().unwrap() = true;
        let date = Utc::now().date_naive();

        let first = sync_order_to_fiken(&db, &fake, created.id, date, "1920:10001").await;
        assert!(matches!(first, Err(Error::Upstream { .. })));
        let attempt = get_attempt(&db, created.id).await?.unwrap();
        assert_eq!(attempt.step, SagaStep::DraftCreated);
        assert!(attempt.last_error.is_some());

        let second = sync_order_to_fiken(&db, &fake, created.id, date, "1920:10001").await?;
        assert_eq!(second.step, SagaStep::Settled);
        assert!(second.last_error.is_none());
        assert_eq!(fake.drafts.lock().unwrap().len(), 1);
        assert_eq!(fake.settled.lock().unwrap().len(), 1);

        // Already settled: no further remote calls
        sync_order_to_fiken(&db, &fake, created.id, date, "1920:10001").await?;
        assert_eq!(fake.settled.lock().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_sale_draft_matches_local_total() -> Result<()> {
        let db = setup_test_db().await?;
        let created = create_test_order(&db).await?;
        let order = order::get_order_with_items(&db, created.id).await?;
        let draft = build_sale_draft(&order, Utc::now().date_naive(), "1920:10001");
        assert_eq!(from_ore(draft.gross_ore()), order.order.total);
        assert_eq!(draft.reference, format!("ORD-{}", created.id));
        Ok(())
    }

    #[tokio::test]
    async fn test_daily_sync_skipped_without_integration() -> Result<()> {
        let db = setup_test_db().await?;
        let outcome = run_daily_sync(
            &db,
            None,
            "1920:10001",
            chrono_tz::UTC,
            Utc::now().date_naive(),
            SyncType::Automatic,
        )
        .await?;
        assert_eq!(outcome, SyncOutcome::Skipped);
        assert!(list_sync_logs(&db, 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_daily_sync_success_and_failure_logging() -> Result<()> {
        let db = setup_test_db().await?;
        let first = create_test_order(&db).await?;
        complete_order(&db, first.id).await?;
        let date = Utc::now().date_naive();
        let fake = FakeFiken::default();

        let outcome = run_daily_sync(&db, Some(&fake), "1920:10001", chrono_tz::UTC, date, SyncType::Manual).await?;
        let SyncOutcome::Completed { log } = outcome else {
            panic!("expected a completed sync");
        };
        assert_eq!(log.status, SyncStatus::Success);
        assert_eq!(log.sales_count, 1);
        assert_eq!(log.sync_type, SyncType::Manual);
        assert!(log.finished_at.is_some());

        let second = create_test_order(&db).await?;
        complete_order(&db, second.id).await?;
        *fake.fail_next_sale_from_draft.lock().unwrap() = true;
        let outcome = run_daily_sync(&db, Some(&fake), "1920:10001", chrono_tz::UTC, date, SyncType::Automatic).await?;
        let SyncOutcome::Failed { log } = outcome else {
            panic!("expected a failed sync");
        };
        assert_eq!(log.status, SyncStatus::Failure);
        assert!(log.error_message.unwrap().contains(&format!("ORD-{}", second.id)));

        let notifications = list_notifications(&db, true, 10).await?;
        assert_eq!(notifications.len(), 1);
        assert_eq!(list_sync_logs(&db, 10).await?.len(), 2);
        Ok(())
    }
    #[tokio::test]
    async fn test_daily_sync_finalizes_log_when_sales_cannot_load() -> Result<()> {
        let db = setup_test_db().await?;
        db.execute_unprepared("DROP TABLE orders").await?;
        let fake = FakeFiken::default();
        let date = Utc::now().date_naive();

        let outcome = run_daily_sync(&db, Some(&fake), "1920:10001", chrono_tz::UTC, date, SyncType::Automatic).await?;
        let SyncOutcome::Failed { log } = outcome else {
            panic!("expected a failed sync");
        };
        assert_eq!(log.status, SyncStatus::Failure);
        assert!(log.finished_at.is_some());
        assert!(log.error_message.unwrap().contains("Loading sales failed"));
        assert_eq!(list_notifications(&db, true, 10).await?.len(), 1);
        Ok(())
    }
}
