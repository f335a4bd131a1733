//! Budget circuit breakers for quota-limited resources (spend, API calls,
//! orders).
//!
//! Usage increments are conditional updates; readers may see stale values.
//! When `current >= limit` the budget freezes and a `budget_override`
//! approval is raised exactly once per breach epoch: the frozen flag is the
//! epoch latch, and a period reset deliberately leaves it set.

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::sql::Record;
use crate::kernel::error::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "budget_period", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl BudgetPeriod {
    /// The boundary following `from`. Monthly boundaries land on the first
    /// of the next month.
    pub fn next_boundary(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            BudgetPeriod::Daily => from + Duration::days(1),
            BudgetPeriod::Weekly => from + Duration::weeks(1),
            BudgetPeriod::Monthly => {
                let first_of_month = Utc
                    .with_ymd_and_hms(from.year(), from.month(), 1, 0, 0, 0)
                    .single()
                    .unwrap_or(from);
                first_of_month + Months::new(1)
            }
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Budget {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub store_id: Option<Uuid>,
    pub budget_type: String,
    pub period: BudgetPeriod,
    #[sqlx(rename = "budget_limit")]
    pub limit: Decimal,
    pub current: Decimal,
    pub reset_at: DateTime<Utc>,
    pub is_frozen: bool,
    pub created_at: DateTime<Utc>,
}

const BUDGET_COLUMNS: &str = "id, tenant_id, store_id, budget_type, period, budget_limit, \
                              current, reset_at, is_frozen, created_at";

impl Budget {
    pub fn new(
        tenant_id: Uuid,
        store_id: Option<Uuid>,
        budget_type: &str,
        period: BudgetPeriod,
        limit: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            store_id,
            budget_type: budget_type.to_string(),
            period,
            limit,
            current: Decimal::ZERO,
            reset_at: period.next_boundary(now),
            is_frozen: false,
            created_at: now,
        }
    }

    /// Whether the budget has reached its limit (`current == limit` counts).
    pub fn is_breached(&self) -> bool {
        self.current >= self.limit
    }

    /// Atomically add usage. Fails with `BudgetFrozen` when the budget is
    /// frozen; the increment and the freeze check are one conditional update.
    pub async fn consume(
        id: Uuid,
        amount: Decimal,
        db: &PgPool,
    ) -> Result<Self, OrchestratorError> {
        let budget = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE budgets
            SET current = current + $1
            WHERE id = $2 AND is_frozen = FALSE
            RETURNING {BUDGET_COLUMNS}
            "#,
        ))
        .bind(amount)
        .bind(id)
        .fetch_optional(db)
        .await?;

        match budget {
            Some(budget) => Ok(budget),
            None => {
                // Distinguish a frozen budget from a missing one.
                let frozen = Self::find_by_id(id, db)
                    .await
                    .map_err(|_| OrchestratorError::NotFound(format!("budget {id}")))?;
                Err(OrchestratorError::BudgetFrozen {
                    budget_id: frozen.id,
                    budget_type: frozen.budget_type,
                })
            }
        }
    }

    /// The budget governing an action: a store-scoped budget of the given
    /// type wins over a tenant-wide one.
    pub async fn find_applicable(
        tenant_id: Uuid,
        store_id: Option<Uuid>,
        budget_type: &str,
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let budget = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {BUDGET_COLUMNS}
            FROM budgets
            WHERE tenant_id = $1
              AND budget_type = $2
              AND (store_id = $3 OR store_id IS NULL)
            ORDER BY store_id NULLS LAST
            LIMIT 1
            "#,
        ))
        .bind(tenant_id)
        .bind(budget_type)
        .bind(store_id)
        .fetch_optional(db)
        .await?;

        Ok(budget)
    }

    /// Freeze every breached, unfrozen budget for a tenant. The CAS on
    /// `is_frozen = FALSE` guarantees each breach epoch is claimed by exactly
    /// one caller; only that caller's rows are returned for approval
    /// emission.
    pub async fn freeze_breached(tenant_id: Uuid, db: &PgPool) -> Result<Vec<Self>> {
        let frozen = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE budgets
            SET is_frozen = TRUE
            WHERE tenant_id = $1 AND is_frozen = FALSE AND current >= budget_limit
            RETURNING {BUDGET_COLUMNS}
            "#,
        ))
        .bind(tenant_id)
        .fetch_all(db)
        .await?;

        Ok(frozen)
    }

    /// Reset budgets whose period boundary passed: zero usage, advance
    /// `reset_at`. The freeze is left untouched; operators clear it through
    /// an approved `budget_override`.
    pub async fn reset_due(db: &PgPool) -> Result<u64> {
        let due = sqlx::query_as::<_, Self>(&format!(
            "SELECT {BUDGET_COLUMNS} FROM budgets WHERE reset_at <= NOW()",
        ))
        .fetch_all(db)
        .await?;

        let mut reset = 0u64;
        for budget in due {
            let next = budget.period.next_boundary(budget.reset_at);
            let updated = sqlx::query(
                r#"
                UPDATE budgets
                SET current = 0, reset_at = $1
                WHERE id = $2 AND reset_at = $3
                "#,
            )
            .bind(next)
            .bind(budget.id)
            .bind(budget.reset_at)
            .execute(db)
            .await?
            .rows_affected();
            reset += updated;
        }

        Ok(reset)
    }

    /// Operator unfreeze, driven by an approved `budget_override`.
    pub async fn unfreeze(id: Uuid, db: &PgPool) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE budgets SET is_frozen = FALSE WHERE id = $1 AND is_frozen = TRUE",
        )
        .bind(id)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }
}

#[async_trait::async_trait]
impl Record for Budget {
    const TABLE: &'static str = "budgets";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Self> {
        let budget = sqlx::query_as::<_, Self>(&format!(
            "SELECT {BUDGET_COLUMNS} FROM budgets WHERE id = $1",
        ))
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(budget)
    }

    async fn insert(&self, db: &PgPool) -> Result<Self> {
        let budget = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO budgets (
                id, tenant_id, store_id, budget_type, period, budget_limit,
                current, reset_at, is_frozen, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {BUDGET_COLUMNS}
            "#,
        ))
        .bind(self.id)
        .bind(self.tenant_id)
        .bind(self.store_id)
        .bind(&self.budget_type)
        .bind(self.period)
        .bind(self.limit)
        .bind(self.current)
        .bind(self.reset_at)
        .bind(self.is_frozen)
        .bind(self.created_at)
        .fetch_one(db)
        .await?;

        Ok(budget)
    }

    async fn update(&self, db: &PgPool) -> Result<Self> {
        let budget = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE budgets
            SET budget_type = $1, period = $2, budget_limit = $3, reset_at = $4
            WHERE id = $5
            RETURNING {BUDGET_COLUMNS}
            "#,
        ))
        .bind(&self.budget_type)
        .bind(self.period)
        .bind(self.limit)
        .bind(self.reset_at)
        .bind(self.id)
        .fetch_one(db)
        .await?;

        Ok(budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_at_limit_is_breached() {
        let mut budget = Budget::new(
            Uuid::new_v4(),
            None,
            "api_calls",
            BudgetPeriod::Daily,
            Decimal::from(100),
        );
        budget.current = Decimal::from(99);
        assert!(!budget.is_breached());

        budget.current = Decimal::from(100);
        assert!(budget.is_breached());
    }

    #[test]
    fn daily_boundary_advances_one_day() {
        let from = Utc.with_ymd_and_hms(2026, 3, 10, 6, 30, 0).unwrap();
        assert_eq!(
            BudgetPeriod::Daily.next_boundary(from),
            from + Duration::days(1)
        );
    }

    #[test]
    fn monthly_boundary_lands_on_first_of_next_month() {
        let from = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();
        let next = BudgetPeriod::Monthly.next_boundary(from);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());
    }
}
