//! Postgres-backed quota ledger.
//!
//! Admission is a conditional `UPDATE ... WHERE usage_count < quota_limit`;
//! Postgres serializes concurrent updates of the row, so the limit holds
//! across any number of admitting processes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use productsnap_core::OwnerId;
use productsnap_jobs::{PeriodKind, PlanLimit, PlanTier, QuotaPeriodRecord, UsageSnapshot};

use super::ledger::{QuotaDebit, QuotaError, QuotaLedger};
use crate::pg::describe_sqlx_error;

#[derive(Debug, Clone)]
pub struct PostgresQuotaLedger {
    pool: Arc<PgPool>,
}

impl PostgresQuotaLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn active_record(
        &self,
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaPeriodRecord>, QuotaError> {
        let row = sqlx::query(
            r#"
            SELECT owner_id, plan_tier, period_kind, period_start, period_end, usage_count, quota_limit
            FROM quota_periods
            WHERE owner_id = $1 AND period_start <= $2 AND period_end > $2
            ORDER BY period_start DESC, period_end ASC
            LIMIT 1
            "#,
        )
        .bind(owner_id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_quota_period", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Insert the record for the period containing `now` unless a concurrent
    /// admission already did.
    async fn open_record(&self, record: &QuotaPeriodRecord) -> Result<(), QuotaError> {
        sqlx::query(
            r#"
            INSERT INTO quota_periods
                (owner_id, plan_tier, period_kind, period_start, period_end, usage_count, quota_limit)
            VALUES ($1, $2, $3, $4, $5, 0, $6)
            ON CONFLICT (owner_id, period_kind, period_start) DO NOTHING
            "#,
        )
        .bind(record.owner_id.as_uuid())
        .bind(record.plan_tier.as_str())
        .bind(record.period_kind.as_str())
        .bind(record.period_start)
        .bind(record.period_end)
        .bind(record.limit as i32)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("open_quota_period", e))?;
        Ok(())
    }
}

#[async_trait]
impl QuotaLedger for PostgresQuotaLedger {
    #[instrument(skip(self), fields(owner_id = %owner_id), err)]
    async fn try_debit(
        &self,
        owner_id: OwnerId,
        plan_tier: PlanTier,
        limit: PlanLimit,
        now: DateTime<Utc>,
    ) -> Result<QuotaDebit, QuotaError> {
        let record = match self.active_record(owner_id, now).await? {
            Some(record) => record,
            None => {
                let fresh = QuotaPeriodRecord::open(owner_id, plan_tier, limit, now);
                self.open_record(&fresh).await?;
                self.active_record(owner_id, now)
                    .await?
                    .ok_or_else(|| QuotaError::Storage("quota period not opened".to_string()))?
            }
        };

        let row = sqlx::query(
            r#"
            UPDATE quota_periods
            SET usage_count = usage_count + 1
            WHERE owner_id = $1 AND period_kind = $2 AND period_start = $3
              AND usage_count < quota_limit
            RETURNING usage_count
            "#,
        )
        .bind(owner_id.as_uuid())
        .bind(record.period_kind.as_str())
        .bind(record.period_start)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("debit_quota", e))?;

        let Some(row) = row else {
            return Err(QuotaError::Exceeded {
                limit: record.limit,
                period_kind: record.period_kind,
                period_end: record.period_end,
            });
        };
        let usage_count: i32 = row.try_get("usage_count").map_err(row_error)?;

        Ok(QuotaDebit {
            owner_id,
            period_kind: record.period_kind,
            period_start: record.period_start,
            period_end: record.period_end,
            usage_count: usage_count.max(0) as u32,
            limit: record.limit,
        })
    }

    #[instrument(skip(self), fields(owner_id = %owner_id), err)]
    async fn credit(
        &self,
        owner_id: OwnerId,
        period_kind: PeriodKind,
        period_start: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        sqlx::query(
            r#"
            UPDATE quota_periods
            SET usage_count = GREATEST(usage_count - 1, 0)
            WHERE owner_id = $1 AND period_kind = $2 AND period_start = $3
            "#,
        )
        .bind(owner_id.as_uuid())
        .bind(period_kind.as_str())
        .bind(period_start)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("credit_quota", e))?;
        Ok(())
    }

    async fn snapshot(
        &self,
        owner_id: OwnerId,
        plan_tier: PlanTier,
        limit: PlanLimit,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, QuotaError> {
        let record = self
            .active_record(owner_id, now)
            .await?
            .unwrap_or_else(|| QuotaPeriodRecord::open(owner_id, plan_tier, limit, now));
        Ok(record.snapshot())
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<QuotaPeriodRecord, QuotaError> {
    let owner_id: uuid::Uuid = row.try_get("owner_id").map_err(row_error)?;
    let plan_tier: String = row.try_get("plan_tier").map_err(row_error)?;
    let period_kind: String = row.try_get("period_kind").map_err(row_error)?;
    let usage_count: i32 = row.try_get("usage_count").map_err(row_error)?;
    let limit: i32 = row.try_get("quota_limit").map_err(row_error)?;

    Ok(QuotaPeriodRecord {
        owner_id: OwnerId::from_uuid(owner_id),
        plan_tier: plan_tier
            .parse::<PlanTier>()
            .map_err(|e| QuotaError::Storage(format!("corrupt quota row: {e}")))?,
        period_kind: period_kind
            .parse::<PeriodKind>()
            .map_err(|e| QuotaError::Storage(format!("corrupt quota row: {e}")))?,
        period_start: row.try_get("period_start").map_err(row_error)?,
        period_end: row.try_get("period_end").map_err(row_error)?,
        usage_count: usage_count.max(0) as u32,
        limit: limit.max(0) as u32,
    })
}

fn row_error(err: sqlx::Error) -> QuotaError {
    QuotaError::Storage(format!("failed to deserialize quota row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QuotaError {
    QuotaError::Storage(describe_sqlx_error(operation, err))
}
