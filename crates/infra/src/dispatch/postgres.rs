//! Postgres-backed dispatch queue.
//!
//! Lease acquisition picks one ready row with `FOR UPDATE SKIP LOCKED`, so
//! concurrent workers in any number of processes never receive the same
//! delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use productsnap_core::{JobId, LeaseToken, WorkerId};

use super::queue::{
    DispatchQueue, ExpiredLease, Lease, Priority, QueueConfig, QueueDepth, QueueError,
};
use crate::pg::{describe_sqlx_error, is_unique_violation};

#[derive(Debug, Clone)]
pub struct PostgresDispatchQueue {
    pool: Arc<PgPool>,
    config: QueueConfig,
}

impl PostgresDispatchQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self {
            pool: Arc::new(pool),
            config,
        }
    }
}

#[async_trait]
impl DispatchQueue for PostgresDispatchQueue {
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn enqueue(&self, job_id: JobId, priority: Priority) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_queue (job_id, lane, enqueued_at, available_at)
            VALUES ($1, $2, NOW(), NOW())
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(priority.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                QueueError::AlreadyQueued(job_id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn lease(&self, worker_id: WorkerId) -> Result<Option<Lease>, QueueError> {
        let token = LeaseToken::new();
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT job_id,
                       (lane = 'free' AND available_at < NOW() - make_interval(secs => $3)) AS promoted
                FROM dispatch_queue
                WHERE lease_token IS NULL AND available_at <= NOW()
                ORDER BY
                    CASE
                        WHEN lane = 'free' AND available_at < NOW() - make_interval(secs => $3) THEN 0
                        WHEN lane = 'paid' THEN 1
                        ELSE 2
                    END,
                    available_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE dispatch_queue q
            SET lease_token = $1,
                leased_by = $2,
                lease_expires = NOW() + make_interval(secs => $4),
                deliveries = q.deliveries + 1
            FROM candidate
            WHERE q.job_id = candidate.job_id
            RETURNING q.job_id, q.lane, q.deliveries, candidate.promoted
            "#,
        )
        .bind(token.as_uuid())
        .bind(worker_id.as_uuid())
        .bind(self.config.free_lane_aging.as_secs_f64())
        .bind(self.config.visibility_timeout.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lease", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job_id: uuid::Uuid = row.try_get("job_id").map_err(row_error)?;
        let lane: String = row.try_get("lane").map_err(row_error)?;
        let deliveries: i32 = row.try_get("deliveries").map_err(row_error)?;
        let promoted: bool = row.try_get("promoted").map_err(row_error)?;

        Ok(Some(Lease {
            job_id: JobId::from_uuid(job_id),
            token,
            worker_id,
            priority: lane
                .parse()
                .map_err(|e| QueueError::Storage(format!("corrupt queue row: {e}")))?,
            deliveries: deliveries.max(0) as u32,
            promoted,
        }))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn ack(&self, job_id: JobId, token: LeaseToken) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM dispatch_queue WHERE job_id = $1 AND lease_token = $2")
            .bind(job_id.as_uuid())
            .bind(token.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ack", e))?;
        expect_one(result.rows_affected(), job_id)
    }

    async fn extend(&self, job_id: JobId, token: LeaseToken) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_queue
            SET lease_expires = NOW() + make_interval(secs => $3)
            WHERE job_id = $1 AND lease_token = $2 AND lease_expires > NOW()
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(token.as_uuid())
        .bind(self.config.visibility_timeout.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("extend", e))?;
        expect_one(result.rows_affected(), job_id)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn release(
        &self,
        job_id: JobId,
        token: LeaseToken,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_queue
            SET lease_token = NULL,
                leased_by = NULL,
                lease_expires = NULL,
                available_at = NOW() + make_interval(secs => $3)
            WHERE job_id = $1 AND lease_token = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(token.as_uuid())
        .bind(delay.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;
        expect_one(result.rows_affected(), job_id)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn remove(&self, job_id: JobId) -> Result<bool, QueueError> {
        let result =
            sqlx::query("DELETE FROM dispatch_queue WHERE job_id = $1 AND lease_token IS NULL")
                .bind(job_id.as_uuid())
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("remove", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn expired_leases(&self) -> Result<Vec<ExpiredLease>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, lease_token, leased_by
            FROM dispatch_queue
            WHERE lease_token IS NOT NULL AND lease_expires <= NOW()
            ORDER BY job_id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expired_leases", e))?;

        rows.iter()
            .map(|row| {
                let job_id: uuid::Uuid = row.try_get("job_id").map_err(row_error)?;
                let token: uuid::Uuid = row.try_get("lease_token").map_err(row_error)?;
                let worker_id: uuid::Uuid = row.try_get("leased_by").map_err(row_error)?;
                Ok(ExpiredLease {
                    job_id: JobId::from_uuid(job_id),
                    token: LeaseToken::from_uuid(token),
                    worker_id: WorkerId::from_uuid(worker_id),
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn reclaim(&self, job_id: JobId, token: LeaseToken) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_queue
            SET lease_token = NULL,
                leased_by = NULL,
                lease_expires = NULL,
                available_at = NOW()
            WHERE job_id = $1 AND lease_token = $2 AND lease_expires <= NOW()
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(token.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE lease_token IS NULL AND lane = 'paid') AS paid,
                COUNT(*) FILTER (WHERE lease_token IS NULL AND lane = 'free') AS free,
                COUNT(*) FILTER (WHERE lease_token IS NOT NULL) AS leased
            FROM dispatch_queue
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("depth", e))?;

        let paid: i64 = row.try_get("paid").map_err(row_error)?;
        let free: i64 = row.try_get("free").map_err(row_error)?;
        let leased: i64 = row.try_get("leased").map_err(row_error)?;
        Ok(QueueDepth {
            paid: paid as usize,
            free: free as usize,
            leased: leased as usize,
        })
    }
}

fn expect_one(rows: u64, job_id: JobId) -> Result<(), QueueError> {
    if rows == 1 {
        Ok(())
    } else {
        Err(QueueError::LeaseLost(job_id))
    }
}

fn row_error(err: sqlx::Error) -> QueueError {
    QueueError::Storage(format!("failed to deserialize queue row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    QueueError::Storage(describe_sqlx_error(operation, err))
}
