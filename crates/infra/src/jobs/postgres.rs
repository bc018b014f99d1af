//! Postgres-backed job store.
//!
//! Status writes lock the row (`SELECT ... FOR UPDATE`), run the same
//! transition logic as the in-memory store, and write back with
//! `WHERE status = $old AND attempt_count = $old`, so two workers racing on
//! one job can never both commit.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use productsnap_core::{JobId, OwnerId};
use productsnap_jobs::{
    GenerationParameters, Job, JobError, JobMode, JobStatus, PeriodKind, PlanTier,
};

use super::store::{
    CancelRequest, JobCommand, JobStats, JobStore, JobStoreError, JobUpdate, check_attempt,
    execute,
};
use crate::pg::{describe_sqlx_error, is_unique_violation};

const JOB_COLUMNS: &str = "id, owner_id, mode, status, input_ref, parameters, plan_tier, \
    quota_period_kind, quota_period_start, result_refs, progress, attempt_count, max_attempts, \
    cancel_requested, error, created_at, started_at, completed_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn apply(
        &self,
        job_id: JobId,
        command: JobCommand,
        attempt: u32,
    ) -> Result<JobUpdate, JobStoreError> {
        let mut tx = self.begin().await?;
        let current = load_for_update(&mut tx, job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let update = execute(&current, command, attempt, Utc::now())?;
        if update.applied() {
            write_back(&mut tx, &current, &update.job).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(update)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, owner_id = %job.owner_id), err)]
    async fn create(&self, job: Job) -> Result<Job, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, owner_id, mode, status, input_ref, parameters, plan_tier,
                quota_period_kind, quota_period_start, result_refs, progress, attempt_count,
                max_attempts, cancel_requested, error, created_at, started_at, completed_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.owner_id.as_uuid())
        .bind(job.mode.as_str())
        .bind(job.status.as_str())
        .bind(&job.input_ref)
        .bind(Json(&job.parameters))
        .bind(job.plan_tier.as_str())
        .bind(job.quota_period_kind.as_str())
        .bind(job.quota_period_start)
        .bind(Json(&job.result_refs))
        .bind(i16::from(job.progress))
        .bind(job.attempt_count as i32)
        .bind(job.max_attempts as i32)
        .bind(job.cancel_requested)
        .bind(job.error.as_ref().map(Json))
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(owner_id = %owner_id), err)]
    async fn list_by_owner(
        &self,
        owner_id: OwnerId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE owner_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        ))
        .bind(owner_id.as_uuid())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_queued(&self, job_id: JobId) -> Result<JobUpdate, JobStoreError> {
        self.apply(job_id, JobCommand::MarkQueued, 0).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn begin_attempt(&self, job_id: JobId) -> Result<JobUpdate, JobStoreError> {
        self.apply(job_id, JobCommand::BeginAttempt, 0).await
    }

    #[instrument(skip(self, result_refs), fields(job_id = %job_id), err)]
    async fn complete(
        &self,
        job_id: JobId,
        attempt: u32,
        result_refs: Vec<String>,
    ) -> Result<JobUpdate, JobStoreError> {
        self.apply(job_id, JobCommand::Complete(result_refs), attempt)
            .await
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    async fn fail(
        &self,
        job_id: JobId,
        attempt: u32,
        error: JobError,
    ) -> Result<JobUpdate, JobStoreError> {
        self.apply(job_id, JobCommand::Fail(error), attempt).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn requeue(&self, job_id: JobId, attempt: u32) -> Result<JobUpdate, JobStoreError> {
        self.apply(job_id, JobCommand::Requeue, attempt).await
    }

    async fn record_progress(
        &self,
        job_id: JobId,
        attempt: u32,
        percent: u8,
    ) -> Result<bool, JobStoreError> {
        let percent = i16::from(percent.min(100));
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET progress = $3, updated_at = NOW()
            WHERE id = $1 AND attempt_count = $2 AND status = 'processing' AND progress < $3
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(attempt as i32)
        .bind(percent)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_progress", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Not moved: find out whether the caller is stale or just behind.
        let job = self.get(job_id).await?.ok_or(JobStoreError::NotFound(job_id))?;
        check_attempt(&job, attempt)?;
        Ok(false)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn request_cancel(&self, job_id: JobId) -> Result<CancelRequest, JobStoreError> {
        let mut tx = self.begin().await?;
        let current = load_for_update(&mut tx, job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = current.clone();
        let outcome = job.request_cancel(Utc::now());
        if job != current {
            write_back(&mut tx, &current, &job).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(CancelRequest { job, outcome })
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn finish_cancel(&self, job_id: JobId, attempt: u32) -> Result<JobUpdate, JobStoreError> {
        self.apply(job_id, JobCommand::FinishCancel, attempt).await
    }

    #[instrument(skip(self), fields(owner_id = %owner_id), err)]
    async fn stats(&self, owner_id: OwnerId) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM jobs WHERE owner_id = $1 GROUP BY status",
        )
        .bind(owner_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(row_error)?;
            let n: i64 = row.try_get("n").map_err(row_error)?;
            stats.count(parse_column(&status)?, n as usize);
        }
        Ok(stats)
    }
}

async fn load_for_update(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
) -> Result<Option<Job>, JobStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
    ))
    .bind(job_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_job_for_update", e))?;

    row.as_ref().map(job_from_row).transpose()
}

/// Compare-and-set write of every mutable column.
async fn write_back(
    tx: &mut Transaction<'_, Postgres>,
    previous: &Job,
    job: &Job,
) -> Result<(), JobStoreError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $4,
            result_refs = $5,
            progress = $6,
            attempt_count = $7,
            cancel_requested = $8,
            error = $9,
            started_at = $10,
            completed_at = $11,
            updated_at = $12
        WHERE id = $1 AND status = $2 AND attempt_count = $3
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(previous.status.as_str())
    .bind(previous.attempt_count as i32)
    .bind(job.status.as_str())
    .bind(Json(&job.result_refs))
    .bind(i16::from(job.progress))
    .bind(job.attempt_count as i32)
    .bind(job.cancel_requested)
    .bind(job.error.as_ref().map(Json))
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_job", e))?;

    if result.rows_affected() != 1 {
        return Err(JobStoreError::Storage(format!(
            "job {} changed concurrently",
            job.id
        )));
    }
    Ok(())
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let mode: String = row.try_get("mode").map_err(row_error)?;
    let status: String = row.try_get("status").map_err(row_error)?;
    let plan_tier: String = row.try_get("plan_tier").map_err(row_error)?;
    let quota_period_kind: String = row.try_get("quota_period_kind").map_err(row_error)?;
    let parameters: Json<GenerationParameters> = row.try_get("parameters").map_err(row_error)?;
    let result_refs: Json<Vec<String>> = row.try_get("result_refs").map_err(row_error)?;
    let error: Option<Json<JobError>> = row.try_get("error").map_err(row_error)?;
    let progress: i16 = row.try_get("progress").map_err(row_error)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(row_error)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(row_error)?;
    let id: uuid::Uuid = row.try_get("id").map_err(row_error)?;
    let owner_id: uuid::Uuid = row.try_get("owner_id").map_err(row_error)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(row_error)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        owner_id: OwnerId::from_uuid(owner_id),
        mode: parse_column::<JobMode>(&mode)?,
        status: parse_column::<JobStatus>(&status)?,
        input_ref: row.try_get("input_ref").map_err(row_error)?,
        parameters: parameters.0,
        plan_tier: parse_column::<PlanTier>(&plan_tier)?,
        quota_period_kind: parse_column::<PeriodKind>(&quota_period_kind)?,
        quota_period_start: row.try_get("quota_period_start").map_err(row_error)?,
        result_refs: result_refs.0,
        progress: progress.clamp(0, 100) as u8,
        attempt_count: attempt_count.max(0) as u32,
        max_attempts: max_attempts.max(1) as u32,
        cancel_requested: row.try_get("cancel_requested").map_err(row_error)?,
        error: error.map(|e| e.0),
        created_at,
        started_at: row.try_get("started_at").map_err(row_error)?,
        completed_at: row.try_get("completed_at").map_err(row_error)?,
        updated_at: row.try_get("updated_at").map_err(row_error)?,
    })
}

fn parse_column<T>(value: &str) -> Result<T, JobStoreError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    value
        .parse()
        .map_err(|e| JobStoreError::Storage(format!("corrupt job row: {e}")))
}

fn row_error(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to deserialize job row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(describe_sqlx_error(operation, err))
}
