use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use super::JobLedger;
use crate::{
    JobId,
    entity::{Job, JobStatus, NewJob},
    error::JobError,
};

const JOB_COLUMNS: &str = "id, type, target, payload, status, error, created_at, started_at, \
                           finished_at, attempt_count, requested_by";

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    #[sqlx(rename = "type")]
    kind: String,
    target: String,
    payload: serde_json::Value,
    status: String,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    requested_by: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from(row.id),
            kind: row.kind.parse()?,
            target: row.target,
            payload: row.payload,
            status: row.status.parse()?,
            error: row.error,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or_default(),
            requested_by: row.requested_by,
        })
    }
}

/// Postgres-backed ledger over the `jobs` table.
#[derive(Clone, Debug)]
pub struct PgJobLedger {
    pool: PgPool,
}

impl PgJobLedger {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Conditional single-row update. Distinguishes "not in the expected
    /// state" from "row is gone".
    async fn transition(
        &self,
        id: JobId,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, JobRow, sqlx::postgres::PgArguments>,
    ) -> Result<Option<Job>, JobError> {
        match query.fetch_optional(&self.pool).await? {
            Some(row) => Ok(Some(row.try_into()?)),
            None => {
                self.find_by_id(id).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl JobLedger for PgJobLedger {
    #[instrument(name = "job_ledger.create", skip_all, fields(job_id = %new_job.id, job_kind = %new_job.kind), err)]
    async fn create(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Job, JobError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO jobs (id, type, target, payload, status, created_at, attempt_count, requested_by)
            VALUES ($1, $2, $3, $4, 'PENDING', $5, 0, $6)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::from(new_job.id))
        .bind(new_job.kind.as_str())
        .bind(&new_job.target)
        .bind(&new_job.payload)
        .bind(now)
        .bind(&new_job.requested_by)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    #[instrument(name = "job_ledger.find_by_id", skip(self), err(level = "debug"))]
    async fn find_by_id(&self, id: JobId) -> Result<Job, JobError> {
        sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await?
            .ok_or(JobError::NotFound(id))?
            .try_into()
    }

    #[instrument(name = "job_ledger.mark_started", skip(self, now), err)]
    async fn mark_started(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'IN_PROGRESS', started_at = $2, attempt_count = attempt_count + 1
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::from(id))
            .bind(now);
        self.transition(id, query).await
    }

    #[instrument(name = "job_ledger.mark_completed", skip(self, now), err)]
    async fn mark_completed(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'COMPLETED', finished_at = $2, error = NULL
            WHERE id = $1 AND status = 'IN_PROGRESS'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::from(id))
            .bind(now);
        self.transition(id, query).await
    }

    #[instrument(name = "job_ledger.mark_failed", skip(self, message, now), err)]
    async fn mark_failed(
        &self,
        id: JobId,
        message: &str,
        is_fatal: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = CASE WHEN $3 THEN 'FAILED' ELSE 'PENDING' END,
                finished_at = CASE WHEN $3 THEN $4 ELSE finished_at END,
                error = $2
            WHERE id = $1 AND status = 'IN_PROGRESS'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::from(id))
            .bind(message)
            .bind(is_fatal)
            .bind(now);
        self.transition(id, query).await
    }

    #[instrument(name = "job_ledger.cancel", skip(self, now), err)]
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobError> {
        sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'CANCELED', finished_at = COALESCE(finished_at, $2)
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::from(id))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(JobError::NotFound(id))?
        .try_into()
    }

    #[instrument(name = "job_ledger.requeue_stuck", skip(self), fields(n_stuck_jobs), err)]
    async fn requeue_stuck(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, JobError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'PENDING', attempt_count = attempt_count + 1
            WHERE status = 'IN_PROGRESS' AND started_at < $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(started_before)
        .fetch_all(&self.pool)
        .await?;
        tracing::Span::current().record("n_stuck_jobs", rows.len());
        let mut jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn list_pending(&self) -> Result<Vec<JobId>, JobError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM jobs WHERE status = $1 ORDER BY created_at, id",
        )
        .bind(JobStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    async fn list_by_target(&self, target: &str) -> Result<Vec<Job>, JobError> {
        sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE target = $1 ORDER BY created_at, id"
        ))
        .bind(target)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Job::try_from)
        .collect()
    }
}
