//! The job ledger: durable record of every job and its current status.

mod memory;
mod pg;

pub use memory::MemoryJobLedger;
pub use pg::PgJobLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    JobId,
    entity::{Job, NewJob},
    error::JobError,
};

/// Storage seam for job rows.
///
/// Every status write is a single-row compare-and-set on the current status.
/// Writes return `Ok(None)` when the row exists but is no longer in the
/// expected state (for example it was canceled meanwhile) and
/// `Err(JobError::NotFound)` when the row is gone.
#[async_trait]
pub trait JobLedger: Send + Sync + 'static {
    /// Persist a new row with `PENDING` status and no attempts.
    async fn create(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Job, JobError>;

    async fn find_by_id(&self, id: JobId) -> Result<Job, JobError>;

    /// `PENDING -> IN_PROGRESS`: stamps `started_at` and increments `attempt_count`.
    async fn mark_started(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobError>;

    /// `IN_PROGRESS -> COMPLETED`: stamps `finished_at` and clears `error`.
    async fn mark_completed(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobError>;

    /// `IN_PROGRESS -> FAILED` when `is_fatal` (stamping `finished_at`),
    /// otherwise `IN_PROGRESS -> PENDING`. Records `message` either way.
    async fn mark_failed(
        &self,
        id: JobId,
        message: &str,
        is_fatal: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobError>;

    /// Operator cancellation, accepted from any state.
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobError>;

    /// Reset every `IN_PROGRESS` job started before `started_before` to
    /// `PENDING`, incrementing `attempt_count` once more.
    async fn requeue_stuck(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, JobError>;

    /// Ids of every `PENDING` job, oldest first.
    async fn list_pending(&self) -> Result<Vec<JobId>, JobError>;

    /// Jobs for `target`, oldest first.
    async fn list_by_target(&self, target: &str) -> Result<Vec<Job>, JobError>;
}
