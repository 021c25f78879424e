use async_trait::async_trait;
use chrono::{DateTime, Utc};

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use super::JobLedger;
use crate::{
    JobId,
    entity::{Job, JobStatus, NewJob},
    error::JobError,
};

/// Process-local ledger. Jobs do not survive a restart; use it for tests and
/// embedders that bring their own durability.
#[derive(Default, Debug)]
pub struct MemoryJobLedger {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        apply: impl FnOnce(&mut Job),
    ) -> Result<Option<Job>, JobError> {
        let mut rows = self.rows();
        let job = rows.get_mut(&id).ok_or(JobError::NotFound(id))?;
        if job.status != expected {
            return Ok(None);
        }
        let mut next = job.clone();
        apply(&mut next);
        if !expected.can_transition_to(next.status) {
            return Err(JobError::InvalidTransition {
                from: expected,
                to: next.status,
            });
        }
        *job = next.clone();
        Ok(Some(next))
    }
}

#[async_trait]
impl JobLedger for MemoryJobLedger {
    async fn create(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Job, JobError> {
        let job = Job::from_new(new_job, now);
        self.rows().insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: JobId) -> Result<Job, JobError> {
        self.rows().get(&id).cloned().ok_or(JobError::NotFound(id))
    }

    async fn mark_started(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobError> {
        self.transition(id, JobStatus::Pending, |job| {
            job.status = JobStatus::InProgress;
            job.started_at = Some(now);
            job.attempt_count += 1;
        })
    }

    async fn mark_completed(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobError> {
        self.transition(id, JobStatus::InProgress, |job| {
            job.status = JobStatus::Completed;
            job.finished_at = Some(now);
            job.error = None;
        })
    }

    async fn mark_failed(
        &self,
        id: JobId,
        message: &str,
        is_fatal: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobError> {
        self.transition(id, JobStatus::InProgress, |job| {
            job.error = Some(message.to_string());
            if is_fatal {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
            } else {
                job.status = JobStatus::Pending;
            }
        })
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobError> {
        let mut rows = self.rows();
        let job = rows.get_mut(&id).ok_or(JobError::NotFound(id))?;
        if job.status != JobStatus::Canceled {
            job.status = JobStatus::Canceled;
            job.finished_at.get_or_insert(now);
        }
        Ok(job.clone())
    }

    async fn requeue_stuck(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, JobError> {
        let mut rows = self.rows();
        let mut requeued: Vec<Job> = rows
            .values_mut()
            .filter(|job| {
                job.status == JobStatus::InProgress
                    && job.started_at.is_some_and(|at| at < started_before)
            })
            .map(|job| {
                job.status = JobStatus::Pending;
                job.attempt_count += 1;
                job.clone()
            })
            .collect();
        requeued.sort_by_key(|job| (job.created_at, job.id));
        Ok(requeued)
    }

    async fn list_pending(&self) -> Result<Vec<JobId>, JobError> {
        let rows = self.rows();
        let mut pending: Vec<&Job> = rows
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|job| (job.created_at, job.id));
        Ok(pending.into_iter().map(|job| job.id).collect())
    }

    async fn list_by_target(&self, target: &str) -> Result<Vec<Job>, JobError> {
        let rows = self.rows();
        let mut jobs: Vec<Job> = rows
            .values()
            .filter(|job| job.target == target)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{JobPayload, StateAction, StateChangePayload};

    fn stop_job(target: &str) -> NewJob {
        NewJob::new(
            target,
            JobPayload::StateChange(StateChangePayload {
                action: StateAction::Stop,
                force: false,
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn attempt_count_tracks_executions() -> anyhow::Result<()> {
        let ledger = MemoryJobLedger::new();
        let now = Utc::now();
        let job = ledger.create(stop_job("web-01"), now).await?;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);

        for attempt in 1..=3 {
            let started = ledger.mark_started(job.id, now).await?.unwrap();
            assert_eq!(started.attempt_count, attempt);
            assert_eq!(started.status, JobStatus::InProgress);
            let failed = ledger
                .mark_failed(job.id, "provider timed out", false, now)
                .await?
                .unwrap();
            assert_eq!(failed.status, JobStatus::Pending);
            assert_eq!(failed.finished_at, None);
            assert_eq!(failed.error.as_deref(), Some("provider timed out"));
        }
        Ok(())
    }

    #[tokio::test]
    async fn double_start_is_rejected() -> anyhow::Result<()> {
        let ledger = MemoryJobLedger::new();
        let job = ledger.create(stop_job("web-01"), Utc::now()).await?;
        assert!(ledger.mark_started(job.id, Utc::now()).await?.is_some());
        assert!(ledger.mark_started(job.id, Utc::now()).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn completion_clears_error() -> anyhow::Result<()> {
        let ledger = MemoryJobLedger::new();
        let job = ledger.create(stop_job("web-01"), Utc::now()).await?;
        ledger.mark_started(job.id, Utc::now()).await?;
        ledger
            .mark_failed(job.id, "blip", false, Utc::now())
            .await?;
        ledger.mark_started(job.id, Utc::now()).await?;
        let done = ledger.mark_completed(job.id, Utc::now()).await?.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.error, None);
        assert!(done.finished_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn canceled_job_is_not_overwritten_by_worker() -> anyhow::Result<()> {
        let ledger = MemoryJobLedger::new();
        let job = ledger.create(stop_job("web-01"), Utc::now()).await?;
        ledger.mark_started(job.id, Utc::now()).await?;
        ledger.cancel(job.id, Utc::now()).await?;
        assert!(ledger.mark_completed(job.id, Utc::now()).await?.is_none());
        assert_eq!(
            ledger.find_by_id(job.id).await?.status,
            JobStatus::Canceled
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_rows_are_reported() {
        let ledger = MemoryJobLedger::new();
        let id = JobId::new();
        assert!(matches!(
            ledger.mark_started(id, Utc::now()).await,
            Err(JobError::NotFound(missing)) if missing == id
        ));
    }
}
