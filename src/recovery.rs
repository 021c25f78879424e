//! Startup scan that puts jobs stranded by a crash back into circulation.

use chrono::{DateTime, Utc};
use tracing::{Span, instrument};

use std::time::Duration;

use crate::{
    JobId, error::JobError, events::EventPublisher, repo::JobLedger, scheduler::RetryScheduler,
};

/// What the startup scan found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs that were `IN_PROGRESS` past the threshold and are `PENDING` again.
    pub requeued: Vec<JobId>,
    /// Every `PENDING` job handed to the dispatch queue.
    pub dispatched: usize,
}

/// Requeue every job that has been `IN_PROGRESS` since before `now - threshold`.
///
/// Each requeued job has its attempt counter advanced. A crash mid-run
/// counts as a failed attempt.
#[instrument(name = "job.requeue_stuck_jobs", skip(ledger, publisher), fields(n_jobs), err)]
pub(crate) async fn requeue_stuck_jobs(
    ledger: &dyn JobLedger,
    publisher: &dyn EventPublisher,
    threshold: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<JobId>, JobError> {
    let started_before = now - crate::time::to_chrono(threshold);
    let jobs = ledger.requeue_stuck(started_before).await?;
    Span::current().record("n_jobs", jobs.len());
    for job in &jobs {
        tracing::warn!(
            job_id = %job.id,
            job_kind = %job.kind,
            attempt = job.attempt_count,
            "requeued job stuck in progress"
        );
        publisher.publish(job.into());
    }
    Ok(jobs.into_iter().map(|job| job.id).collect())
}

/// Hand every `PENDING` job to the dispatch path.
#[instrument(name = "job.dispatch_pending_jobs", skip_all, fields(n_jobs), err)]
pub(crate) async fn dispatch_pending_jobs(
    ledger: &dyn JobLedger,
    scheduler: &RetryScheduler,
) -> Result<usize, JobError> {
    let pending = ledger.list_pending().await?;
    Span::current().record("n_jobs", pending.len());
    for id in &pending {
        scheduler.schedule(*id, Duration::ZERO);
    }
    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        NewJob,
        entity::JobStatus,
        events::BroadcastPublisher,
        payload::{JobPayload, StateAction, StateChangePayload},
        repo::MemoryJobLedger,
    };

    fn stop(target: &str) -> NewJob {
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
    async fn only_jobs_past_threshold_are_requeued() -> anyhow::Result<()> {
        let ledger = MemoryJobLedger::new();
        let publisher = BroadcastPublisher::new(16);
        let mut events = publisher.subscribe();
        let now = crate::time::now();

        let old = ledger.create(stop("old"), now).await?;
        ledger
            .mark_started(old.id, now - chrono::Duration::minutes(10))
            .await?;
        let fresh = ledger.create(stop("fresh"), now).await?;
        ledger.mark_started(fresh.id, now).await?;

        let requeued =
            requeue_stuck_jobs(&ledger, &publisher, Duration::from_secs(300), now).await?;
        assert_eq!(requeued, vec![old.id]);

        let old = ledger.find_by_id(old.id).await?;
        assert_eq!(old.status, JobStatus::Pending);
        assert_eq!(old.attempt_count, 2);

        let fresh = ledger.find_by_id(fresh.id).await?;
        assert_eq!(fresh.status, JobStatus::InProgress);
        assert_eq!(fresh.attempt_count, 1);

        let event = events.try_recv()?;
        assert_eq!(event.job_id, old.id);
        assert_eq!(event.status, JobStatus::Pending);
        Ok(())
    }
}
