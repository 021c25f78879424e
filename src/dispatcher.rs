use futures::FutureExt;
use tracing::{Span, instrument};

use std::{
    collections::HashSet,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};

use super::{
    JobId,
    config::WorkerPoolConfig,
    current::CurrentJob,
    entity::{Job, JobStatus},
    error::{HandlerError, JobError},
    events::EventPublisher,
    lock::ResourceLocks,
    registry::HandlerRegistry,
    repo::JobLedger,
    runner::JobHandler,
    scheduler::RetryScheduler,
};

/// Tries for a final status write before the row is left to recovery.
const FINAL_WRITE_ATTEMPTS: u32 = 4;

/// Ids of jobs this process has marked `IN_PROGRESS` and not yet concluded.
#[derive(Clone, Debug, Default)]
pub(crate) struct InFlight {
    ids: Arc<Mutex<HashSet<JobId>>>,
}

impl InFlight {
    fn insert(&self, id: JobId) {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
    }

    fn remove(&self, id: JobId) {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }

    pub fn drain(&self) -> Vec<JobId> {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect()
    }
}

/// Executes one dequeued job id from ledger load to final status write.
/// Shared by every worker.
#[derive(Clone)]
pub(crate) struct JobDispatcher {
    ledger: Arc<dyn JobLedger>,
    registry: Arc<HandlerRegistry>,
    locks: ResourceLocks,
    scheduler: RetryScheduler,
    publisher: Arc<dyn EventPublisher>,
    config: Arc<WorkerPoolConfig>,
    in_flight: InFlight,
}

impl JobDispatcher {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        registry: Arc<HandlerRegistry>,
        locks: ResourceLocks,
        scheduler: RetryScheduler,
        publisher: Arc<dyn EventPublisher>,
        config: Arc<WorkerPoolConfig>,
    ) -> Self {
        Self {
            ledger,
            registry,
            locks,
            scheduler,
            publisher,
            config,
            in_flight: InFlight::default(),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Book `id` for another dispatch after the busy delay.
    pub fn defer(&self, id: JobId) {
        self.scheduler.schedule(id, self.config.busy_retry_delay);
    }

    #[instrument(name = "job.execute_job", skip_all,
        fields(job_id = %id, job_kind, job_target, attempt, error, error.level, error.message, conclusion, now),
    err)]
    pub async fn execute_job(&self, id: JobId) -> Result<(), JobError> {
        let span = Span::current();
        span.record("now", tracing::field::display(crate::time::now()));
        let job = match self.ledger.find_by_id(id).await {
            Ok(job) => job,
            Err(JobError::NotFound(_)) => {
                span.record("conclusion", "NotFound");
                tracing::warn!("dequeued job has no ledger row, dropping it");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        span.record("job_kind", tracing::field::display(job.kind));
        span.record("job_target", job.target.as_str());

        if job.status != JobStatus::Pending {
            span.record("conclusion", "Skipped");
            return Ok(());
        }

        let _guard = if job.has_target() {
            match self.locks.try_acquire(&job.target) {
                Some(guard) => Some(guard),
                None => {
                    span.record("conclusion", "Busy");
                    self.defer(id);
                    return Ok(());
                }
            }
        } else {
            None
        };

        let Some(job) = self.ledger.mark_started(id, crate::time::now()).await? else {
            // Canceled or claimed elsewhere between the read and the write.
            span.record("conclusion", "Skipped");
            return Ok(());
        };
        self.in_flight.insert(id);
        span.record("attempt", job.attempt_count);
        self.publisher.publish((&job).into());

        let prepared = self.prepare(&job);
        let outcome = match &prepared {
            Ok((handler, current_job)) => self.run_handler(handler, current_job.clone()).await,
            Err(e) => Err(e.clone()),
        };
        let result = match outcome {
            Ok(()) => {
                span.record("conclusion", "Complete");
                self.complete_job(&job).await
            }
            Err(e) => {
                span.record("conclusion", "Error");
                span.record("error", true);
                span.record("error.message", tracing::field::display(&e));
                let level = if job.attempt_count
                    <= self.config.retry.n_warn_attempts.unwrap_or(u32::MAX)
                {
                    tracing::Level::WARN
                } else {
                    tracing::Level::ERROR
                };
                span.record("error.level", tracing::field::display(level));
                self.fail_job(&job, e, prepared.as_ref().ok()).await
            }
        };
        self.in_flight.remove(id);
        // `_guard` is released here, after the final ledger write.
        result
    }

    fn prepare(&self, job: &Job) -> Result<(Arc<dyn JobHandler>, CurrentJob), HandlerError> {
        let handler = self
            .registry
            .handler(job.kind)
            .map_err(|e| HandlerError::permanent(e.to_string()))?;
        let payload = job
            .payload()
            .map_err(|e| HandlerError::permanent(e.to_string()))?;
        Ok((handler, CurrentJob::new(job, payload)))
    }

    async fn run_handler(
        &self,
        handler: &Arc<dyn JobHandler>,
        current_job: CurrentJob,
    ) -> Result<(), HandlerError> {
        let timeout = self.config.handler_timeout;
        let run = AssertUnwindSafe(handler.run(current_job)).catch_unwind();
        match crate::time::timeout(timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic_message(panic);
                tracing::error!(
                    target: "job.panic",
                    panic_message = %message,
                    panic_backtrace = ?std::backtrace::Backtrace::capture(),
                    "Job handler panicked during execution"
                );
                Err(HandlerError::transient(format!("handler panicked: {message}")))
            }
            Err(_) => Err(HandlerError::transient(format!(
                "handler timed out after {}s",
                timeout.as_secs_f64()
            ))),
        }
    }

    /// Lets the handler clean up after a job that will not run again. Its
    /// failures are logged and do not change the outcome.
    #[instrument(name = "job.abandon_job", skip_all, fields(job_id = %current_job.id()))]
    async fn abandon_job(&self, handler: &Arc<dyn JobHandler>, current_job: &CurrentJob) {
        let cleanup = AssertUnwindSafe(handler.abandon(current_job)).catch_unwind();
        match crate::time::timeout(self.config.handler_timeout, cleanup).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!(error = %e, "cleanup of failed job did not finish"),
            Ok(Err(panic)) => tracing::error!(
                target: "job.panic",
                panic_message = %panic_message(panic),
                "Job handler panicked during cleanup"
            ),
            Err(_) => tracing::error!("cleanup of failed job timed out"),
        }
    }

    /// Retries a final status write on database errors. If every try fails
    /// the row stays `IN_PROGRESS` until the recovery scan of the next start.
    async fn write_final<F, Fut>(&self, mut write: F) -> Result<Option<Job>, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<Job>, JobError>>,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Err(JobError::Sqlx(e)) if attempt < FINAL_WRITE_ATTEMPTS => {
                    tracing::warn!(error = %e, attempt, "final ledger write failed, retrying");
                    crate::time::sleep(self.config.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    #[instrument(name = "job.complete_job", skip(self, job), fields(job_id = %job.id))]
    async fn complete_job(&self, job: &Job) -> Result<(), JobError> {
        match self
            .write_final(|| self.ledger.mark_completed(job.id, crate::time::now()))
            .await?
        {
            Some(job) => self.publisher.publish((&job).into()),
            None => tracing::info!("job left IN_PROGRESS while running, result discarded"),
        }
        Ok(())
    }

    #[instrument(name = "job.fail_job", skip(self, job, error, prepared),
        fields(job_id = %job.id, attempt = job.attempt_count, permanent = error.is_permanent(), will_retry = tracing::field::Empty))]
    /// A fatal failure runs the handler's cleanup before the `FAILED` write,
    /// so observers of the terminal status see its effects.
    async fn fail_job(
        &self,
        job: &Job,
        error: HandlerError,
        prepared: Option<&(Arc<dyn JobHandler>, CurrentJob)>,
    ) -> Result<(), JobError> {
        let retry = &self.config.retry;
        let attempt = job.attempt_count;
        let is_fatal = error.is_permanent() || retry.is_exhausted(attempt);
        let message = error.to_string();

        let parent = Span::current();
        parent.record("will_retry", !is_fatal);
        if !is_fatal && attempt <= retry.n_warn_attempts.unwrap_or(u32::MAX) {
            tracing::warn!(error = %message, "job attempt failed, retrying");
        } else {
            tracing::error!(error = %message, fatal = is_fatal, "job attempt failed");
        }
        if is_fatal && let Some((handler, current_job)) = prepared {
            self.abandon_job(handler, current_job).await;
        }

        let Some(updated) = self
            .write_final(|| {
                self.ledger
                    .mark_failed(job.id, &message, is_fatal, crate::time::now())
            })
            .await?
        else {
            tracing::info!("job left IN_PROGRESS while running, failure discarded");
            return Ok(());
        };
        self.publisher.publish((&updated).into());

        if !is_fatal {
            self.scheduler.schedule(job.id, retry.next_delay(attempt));
        }
        Ok(())
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    }
}
