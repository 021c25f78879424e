use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::instrument;

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use super::{
    JobId,
    config::WorkerPoolConfig,
    dispatcher::{InFlight, JobDispatcher},
    error::JobError,
    events::EventPublisher,
    handle::OwnedTaskHandle,
    queue::{DispatchQueue, QueueReceiver},
    repo::JobLedger,
    scheduler::run_scheduler,
};

const SHUTDOWN_ERROR: &str = "aborted by shutdown";

/// Fixed set of worker loops draining the dispatch queue, plus the task
/// that serves delayed re-dispatch.
pub(crate) struct WorkerPool {
    config: Arc<WorkerPoolConfig>,
    dispatcher: JobDispatcher,
    receiver: QueueReceiver,
    queue: DispatchQueue,
    scheduler_rx: tokio::sync::mpsc::UnboundedReceiver<(tokio::time::Instant, JobId)>,
    shutdown_tx: broadcast::Sender<()>,
}

pub(crate) struct WorkerPoolHandle {
    workers: tokio::sync::Mutex<Vec<OwnedTaskHandle>>,
    scheduler: tokio::sync::Mutex<Option<OwnedTaskHandle>>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_called: Arc<AtomicBool>,
    in_flight: InFlight,
    ledger: Arc<dyn JobLedger>,
    publisher: Arc<dyn EventPublisher>,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        config: Arc<WorkerPoolConfig>,
        dispatcher: JobDispatcher,
        queue: DispatchQueue,
        receiver: QueueReceiver,
        scheduler_rx: tokio::sync::mpsc::UnboundedReceiver<(tokio::time::Instant, JobId)>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        Self {
            config,
            dispatcher,
            receiver,
            queue,
            scheduler_rx,
            shutdown_tx,
        }
    }

    pub fn start(
        self,
        ledger: Arc<dyn JobLedger>,
        publisher: Arc<dyn EventPublisher>,
    ) -> WorkerPoolHandle {
        let scheduler = OwnedTaskHandle::new(
            "job.scheduler",
            tokio::spawn(run_scheduler(
                self.scheduler_rx,
                self.queue.clone(),
                self.shutdown_tx.subscribe(),
            )),
        );
        let workers = (0..self.config.workers)
            .map(|n| {
                OwnedTaskHandle::new(
                    format!("job.worker-{n}"),
                    tokio::spawn(worker_loop(
                        n,
                        self.receiver.clone(),
                        self.dispatcher.clone(),
                        self.shutdown_tx.subscribe(),
                    )),
                )
            })
            .collect();
        tracing::info!(workers = self.config.workers, "worker pool started");

        WorkerPoolHandle {
            workers: tokio::sync::Mutex::new(workers),
            scheduler: tokio::sync::Mutex::new(Some(scheduler)),
            shutdown_tx: self.shutdown_tx,
            shutdown_called: Arc::new(AtomicBool::new(false)),
            in_flight: self.dispatcher.in_flight().clone(),
            ledger,
            publisher,
            shutdown_timeout: self.config.shutdown_timeout,
        }
    }
}

/// A worker never exits on a job error: every failure is logged and the
/// loop moves on to the next id.
async fn worker_loop(
    worker: usize,
    receiver: QueueReceiver,
    dispatcher: JobDispatcher,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let id = tokio::select! {
            biased;

            _ = shutdown_rx.recv() => break,
            next = receiver.next() => match next {
                Some(id) => id,
                None => break,
            },
        };

        match AssertUnwindSafe(dispatcher.execute_job(id))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(worker, job_id = %id, error = %e, "job execution error");
                dispatcher.defer(id);
            }
            Err(_) => {
                tracing::error!(target: "job.panic", worker, job_id = %id, "worker recovered from a panic");
                dispatcher.defer(id);
            }
        }
    }
    tracing::debug!(worker, "worker stopped");
}

impl WorkerPoolHandle {
    /// Stop accepting work, give running jobs `shutdown_timeout` to finish and
    /// return whatever is still running to `PENDING`.
    ///
    /// Idempotent.
    #[instrument(name = "job.pool_shutdown", skip(self), fields(n_jobs), err)]
    pub async fn shutdown(&self) -> Result<(), JobError> {
        if self
            .shutdown_called
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(());

        let workers = std::mem::take(&mut *self.workers.lock().await);
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        for worker in workers {
            let grace = deadline.saturating_duration_since(tokio::time::Instant::now());
            worker.join_or_abort(grace).await;
        }
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.join_or_abort(Duration::from_millis(100)).await;
        }

        let interrupted = self.in_flight.drain();
        tracing::Span::current().record("n_jobs", interrupted.len());
        let now = crate::time::now();
        for id in interrupted {
            if let Some(job) = self.ledger.mark_failed(id, SHUTDOWN_ERROR, false, now).await? {
                self.publisher.publish((&job).into());
            }
        }
        Ok(())
    }
}

impl Drop for WorkerPoolHandle {
    fn drop(&mut self) {
        if !self.shutdown_called.load(Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
        }
    }
}
