//! Delayed re-dispatch of jobs waiting out a backoff or a busy target.

use tokio::{
    sync::{broadcast, mpsc},
    time::Instant,
};

use std::{cmp::Reverse, collections::BinaryHeap, time::Duration};

use crate::{JobId, queue::DispatchQueue};

/// Handle used to book a job id for dispatch after a delay.
#[derive(Clone, Debug)]
pub(crate) struct RetryScheduler {
    tx: mpsc::UnboundedSender<(Instant, JobId)>,
}

impl RetryScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Instant, JobId)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Hand `id` back to the dispatch queue once `delay` has passed.
    pub fn schedule(&self, id: JobId, delay: Duration) {
        if self.tx.send((Instant::now() + delay, id)).is_err() {
            // The job stays PENDING in the ledger and is picked up by the next recovery scan.
            tracing::warn!(job_id = %id, "retry scheduler stopped, job left pending");
        }
    }
}

/// Owns the timer heap. A single task serves every delayed job so that a
/// waiting job never holds a worker.
pub(crate) async fn run_scheduler(
    mut rx: mpsc::UnboundedReceiver<(Instant, JobId)>,
    queue: DispatchQueue,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut due: BinaryHeap<Reverse<(Instant, JobId)>> = BinaryHeap::new();

    loop {
        let next_wake = due.peek().map(|Reverse((at, _))| *at);
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => break,
            entry = rx.recv() => match entry {
                Some(entry) => due.push(Reverse(entry)),
                None => break,
            },
            _ = tokio::time::sleep_until(next_wake.unwrap_or_else(Instant::now)), if next_wake.is_some() => {
                let now = Instant::now();
                while let Some(Reverse((at, id))) = due.peek().copied() {
                    if at > now {
                        break;
                    }
                    due.pop();
                    if queue.dispatch(id).await.is_err() {
                        tracing::warn!(job_id = %id, "dispatch queue closed, dropping scheduled job");
                    }
                }
            }
        }
    }

    if !due.is_empty() {
        tracing::info!(n_jobs = due.len(), "scheduler stopped with delayed jobs pending");
    }
}
