//! Bounded in-process queue of job ids feeding the worker pool.

use tokio::sync::{Mutex, mpsc};

use std::sync::Arc;

use crate::{JobId, error::JobError};

/// Producer side. Cheap to clone.
#[derive(Clone, Debug)]
pub(crate) struct DispatchQueue {
    tx: mpsc::Sender<JobId>,
}

/// Consumer side, shared by every worker.
#[derive(Clone, Debug)]
pub(crate) struct QueueReceiver {
    rx: Arc<Mutex<mpsc::Receiver<JobId>>>,
}

pub(crate) fn dispatch_queue(capacity: usize) -> (DispatchQueue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        DispatchQueue { tx },
        QueueReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl DispatchQueue {
    /// Enqueue `id`, waiting for room while the queue is full. A saturated
    /// worker pool slows admission down instead of growing a backlog.
    pub async fn dispatch(&self, id: JobId) -> Result<(), JobError> {
        match self.tx.try_send(id) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(id)) => {
                tracing::debug!(job_id = %id, "dispatch queue full, waiting for capacity");
                self.tx.send(id).await.map_err(|_| JobError::QueueClosed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(JobError::QueueClosed),
        }
    }
}

impl QueueReceiver {
    /// Next id, or `None` once every producer is gone.
    pub async fn next(&self) -> Option<JobId> {
        self.rx.lock().await.recv().await
    }
}
