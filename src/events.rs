//! Status-change notifications for live consumers such as a UI stream.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use std::sync::Arc;

use crate::{
    JobId,
    entity::{Job, JobKind, JobStatus},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatusEvent {
    pub job_id: JobId,
    pub kind: JobKind,
    pub target: String,
    pub status: JobStatus,
    pub attempt: u32,
    pub error: Option<String>,
    pub payload: serde_json::Value,
}

impl From<&Job> for JobStatusEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            target: job.target.clone(),
            status: job.status,
            attempt: job.attempt_count,
            error: job.error.clone(),
            payload: job.payload.clone(),
        }
    }
}

/// Receives a notification every time a job changes status.
///
/// Implementations must not block: the worker loop calls this inline.
pub trait EventPublisher: Send + Sync + 'static {
    fn publish(&self, event: JobStatusEvent);
}

/// Fan-out over a bounded broadcast channel. Subscribers that fall behind
/// lose the oldest events rather than slowing the engine down.
#[derive(Clone, Debug)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<JobStatusEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobStatusEvent> {
        self.tx.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: JobStatusEvent) {
        // An error only means nobody is listening.
        let _ = self.tx.send(event);
    }
}

/// Forwards each event to every registered publisher in order.
#[derive(Clone, Default)]
pub(crate) struct PublisherSet {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl PublisherSet {
    pub fn push(&mut self, publisher: Arc<dyn EventPublisher>) {
        self.publishers.push(publisher);
    }
}

impl EventPublisher for PublisherSet {
    fn publish(&self, event: JobStatusEvent) {
        if let Some((last, rest)) = self.publishers.split_last() {
            for publisher in rest {
                publisher.publish(event.clone());
            }
            last.publish(event);
        }
    }
}

/// Publisher that drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: JobStatusEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: JobStatus) -> JobStatusEvent {
        JobStatusEvent {
            job_id: JobId::new(),
            kind: JobKind::StateChange,
            target: "web-01".to_string(),
            status,
            attempt: 1,
            error: None,
            payload: serde_json::json!({"action": "stop"}),
        }
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        BroadcastPublisher::new(4).publish(event(JobStatus::Pending));
    }

    #[tokio::test]
    async fn slow_subscribers_lag_instead_of_blocking() {
        let publisher = BroadcastPublisher::new(2);
        let mut rx = publisher.subscribe();
        for _ in 0..5 {
            publisher.publish(event(JobStatus::InProgress));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().status, JobStatus::InProgress);
    }
}
