//! Execution-time context handed to running handlers.

use chrono::{DateTime, Utc};

use crate::{
    JobId,
    entity::{Job, JobKind},
    payload::JobPayload,
};

/// Context provided to a [`JobHandler`](crate::JobHandler) while a job is executing.
#[derive(Debug, Clone)]
pub struct CurrentJob {
    id: JobId,
    attempt: u32,
    kind: JobKind,
    target: String,
    payload: JobPayload,
    requested_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl CurrentJob {
    pub(crate) fn new(job: &Job, payload: JobPayload) -> Self {
        Self {
            id: job.id,
            attempt: job.attempt_count,
            kind: job.kind,
            target: job.target.clone(),
            payload,
            requested_by: job.requested_by.clone(),
            created_at: job.created_at,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Attempt number of this execution, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// `true` when an earlier attempt may have partially applied.
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    pub fn into_payload(self) -> JobPayload {
        self.payload
    }

    pub fn requested_by(&self) -> Option<&str> {
        self.requested_by.as_deref()
    }

    /// When the job was admitted. Anything older predates every attempt.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
