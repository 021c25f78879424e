//! Job rows as persisted in the ledger and their lifecycle states.

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::str::FromStr;

use crate::{error::JobError, payload::JobPayload};

#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
/// Opaque identifier assigned to a job at creation.
pub struct JobId(Uuid);

impl JobId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Every kind of deferred operation the engine knows how to run.
#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    StateChange,
    UpdateLimits,
    CreateInstance,
    DeleteInstance,
    CreateSnapshot,
    RestoreSnapshot,
    DeleteSnapshot,
    AddPort,
    RemovePort,
}

impl JobKind {
    pub const ALL: [JobKind; 9] = [
        JobKind::StateChange,
        JobKind::UpdateLimits,
        JobKind::CreateInstance,
        JobKind::DeleteInstance,
        JobKind::CreateSnapshot,
        JobKind::RestoreSnapshot,
        JobKind::DeleteSnapshot,
        JobKind::AddPort,
        JobKind::RemovePort,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StateChange => "state_change",
            Self::UpdateLimits => "update_limits",
            Self::CreateInstance => "create_instance",
            Self::DeleteInstance => "delete_instance",
            Self::CreateSnapshot => "create_snapshot",
            Self::RestoreSnapshot => "restore_snapshot",
            Self::DeleteSnapshot => "delete_snapshot",
            Self::AddPort => "add_port",
            Self::RemovePort => "remove_port",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| JobError::UnknownJobKind(s.to_string()))
    }
}

#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Legal edges of the job lifecycle. Cancellation is accepted from any
    /// state because it is operator-initiated.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Pending)
                | (Self::InProgress, Self::Failed)
                | (_, Self::Canceled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(JobError::UnknownJobStatus(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// Snapshot of a job row.
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Instance the job acts on. Empty for target-less jobs.
    pub target: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub requested_by: Option<String>,
}

impl Job {
    /// Decode the stored payload into its typed form.
    pub fn payload(&self) -> Result<JobPayload, JobError> {
        JobPayload::from_parts(self.kind, self.payload.clone())
    }

    pub fn has_target(&self) -> bool {
        !self.target.is_empty()
    }

    pub(crate) fn from_new(new_job: NewJob, created_at: DateTime<Utc>) -> Self {
        Self {
            id: new_job.id,
            kind: new_job.kind,
            target: new_job.target,
            payload: new_job.payload,
            status: JobStatus::Pending,
            error: None,
            created_at,
            started_at: None,
            finished_at: None,
            attempt_count: 0,
            requested_by: new_job.requested_by,
        }
    }
}

#[derive(Debug, Clone, Builder)]
#[builder(build_fn(validate = "Self::validate"))]
/// A job about to be admitted. Build with [`NewJob::builder`] or [`NewJob::new`].
///
/// Every job names the instance it acts on. For a create the target is the
/// new instance's name and defaults to it.
pub struct NewJob {
    #[builder(setter(into), default = "JobId::new()")]
    pub(crate) id: JobId,
    #[builder(setter(into), default)]
    pub(crate) target: String,
    #[builder(setter(custom))]
    pub(crate) kind: JobKind,
    #[builder(setter(custom))]
    pub(crate) payload: serde_json::Value,
    #[builder(setter(into, strip_option), default)]
    pub(crate) requested_by: Option<String>,
}

impl NewJob {
    pub fn builder() -> NewJobBuilder {
        NewJobBuilder::default()
    }

    /// Validate and serialize `payload` for `target`.
    pub fn new(target: impl Into<String>, payload: JobPayload) -> Result<Self, JobError> {
        NewJob::builder()
            .target(target)
            .payload(payload)?
            .build()
            .map_err(|e| JobError::InvalidPayload(e.to_string()))
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl NewJobBuilder {
    /// Set the typed payload; the job kind follows from its variant.
    pub fn payload(&mut self, payload: JobPayload) -> Result<&mut Self, JobError> {
        payload.validate()?;
        if let JobPayload::CreateInstance(create) = &payload
            && self.target.as_deref().is_none_or(str::is_empty)
        {
            self.target = Some(create.name.clone());
        }
        let (kind, value) = payload.into_parts()?;
        self.kind = Some(kind);
        self.payload = Some(value);
        Ok(self)
    }

    // The target is the lock key, so it must be the instance the provider mutates.
    fn validate(&self) -> Result<(), String> {
        let target = self.target.as_deref().unwrap_or_default();
        match (self.kind, &self.payload) {
            (Some(JobKind::CreateInstance), Some(payload)) => {
                let name = payload
                    .get("name")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                if target != name {
                    return Err(format!(
                        "target '{target}' does not match instance name '{name}'"
                    ));
                }
            }
            (Some(kind), _) if target.is_empty() => {
                return Err(format!("{kind} job needs a target instance"));
            }
            _ => {}
        }
        Ok(())
    }
}
