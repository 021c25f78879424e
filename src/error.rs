//! Error types surfaced by the engine, its ledgers and its handlers.

use thiserror::Error;

use crate::{
    JobId,
    entity::{JobKind, JobStatus},
};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("JobError - Sqlx: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JobError - Migrate: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("JobError - Config: {0}")]
    Config(String),
    #[error("JobError - NotFound: {0}")]
    NotFound(JobId),
    #[error("JobError - ResourceBusy: '{0}' has an operation in flight, retry later")]
    ResourceBusy(String),
    #[error("JobError - InvalidPayload: {0}")]
    InvalidPayload(String),
    #[error("JobError - CouldNotSerializePayload: {0}")]
    CouldNotSerializePayload(#[source] serde_json::Error),
    #[error("JobError - CouldNotDeserializePayload: {0}")]
    CouldNotDeserializePayload(#[source] serde_json::Error),
    #[error("JobError - UnknownJobKind: {0}")]
    UnknownJobKind(String),
    #[error("JobError - UnknownJobStatus: {0}")]
    UnknownJobStatus(String),
    #[error("JobError - NoHandlerRegistered: {0}")]
    NoHandlerRegistered(JobKind),
    #[error("JobError - InvalidTransition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("JobError - QueueClosed")]
    QueueClosed,
    #[error("JobError - AlreadyStarted")]
    AlreadyStarted,
    #[error("JobError - NotStarted")]
    NotStarted,
}

/// Failure reported by the infrastructure provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("instance '{0}' not found")]
    NotFound(String),
    #[error("image '{0}' not found locally")]
    ImageNotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("provider timed out: {0}")]
    Timeout(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Whether repeating the call can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::ImageNotFound(_) | Self::InvalidRequest(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum IpamError {
    #[error("no IP addresses available")]
    NoAddressAvailable,
    #[error("invalid network definition '{network}': {reason}")]
    InvalidNetwork { network: String, reason: String },
    #[error("lease contention, retry allocation")]
    Contention,
    #[error("IpamError - Sqlx: {0}")]
    Sqlx(sqlx::Error),
}

impl From<sqlx::Error> for IpamError {
    fn from(error: sqlx::Error) -> Self {
        // 40001: serialization_failure, 23505: unique_violation
        if let sqlx::Error::Database(db_error) = &error
            && matches!(db_error.code().as_deref(), Some("40001" | "23505"))
        {
            return Self::Contention;
        }
        Self::Sqlx(error)
    }
}

impl IpamError {
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::NoAddressAvailable | Self::InvalidNetwork { .. }
        )
    }
}

/// Outcome of a failed handler run. The worker loop is the only place that
/// turns this into a retry or a terminal failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Eligible for retry while the attempt budget lasts.
    #[error("{0}")]
    Transient(String),
    /// Fails the job immediately, bypassing the retry budget.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<ProviderError> for HandlerError {
    fn from(error: ProviderError) -> Self {
        if error.is_permanent() {
            Self::Permanent(error.to_string())
        } else {
            Self::Transient(error.to_string())
        }
    }
}

impl From<IpamError> for HandlerError {
    fn from(error: IpamError) -> Self {
        if error.is_permanent() {
            Self::Permanent(error.to_string())
        } else {
            Self::Transient(error.to_string())
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::Permanent(format!("invalid payload: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_are_classified() {
        assert!(HandlerError::from(ProviderError::ImageNotFound("alpine".into())).is_permanent());
        assert!(!HandlerError::from(ProviderError::Timeout("start".into())).is_permanent());
        assert!(!HandlerError::from(ProviderError::Conflict("busy".into())).is_permanent());
    }

    #[test]
    fn exhausted_pool_is_permanent() {
        let error = HandlerError::from(IpamError::NoAddressAvailable);
        assert_eq!(
            error,
            HandlerError::Permanent("no IP addresses available".to_string())
        );
        assert!(!HandlerError::from(IpamError::Contention).is_permanent());
    }
}
