use async_trait::async_trait;
use tracing::instrument;

use std::sync::Arc;

use super::{require_target, unexpected_payload};
use crate::{
    current::CurrentJob, error::HandlerError, payload::JobPayload, provider::InstanceProvider,
    runner::JobHandler,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotOp {
    Create,
    Restore,
    Delete,
}

/// Create, restore or delete a named snapshot of the target instance.
pub struct SnapshotHandler {
    provider: Arc<dyn InstanceProvider>,
    op: SnapshotOp,
}

impl SnapshotHandler {
    pub fn new(provider: Arc<dyn InstanceProvider>, op: SnapshotOp) -> Self {
        Self { provider, op }
    }
}

#[async_trait]
impl JobHandler for SnapshotHandler {
    #[instrument(name = "handler.snapshot", skip_all, fields(op, instance, snapshot))]
    async fn run(&self, current_job: CurrentJob) -> Result<(), HandlerError> {
        let payload = match (self.op, current_job.payload()) {
            (SnapshotOp::Create, JobPayload::CreateSnapshot(p))
            | (SnapshotOp::Restore, JobPayload::RestoreSnapshot(p))
            | (SnapshotOp::Delete, JobPayload::DeleteSnapshot(p)) => p,
            _ => return Err(unexpected_payload(&current_job)),
        };
        let name = require_target(&current_job)?;
        let span = tracing::Span::current();
        span.record("op", tracing::field::debug(self.op));
        span.record("instance", name);
        span.record("snapshot", payload.snapshot_name.as_str());

        match self.op {
            SnapshotOp::Create => {
                self.provider
                    .create_snapshot(name, &payload.snapshot_name, payload.stateful)
                    .await?
            }
            SnapshotOp::Restore => {
                self.provider
                    .restore_snapshot(name, &payload.snapshot_name, payload.stateful)
                    .await?
            }
            SnapshotOp::Delete => {
                self.provider
                    .delete_snapshot(name, &payload.snapshot_name)
                    .await?
            }
        }
        Ok(())
    }
}
