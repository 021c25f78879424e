//! Built-in handlers, one per [`JobKind`].

mod instance;
mod lifecycle;
mod port;
mod snapshot;

pub use instance::{CreateInstanceHandler, DeleteInstanceHandler};
pub use lifecycle::{StateChangeHandler, UpdateLimitsHandler};
pub use port::{PortMappingHandler, PortOp};
pub use snapshot::{SnapshotHandler, SnapshotOp};

use std::sync::Arc;

use crate::{
    current::CurrentJob, entity::JobKind, error::HandlerError, ipam::IpAllocator,
    provider::InstanceProvider, runner::JobHandler,
};

/// Handler for `kind` backed by `provider`. Exhaustive over [`JobKind`], so
/// adding a kind without a handler does not compile.
pub fn handler_for(
    kind: JobKind,
    provider: &Arc<dyn InstanceProvider>,
    allocator: &IpAllocator,
) -> Arc<dyn JobHandler> {
    let provider = Arc::clone(provider);
    match kind {
        JobKind::StateChange => Arc::new(StateChangeHandler::new(provider)),
        JobKind::UpdateLimits => Arc::new(UpdateLimitsHandler::new(provider)),
        JobKind::CreateInstance => {
            Arc::new(CreateInstanceHandler::new(provider, allocator.clone()))
        }
        JobKind::DeleteInstance => {
            Arc::new(DeleteInstanceHandler::new(provider, allocator.clone()))
        }
        JobKind::CreateSnapshot => Arc::new(SnapshotHandler::new(provider, SnapshotOp::Create)),
        JobKind::RestoreSnapshot => {
            Arc::new(SnapshotHandler::new(provider, SnapshotOp::Restore))
        }
        JobKind::DeleteSnapshot => Arc::new(SnapshotHandler::new(provider, SnapshotOp::Delete)),
        JobKind::AddPort => Arc::new(PortMappingHandler::new(provider, PortOp::Add)),
        JobKind::RemovePort => Arc::new(PortMappingHandler::new(provider, PortOp::Remove)),
    }
}

fn require_target(current_job: &CurrentJob) -> Result<&str, HandlerError> {
    match current_job.target() {
        "" => Err(HandlerError::permanent(format!(
            "{} job has no target instance",
            current_job.kind()
        ))),
        target => Ok(target),
    }
}

fn unexpected_payload(current_job: &CurrentJob) -> HandlerError {
    HandlerError::permanent(format!(
        "payload does not match job kind {}",
        current_job.kind()
    ))
}
