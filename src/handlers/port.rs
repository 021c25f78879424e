use async_trait::async_trait;
use tracing::instrument;

use std::sync::Arc;

use super::{require_target, unexpected_payload};
use crate::{
    current::CurrentJob,
    error::{HandlerError, ProviderError},
    payload::JobPayload,
    provider::InstanceProvider,
    runner::JobHandler,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortOp {
    Add,
    Remove,
}

pub struct PortMappingHandler {
    provider: Arc<dyn InstanceProvider>,
    op: PortOp,
}

impl PortMappingHandler {
    pub fn new(provider: Arc<dyn InstanceProvider>, op: PortOp) -> Self {
        Self { provider, op }
    }
}

#[async_trait]
impl JobHandler for PortMappingHandler {
    #[instrument(name = "handler.port_mapping", skip_all, fields(op, instance, host_port))]
    async fn run(&self, current_job: CurrentJob) -> Result<(), HandlerError> {
        let mapping = match (self.op, current_job.payload()) {
            (PortOp::Add, JobPayload::AddPort(m)) | (PortOp::Remove, JobPayload::RemovePort(m)) => m,
            _ => return Err(unexpected_payload(&current_job)),
        };
        let name = require_target(&current_job)?;
        let span = tracing::Span::current();
        span.record("op", tracing::field::debug(self.op));
        span.record("instance", name);
        span.record("host_port", mapping.host_port);

        let result = match self.op {
            PortOp::Add => self.provider.add_port_mapping(name, mapping).await,
            PortOp::Remove => self.provider.remove_port_mapping(name, mapping).await,
        };
        match result {
            // A retry after a partially applied attempt finds the mapping already in place.
            Err(ProviderError::Conflict(_)) if self.op == PortOp::Add && current_job.is_retry() => {
                Ok(())
            }
            Err(ProviderError::Conflict(reason)) if self.op == PortOp::Add => {
                Err(HandlerError::permanent(format!(
                    "host port {} is already mapped: {reason}",
                    mapping.host_port
                )))
            }
            other => Ok(other?),
        }
    }
}
