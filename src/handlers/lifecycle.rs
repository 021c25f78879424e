use async_trait::async_trait;
use tracing::instrument;

use std::sync::Arc;

use super::{require_target, unexpected_payload};
use crate::{
    current::CurrentJob, error::HandlerError, payload::JobPayload, provider::InstanceProvider,
    runner::JobHandler,
};

pub struct StateChangeHandler {
    provider: Arc<dyn InstanceProvider>,
}

impl StateChangeHandler {
    pub fn new(provider: Arc<dyn InstanceProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl JobHandler for StateChangeHandler {
    #[instrument(name = "handler.state_change", skip_all, fields(instance, action))]
    async fn run(&self, current_job: CurrentJob) -> Result<(), HandlerError> {
        let JobPayload::StateChange(payload) = current_job.payload() else {
            return Err(unexpected_payload(&current_job));
        };
        let name = require_target(&current_job)?;
        let span = tracing::Span::current();
        span.record("instance", name);
        span.record("action", tracing::field::display(payload.action));
        self.provider
            .change_state(name, payload.action, payload.force)
            .await?;
        Ok(())
    }
}

pub struct UpdateLimitsHandler {
    provider: Arc<dyn InstanceProvider>,
}

impl UpdateLimitsHandler {
    pub fn new(provider: Arc<dyn InstanceProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl JobHandler for UpdateLimitsHandler {
    #[instrument(name = "handler.update_limits", skip_all, fields(instance))]
    async fn run(&self, current_job: CurrentJob) -> Result<(), HandlerError> {
        let JobPayload::UpdateLimits(limits) = current_job.payload() else {
            return Err(unexpected_payload(&current_job));
        };
        let name = require_target(&current_job)?;
        tracing::Span::current().record("instance", name);
        self.provider.update_limits(name, limits).await?;
        Ok(())
    }
}
