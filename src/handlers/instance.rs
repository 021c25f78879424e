use async_trait::async_trait;
use tracing::instrument;

use std::sync::Arc;

use super::unexpected_payload;
use crate::{
    current::CurrentJob,
    error::{HandlerError, ProviderError},
    ipam::IpAllocator,
    payload::JobPayload,
    provider::{InstanceProvider, InstanceSpec},
    runner::JobHandler,
};

/// Leases an address (for network-attached instances) and creates the instance.
pub struct CreateInstanceHandler {
    provider: Arc<dyn InstanceProvider>,
    allocator: IpAllocator,
}

impl CreateInstanceHandler {
    pub fn new(provider: Arc<dyn InstanceProvider>, allocator: IpAllocator) -> Self {
        Self {
            provider,
            allocator,
        }
    }
}

#[async_trait]
impl JobHandler for CreateInstanceHandler {
    #[instrument(name = "handler.create_instance", skip_all, fields(instance, image, ip))]
    async fn run(&self, current_job: CurrentJob) -> Result<(), HandlerError> {
        let JobPayload::CreateInstance(payload) = current_job.payload() else {
            return Err(unexpected_payload(&current_job));
        };
        let span = tracing::Span::current();
        span.record("instance", payload.name.as_str());
        span.record("image", payload.image.as_str());

        let ip_address = if payload.attach_network {
            let lease = self.allocator.allocate(&payload.name).await?;
            span.record("ip", tracing::field::display(lease.ip));
            Some(lease.ip)
        } else {
            None
        };

        let spec = InstanceSpec {
            name: payload.name.clone(),
            image: payload.image.clone(),
            instance_type: payload.instance_type,
            limits: payload.limits.clone(),
            init_script: payload.user_data.clone(),
            ip_address,
        };
        match self.provider.create_instance(&spec).await {
            Ok(()) => Ok(()),
            // A retry may meet the instance an interrupted earlier attempt created.
            Err(ProviderError::Conflict(_)) if current_job.is_retry() => Ok(()),
            Err(ProviderError::Conflict(reason)) => Err(HandlerError::permanent(format!(
                "instance '{}' already exists: {reason}",
                payload.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Return the address this job leased. A lease older than the job
    /// belongs to an instance that existed before it and is kept.
    #[instrument(name = "handler.create_instance.abandon", skip_all, fields(instance, released_ip))]
    async fn abandon(&self, current_job: &CurrentJob) -> Result<(), HandlerError> {
        let JobPayload::CreateInstance(payload) = current_job.payload() else {
            return Ok(());
        };
        if !payload.attach_network {
            return Ok(());
        }
        let span = tracing::Span::current();
        span.record("instance", payload.name.as_str());
        let Some(lease) = self.allocator.lease_for(&payload.name).await? else {
            return Ok(());
        };
        if lease
            .allocated_at
            .is_some_and(|at| at >= current_job.created_at())
        {
            self.allocator.release(&payload.name).await?;
            span.record("released_ip", tracing::field::display(lease.ip));
        }
        Ok(())
    }
}

/// Deletes the instance and returns its address to the pool.
pub struct DeleteInstanceHandler {
    provider: Arc<dyn InstanceProvider>,
    allocator: IpAllocator,
}

impl DeleteInstanceHandler {
    pub fn new(provider: Arc<dyn InstanceProvider>, allocator: IpAllocator) -> Self {
        Self {
            provider,
            allocator,
        }
    }
}

#[async_trait]
impl JobHandler for DeleteInstanceHandler {
    #[instrument(name = "handler.delete_instance", skip_all, fields(instance, released_ip))]
    async fn run(&self, current_job: CurrentJob) -> Result<(), HandlerError> {
        if !matches!(current_job.payload(), JobPayload::DeleteInstance(_)) {
            return Err(unexpected_payload(&current_job));
        }
        let name = super::require_target(&current_job)?;
        let span = tracing::Span::current();
        span.record("instance", name);

        match self.provider.delete_instance(name).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(ip) = self.allocator.release(name).await? {
            span.record("released_ip", tracing::field::display(ip));
        }
        Ok(())
    }
}
