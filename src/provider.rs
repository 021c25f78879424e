//! The narrow operation surface the engine needs from the infrastructure
//! provider. Each call returns when the provider has finished (or failed)
//! and may take up to the handler timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use std::net::Ipv4Addr;

use crate::{
    error::ProviderError,
    payload::{InstanceType, Limits, PortMappingPayload, StateAction},
};

/// Everything needed to create one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub image: String,
    pub instance_type: InstanceType,
    pub limits: Limits,
    pub init_script: Option<String>,
    /// Static address leased for the instance, if it is network-attached.
    pub ip_address: Option<Ipv4Addr>,
}

/// Operations are expected to be safe to repeat: either idempotent or
/// failing recognisably (e.g. [`ProviderError::Conflict`] for "already exists").
#[async_trait]
pub trait InstanceProvider: Send + Sync + 'static {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), ProviderError>;

    async fn delete_instance(&self, name: &str) -> Result<(), ProviderError>;

    async fn change_state(
        &self,
        name: &str,
        action: StateAction,
        force: bool,
    ) -> Result<(), ProviderError>;

    async fn update_limits(&self, name: &str, limits: &Limits) -> Result<(), ProviderError>;

    async fn create_snapshot(
        &self,
        name: &str,
        snapshot: &str,
        stateful: bool,
    ) -> Result<(), ProviderError>;

    async fn restore_snapshot(
        &self,
        name: &str,
        snapshot: &str,
        stateful: bool,
    ) -> Result<(), ProviderError>;

    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<(), ProviderError>;

    async fn add_port_mapping(
        &self,
        name: &str,
        mapping: &PortMappingPayload,
    ) -> Result<(), ProviderError>;

    async fn remove_port_mapping(
        &self,
        name: &str,
        mapping: &PortMappingPayload,
    ) -> Result<(), ProviderError>;
}
