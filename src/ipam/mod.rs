//! IP address pools and the allocator used when provisioning
//! network-attached instances.
//!
//! Locking order for a claim: the network row first, then the lease scan.
//! Stores that ever claim across several networks in one transaction must
//! lock network rows in creation order to stay deadlock free.

mod memory;
mod pg;
mod range;

pub use memory::MemoryLeaseStore;
pub use pg::PgLeaseStore;
pub use range::{Candidate, UsableRange};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use std::{net::Ipv4Addr, sync::Arc};

use crate::error::IpamError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: Uuid,
    pub name: String,
    pub cidr: String,
    pub gateway: Ipv4Addr,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
}

impl Network {
    pub fn usable_range(&self) -> Result<UsableRange, IpamError> {
        UsableRange::parse(&self.cidr, self.gateway)
    }
}

/// One address of a pool. A lease without an owner is free.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpLease {
    pub ip: Ipv4Addr,
    pub instance_name: Option<String>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub network_id: Uuid,
}

/// Storage seam for networks and leases.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Every network, in creation order.
    async fn networks(&self) -> Result<Vec<Network>, IpamError>;

    async fn lease_for(&self, owner: &str) -> Result<Option<IpLease>, IpamError>;

    /// Claim the lowest free address of `network_id` for `owner` inside one
    /// serializable unit of work. `Ok(None)` means the pool is exhausted.
    async fn claim_next(
        &self,
        network_id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IpLease>, IpamError>;

    /// Clear the owner of `owner`'s lease, keeping the row. Returns the
    /// freed lease, or `None` if `owner` held nothing.
    async fn release(&self, owner: &str) -> Result<Option<IpLease>, IpamError>;
}

/// Hands out addresses across all networks in priority order.
#[derive(Clone)]
pub struct IpAllocator {
    store: Arc<dyn LeaseStore>,
}

impl IpAllocator {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self { store }
    }

    /// Lease an address for `owner`. An owner that already holds a lease
    /// gets the same one back, so a retried provisioning job does not leak
    /// addresses.
    #[instrument(name = "ipam.allocate", skip(self), fields(ip, network), err(level = "warn"))]
    pub async fn allocate(&self, owner: &str) -> Result<IpLease, IpamError> {
        if let Some(existing) = self.store.lease_for(owner).await? {
            tracing::Span::current().record("ip", tracing::field::display(existing.ip));
            return Ok(existing);
        }

        for network in self.store.networks().await? {
            match self
                .store
                .claim_next(network.id, owner, crate::time::now())
                .await
            {
                Ok(Some(lease)) => {
                    let span = tracing::Span::current();
                    span.record("ip", tracing::field::display(lease.ip));
                    span.record("network", tracing::field::display(&network.name));
                    return Ok(lease);
                }
                Ok(None) => {
                    tracing::debug!(network = %network.name, "address pool exhausted");
                }
                Err(e @ IpamError::InvalidNetwork { .. }) => {
                    tracing::warn!(network = %network.name, error = %e, "skipping network");
                }
                Err(e) => return Err(e),
            }
        }
        Err(IpamError::NoAddressAvailable)
    }

    /// The lease `owner` holds, if any.
    pub async fn lease_for(&self, owner: &str) -> Result<Option<IpLease>, IpamError> {
        self.store.lease_for(owner).await
    }

    /// Return `owner`'s address to the pool. A no-op when it holds none.
    #[instrument(name = "ipam.release", skip(self), err)]
    pub async fn release(&self, owner: &str) -> Result<Option<Ipv4Addr>, IpamError> {
        Ok(self.store.release(owner).await?.map(|lease| lease.ip))
    }
}
