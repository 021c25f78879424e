use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use std::{
    collections::{BTreeMap, HashMap},
    net::Ipv4Addr,
    sync::{Mutex, MutexGuard},
};

use super::{IpLease, LeaseStore, Network};
use crate::error::IpamError;

#[derive(Default, Debug)]
struct PoolState {
    networks: Vec<Network>,
    leases: BTreeMap<Ipv4Addr, IpLease>,
}

/// Lease store held in process memory. A single mutex around all pools
/// makes every claim serializable.
#[derive(Default, Debug)]
pub struct MemoryLeaseStore {
    state: Mutex<PoolState>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a network. Networks are tried in the order they are added.
    /// Address ranges may not overlap, since a lease is keyed by its address.
    pub fn add_network(
        &self,
        name: impl Into<String>,
        cidr: impl Into<String>,
        gateway: Ipv4Addr,
        is_public: bool,
    ) -> Result<Network, IpamError> {
        let network = Network {
            id: Uuid::now_v7(),
            name: name.into(),
            cidr: cidr.into(),
            gateway,
            is_public,
            created_at: crate::time::now(),
        };
        let range = network.usable_range()?;
        let mut state = self.state();
        for existing in &state.networks {
            if existing.usable_range()?.overlaps(&range) {
                return Err(IpamError::InvalidNetwork {
                    network: network.cidr,
                    reason: format!("overlaps network '{}'", existing.name),
                });
            }
        }
        state.networks.push(network.clone());
        Ok(network)
    }

    /// Create a free lease row for every usable address of `network_id`.
    pub fn prepopulate(&self, network_id: Uuid) -> Result<usize, IpamError> {
        let mut state = self.state();
        let network = state
            .networks
            .iter()
            .find(|n| n.id == network_id)
            .cloned()
            .ok_or_else(|| IpamError::InvalidNetwork {
                network: network_id.to_string(),
                reason: "unknown network".to_string(),
            })?;
        let range = network.usable_range()?;
        let mut created = 0;
        for ip in range.addresses() {
            state.leases.entry(ip).or_insert_with(|| {
                created += 1;
                IpLease {
                    ip,
                    instance_name: None,
                    allocated_at: None,
                    network_id,
                }
            });
        }
        Ok(created)
    }

    pub fn leases(&self) -> Vec<IpLease> {
        self.state().leases.values().cloned().collect()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn networks(&self) -> Result<Vec<Network>, IpamError> {
        Ok(self.state().networks.clone())
    }

    async fn lease_for(&self, owner: &str) -> Result<Option<IpLease>, IpamError> {
        Ok(self
            .state()
            .leases
            .values()
            .find(|lease| lease.instance_name.as_deref() == Some(owner))
            .cloned())
    }

    async fn claim_next(
        &self,
        network_id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IpLease>, IpamError> {
        let mut state = self.state();
        let Some(network) = state.networks.iter().find(|n| n.id == network_id) else {
            return Ok(None);
        };
        let range = network.usable_range()?;

        let owners: HashMap<Ipv4Addr, Option<String>> = state
            .leases
            .values()
            .filter(|lease| lease.network_id == network_id)
            .map(|lease| (lease.ip, lease.instance_name.clone()))
            .collect();
        let Some(candidate) = range.first_free(&owners) else {
            return Ok(None);
        };

        let lease = IpLease {
            ip: candidate.ip,
            instance_name: Some(owner.to_string()),
            allocated_at: Some(now),
            network_id,
        };
        state.leases.insert(candidate.ip, lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, owner: &str) -> Result<Option<IpLease>, IpamError> {
        let mut state = self.state();
        let Some(lease) = state
            .leases
            .values_mut()
            .find(|lease| lease.instance_name.as_deref() == Some(owner))
        else {
            return Ok(None);
        };
        let freed = lease.clone();
        lease.instance_name = None;
        lease.allocated_at = None;
        Ok(Some(freed))
    }
}
