use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use std::{collections::HashMap, net::Ipv4Addr};

use super::{IpLease, LeaseStore, Network};
use crate::error::IpamError;

#[derive(Debug, FromRow)]
struct NetworkRow {
    id: Uuid,
    name: String,
    cidr: String,
    gateway: String,
    is_public: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<NetworkRow> for Network {
    type Error = IpamError;

    fn try_from(row: NetworkRow) -> Result<Self, Self::Error> {
        let gateway = row
            .gateway
            .parse()
            .map_err(|_| IpamError::InvalidNetwork {
                network: row.name.clone(),
                reason: format!("bad gateway '{}'", row.gateway),
            })?;
        Ok(Network {
            id: row.id,
            name: row.name,
            cidr: row.cidr,
            gateway,
            is_public: row.is_public,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct LeaseRow {
    ip: String,
    instance_name: Option<String>,
    allocated_at: Option<DateTime<Utc>>,
    network_id: Uuid,
}

impl TryFrom<LeaseRow> for IpLease {
    type Error = IpamError;

    fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
        let ip = row.ip.parse().map_err(|_| IpamError::InvalidNetwork {
            network: row.network_id.to_string(),
            reason: format!("bad lease address '{}'", row.ip),
        })?;
        Ok(IpLease {
            ip,
            instance_name: row.instance_name,
            allocated_at: row.allocated_at,
            network_id: row.network_id,
        })
    }
}

/// Lease store over the `networks` and `ip_leases` tables.
#[derive(Clone, Debug)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }

    /// Insert a network definition, optionally with a free lease row for
    /// each usable address. Rejects a range that overlaps an existing network.
    #[instrument(name = "ipam.create_network", skip(self), err)]
    pub async fn create_network(
        &self,
        name: &str,
        cidr: &str,
        gateway: Ipv4Addr,
        is_public: bool,
        prepopulate: bool,
    ) -> Result<Network, IpamError> {
        let network = Network {
            id: Uuid::now_v7(),
            name: name.to_string(),
            cidr: cidr.to_string(),
            gateway,
            is_public,
            created_at: crate::time::now(),
        };
        let range = network.usable_range()?;

        let mut tx = self.pool.begin().await?;
        // Serializes concurrent definitions so the overlap check holds.
        sqlx::query("LOCK TABLE networks IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;
        let existing = sqlx::query_as::<_, NetworkRow>(
            "SELECT id, name, cidr, gateway, is_public, created_at FROM networks",
        )
        .fetch_all(&mut *tx)
        .await?;
        for row in existing {
            let Ok(other) = Network::try_from(row) else {
                continue;
            };
            if other.usable_range().is_ok_and(|r| r.overlaps(&range)) {
                return Err(IpamError::InvalidNetwork {
                    network: network.cidr,
                    reason: format!("overlaps network '{}'", other.name),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO networks (id, name, cidr, gateway, is_public, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(network.id)
        .bind(&network.name)
        .bind(&network.cidr)
        .bind(network.gateway.to_string())
        .bind(network.is_public)
        .bind(network.created_at)
        .execute(&mut *tx)
        .await?;

        if prepopulate {
            let ips: Vec<String> = range.addresses().map(|ip| ip.to_string()).collect();
            sqlx::query(
                r#"
                INSERT INTO ip_leases (ip, network_id)
                SELECT ip, $2 FROM UNNEST($1::VARCHAR[]) AS ip
                ON CONFLICT (ip) DO NOTHING
                "#,
            )
            .bind(&ips)
            .bind(network.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(network)
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn networks(&self) -> Result<Vec<Network>, IpamError> {
        sqlx::query_as::<_, NetworkRow>(
            "SELECT id, name, cidr, gateway, is_public, created_at FROM networks ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Network::try_from)
        .collect()
    }

    async fn lease_for(&self, owner: &str) -> Result<Option<IpLease>, IpamError> {
        sqlx::query_as::<_, LeaseRow>(
            "SELECT ip, instance_name, allocated_at, network_id FROM ip_leases WHERE instance_name = $1",
        )
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?
        .map(IpLease::try_from)
        .transpose()
    }

    #[instrument(name = "ipam.claim_next", skip(self, now), fields(ip), err(level = "debug"))]
    async fn claim_next(
        &self,
        network_id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IpLease>, IpamError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        // Network row first: concurrent claims on the same pool queue here.
        let Some(network) = sqlx::query_as::<_, NetworkRow>(
            "SELECT id, name, cidr, gateway, is_public, created_at FROM networks WHERE id = $1 FOR UPDATE",
        )
        .bind(network_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };
        let network = Network::try_from(network)?;
        let range = network.usable_range()?;

        let owners: HashMap<Ipv4Addr, Option<String>> = sqlx::query_as::<_, LeaseRow>(
            "SELECT ip, instance_name, allocated_at, network_id FROM ip_leases WHERE network_id = $1",
        )
        .bind(network_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(IpLease::try_from)
        .map(|lease| lease.map(|l| (l.ip, l.instance_name)))
        .collect::<Result<_, _>>()?;

        let Some(candidate) = range.first_free(&owners) else {
            tx.rollback().await?;
            return Ok(None);
        };

        if candidate.has_row {
            sqlx::query(
                r#"
                UPDATE ip_leases SET instance_name = $2, allocated_at = $3
                WHERE ip = $1 AND instance_name IS NULL
                "#,
            )
            .bind(candidate.ip.to_string())
            .bind(owner)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO ip_leases (ip, instance_name, allocated_at, network_id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(candidate.ip.to_string())
            .bind(owner)
            .bind(now)
            .bind(network_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::Span::current().record("ip", tracing::field::display(candidate.ip));
        Ok(Some(IpLease {
            ip: candidate.ip,
            instance_name: Some(owner.to_string()),
            allocated_at: Some(now),
            network_id,
        }))
    }

    #[instrument(name = "ipam.release_lease", skip(self), err)]
    async fn release(&self, owner: &str) -> Result<Option<IpLease>, IpamError> {
        sqlx::query_as::<_, LeaseRow>(
            r#"
            UPDATE ip_leases l
            SET instance_name = NULL, allocated_at = NULL
            FROM (SELECT ip, instance_name, allocated_at FROM ip_leases WHERE instance_name = $1 FOR UPDATE) prev
            WHERE l.ip = prev.ip
            RETURNING l.ip, prev.instance_name, prev.allocated_at, l.network_id
            "#,
        )
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?
        .map(IpLease::try_from)
        .transpose()
    }
}
