//! Address arithmetic for IPv4 pools.

use std::{collections::HashMap, net::Ipv4Addr};

use crate::error::IpamError;

/// Usable host addresses of a network: everything between the network and
/// broadcast addresses, minus the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsableRange {
    first: u32,
    last: u32,
    gateway: Ipv4Addr,
}

/// Address picked for a claim, and whether a lease row already exists for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub ip: Ipv4Addr,
    pub has_row: bool,
}

impl UsableRange {
    pub fn parse(cidr: &str, gateway: Ipv4Addr) -> Result<Self, IpamError> {
        let invalid = |reason: &str| IpamError::InvalidNetwork {
            network: cidr.to_string(),
            reason: reason.to_string(),
        };
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| invalid("missing prefix length"))?;
        let addr: Ipv4Addr = addr.trim().parse().map_err(|_| invalid("bad address"))?;
        let prefix: u32 = prefix
            .trim()
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| invalid("prefix length must be 0-32"))?;

        let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
        let network = u32::from(addr) & mask;
        let broadcast = network | !mask;
        let (first, last) = if broadcast - network < 2 {
            // /31 and /32 have no addresses left after excluding network and broadcast.
            (1, 0)
        } else {
            (network + 1, broadcast - 1)
        };
        Ok(Self {
            first,
            last,
            gateway,
        })
    }

    /// Usable addresses in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (self.first..=self.last)
            .map(Ipv4Addr::from)
            .filter(move |ip| *ip != self.gateway)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let n = u32::from(ip);
        n >= self.first && n <= self.last && ip != self.gateway
    }

    /// Whether the two ranges share any host address.
    pub fn overlaps(&self, other: &UsableRange) -> bool {
        self.first <= self.last
            && other.first <= other.last
            && self.first <= other.last
            && other.first <= self.last
    }

    pub fn capacity(&self) -> usize {
        self.addresses().count()
    }

    /// First address with no lease row or with an ownerless row. Works for
    /// pre-populated and sparse pools alike.
    pub fn first_free(&self, leases: &HashMap<Ipv4Addr, Option<String>>) -> Option<Candidate> {
        self.addresses().find_map(|ip| match leases.get(&ip) {
            None => Some(Candidate { ip, has_row: false }),
            Some(None) => Some(Candidate { ip, has_row: true }),
            Some(Some(_)) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn excludes_network_gateway_and_broadcast() {
        let range = UsableRange::parse("10.0.0.0/29", ip("10.0.0.1")).unwrap();
        let addresses: Vec<_> = range.addresses().collect();
        assert_eq!(
            addresses,
            ["10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6"].map(ip)
        );
        assert!(!range.contains(ip("10.0.0.7")));
        assert!(!range.contains(ip("10.0.0.1")));
    }

    #[test]
    fn host_bits_in_cidr_are_masked() {
        let range = UsableRange::parse("192.168.1.77/30", ip("192.168.1.1")).unwrap();
        assert_eq!(
            range.addresses().collect::<Vec<_>>(),
            ["192.168.1.77", "192.168.1.78"].map(ip)
        );
    }

    #[test]
    fn overlap_is_detected_across_prefix_lengths() {
        let wide = UsableRange::parse("10.0.0.0/24", ip("10.0.0.1")).unwrap();
        let inner = UsableRange::parse("10.0.0.64/29", ip("10.0.0.65")).unwrap();
        let beside = UsableRange::parse("10.0.1.0/24", ip("10.0.1.1")).unwrap();
        let tiny = UsableRange::parse("10.0.0.7/32", ip("10.0.0.1")).unwrap();
        assert!(wide.overlaps(&inner));
        assert!(inner.overlaps(&wide));
        assert!(!wide.overlaps(&beside));
        assert!(!wide.overlaps(&tiny));
    }

    #[test]
    fn tiny_networks_have_no_usable_addresses() {
        for cidr in ["10.0.0.0/31", "10.0.0.5/32", "0.0.0.0/32"] {
            let range = UsableRange::parse(cidr, ip("10.0.0.1")).unwrap();
            assert_eq!(range.capacity(), 0, "{cidr}");
        }
    }

    #[test]
    fn rejects_malformed_cidrs() {
        for cidr in ["10.0.0.0", "10.0.0/24", "10.0.0.0/33", "10.0.0.0/x"] {
            assert!(matches!(
                UsableRange::parse(cidr, ip("10.0.0.1")),
                Err(IpamError::InvalidNetwork { .. })
            ));
        }
    }

    #[test]
    fn first_free_prefers_lowest_unowned_address() {
        let range = UsableRange::parse("10.0.0.0/29", ip("10.0.0.1")).unwrap();
        let mut leases = HashMap::new();
        leases.insert(ip("10.0.0.2"), Some("web-01".to_string()));
        leases.insert(ip("10.0.0.3"), None);
        assert_eq!(
            range.first_free(&leases),
            Some(Candidate {
                ip: ip("10.0.0.3"),
                has_row: true
            })
        );

        leases.insert(ip("10.0.0.3"), Some("web-02".to_string()));
        assert_eq!(
            range.first_free(&leases),
            Some(Candidate {
                ip: ip("10.0.0.4"),
                has_row: false
            })
        );
    }

    #[test]
    fn full_pool_has_no_candidate() {
        let range = UsableRange::parse("10.0.0.0/30", ip("10.0.0.1")).unwrap();
        let leases = HashMap::from([(ip("10.0.0.2"), Some("web-01".to_string()))]);
        assert_eq!(range.first_free(&leases), None);
    }
}
