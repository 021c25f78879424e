use lifecycle_jobs::{IpAllocator, MemoryLeaseStore, error::IpamError};

use std::{collections::HashSet, net::Ipv4Addr, sync::Arc};

fn gateway(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn allocator_with(store: &Arc<MemoryLeaseStore>) -> IpAllocator {
    IpAllocator::new(store.clone())
}

#[tokio::test]
async fn pool_is_exhausted_after_its_usable_addresses() -> anyhow::Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    store.add_network("lan", "10.0.0.0/29", gateway("10.0.0.1"), false)?;
    let allocator = allocator_with(&store);

    let mut ips = Vec::new();
    for n in 0..5 {
        ips.push(allocator.allocate(&format!("vm-{n}")).await?.ip);
    }
    assert_eq!(
        ips,
        (2..=6)
            .map(|host| Ipv4Addr::new(10, 0, 0, host))
            .collect::<Vec<_>>()
    );

    let err = allocator.allocate("vm-5").await.unwrap_err();
    assert!(matches!(err, IpamError::NoAddressAvailable));
    assert_eq!(err.to_string(), "no IP addresses available");
    Ok(())
}

#[tokio::test]
async fn released_address_is_handed_out_again() -> anyhow::Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    store.add_network("lan", "10.0.0.0/29", gateway("10.0.0.1"), false)?;
    let allocator = allocator_with(&store);

    let first = allocator.allocate("vm-a").await?;
    allocator.allocate("vm-b").await?;

    assert_eq!(allocator.release("vm-a").await?, Some(first.ip));
    assert_eq!(allocator.release("vm-a").await?, None);

    let reused = allocator.allocate("vm-c").await?;
    assert_eq!(reused.ip, first.ip);
    assert_eq!(reused.instance_name.as_deref(), Some("vm-c"));
    Ok(())
}

#[tokio::test]
async fn owner_keeps_its_lease_across_calls() -> anyhow::Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    store.add_network("lan", "10.0.0.0/29", gateway("10.0.0.1"), false)?;
    let allocator = allocator_with(&store);

    let first = allocator.allocate("vm-a").await?;
    let again = allocator.allocate("vm-a").await?;
    assert_eq!(first.ip, again.ip);
    assert_eq!(store.leases().len(), 1);
    Ok(())
}

#[tokio::test]
async fn networks_are_tried_in_priority_order() -> anyhow::Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    // A /30 with the gateway on .1 leaves exactly one address.
    let small = store.add_network("small", "10.0.0.0/30", gateway("10.0.0.1"), false)?;
    let large = store.add_network("large", "10.0.1.0/29", gateway("10.0.1.1"), true)?;
    let allocator = allocator_with(&store);

    let first = allocator.allocate("vm-a").await?;
    let second = allocator.allocate("vm-b").await?;
    assert_eq!(first.network_id, small.id);
    assert_eq!(first.ip, Ipv4Addr::new(10, 0, 0, 2));
    assert_eq!(second.network_id, large.id);
    assert_eq!(second.ip, Ipv4Addr::new(10, 0, 1, 2));
    Ok(())
}

#[tokio::test]
async fn prepopulated_rows_are_claimed_like_lazy_ones() -> anyhow::Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    let network = store.add_network("lan", "10.0.0.0/29", gateway("10.0.0.1"), false)?;
    assert_eq!(store.prepopulate(network.id)?, 5);
    assert_eq!(store.prepopulate(network.id)?, 0);
    let allocator = allocator_with(&store);

    for n in 0..5 {
        allocator.allocate(&format!("vm-{n}")).await?;
    }
    assert!(matches!(
        allocator.allocate("vm-5").await,
        Err(IpamError::NoAddressAvailable)
    ));
    assert_eq!(store.leases().len(), 5);
    Ok(())
}

#[tokio::test]
async fn overlapping_networks_are_rejected() -> anyhow::Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    store.add_network("lan", "10.0.0.0/24", gateway("10.0.0.1"), false)?;
    let overlap = store.add_network("dmz", "10.0.0.128/25", gateway("10.0.0.129"), true);
    assert!(matches!(overlap, Err(IpamError::InvalidNetwork { .. })));
    store.add_network("dmz", "10.0.1.0/25", gateway("10.0.1.1"), true)?;

    let allocator = allocator_with(&store);
    let lease = allocator.allocate("vm-0").await?;
    assert_eq!(lease.ip, Ipv4Addr::new(10, 0, 0, 2));
    assert_eq!(store.leases().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_allocations_never_share_an_address() -> anyhow::Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    // 62 hosts minus the gateway.
    store.add_network("lan", "10.1.0.0/26", gateway("10.1.0.1"), false)?;
    let allocator = allocator_with(&store);

    let tasks: Vec<_> = (0..100)
        .map(|n| {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.allocate(&format!("vm-{n}")).await })
        })
        .collect();

    let mut granted = HashSet::new();
    let mut exhausted = 0;
    for task in tasks {
        match task.await? {
            Ok(lease) => assert!(granted.insert(lease.ip), "{} handed out twice", lease.ip),
            Err(IpamError::NoAddressAvailable) => exhausted += 1,
            Err(e) => anyhow::bail!("unexpected error: {e}"),
        }
    }
    assert_eq!(granted.len(), 61);
    assert_eq!(exhausted, 39);
    Ok(())
}
