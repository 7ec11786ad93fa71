//! Kernel-facing driver tests.
//!
//! These need root and NET_ADMIN; without them each test prints a skip
//! notice and returns. Object names are prefixed `vxmt` to stay out of the
//! way of real interfaces, and everything created is removed again.
//!
//! Run with: sudo -E cargo test --test kernel -- --test-threads=1

use vxmeshd::netlink::{
    BridgeManager, BridgeSpec, Netlink, NetlinkError, RouteManager, RouteSpec, VxlanManager,
    VxlanSpec, ROUTE_PROTOCOL_VXMESH,
};

const TEST_BRIDGE: &str = "vxmt0br";
const TEST_VXLAN: &str = "vxmt0vx";
const TEST_TABLE: u32 = 198;

fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Treat missing privileges as a skip, not a failure.
fn skippable(err: &NetlinkError) -> bool {
    matches!(err, NetlinkError::PermissionDenied(_))
}

#[tokio::test]
async fn bridge_lifecycle_is_idempotent() {
    if !is_root() {
        eprintln!("skipping: requires root privileges");
        return;
    }
    let netlink = Netlink::connect().await.unwrap();
    let bridges = BridgeManager::new(netlink.handle());

    let spec = BridgeSpec {
        name: TEST_BRIDGE.to_string(),
        mtu: 1450,
        stp: None,
    };
    match bridges.ensure(&spec).await {
        Ok(()) => {}
        Err(err) if skippable(&err) => {
            eprintln!("skipping: {err}");
            return;
        }
        Err(err) => panic!("bridge ensure failed: {err}"),
    }

    // Second ensure must be a no-op that still succeeds.
    bridges.ensure(&spec).await.unwrap();

    let info = bridges.get(TEST_BRIDGE).await.unwrap();
    assert_eq!(info.name, TEST_BRIDGE);
    assert_eq!(info.mtu, 1450);
    assert!(info.up);

    bridges
        .add_address(TEST_BRIDGE, "10.199.99.1/24".parse().unwrap())
        .await
        .unwrap();
    // Adding the same address again is fine.
    bridges
        .add_address(TEST_BRIDGE, "10.199.99.1/24".parse().unwrap())
        .await
        .unwrap();

    bridges.delete(TEST_BRIDGE).await.unwrap();
    // Deleting a missing bridge is fine too.
    bridges.delete(TEST_BRIDGE).await.unwrap();
}

#[tokio::test]
async fn vxlan_attaches_to_its_bridge() {
    if !is_root() {
        eprintln!("skipping: requires root privileges");
        return;
    }
    let netlink = Netlink::connect().await.unwrap();
    let bridges = BridgeManager::new(netlink.handle());
    let vxlans = VxlanManager::new(netlink.handle());

    let bridge_spec = BridgeSpec {
        name: TEST_BRIDGE.to_string(),
        mtu: 1450,
        stp: None,
    };
    match bridges.ensure(&bridge_spec).await {
        Ok(()) => {}
        Err(err) if skippable(&err) => {
            eprintln!("skipping: {err}");
            return;
        }
        Err(err) => panic!("bridge ensure failed: {err}"),
    }

    let vxlan_spec = VxlanSpec {
        name: TEST_VXLAN.to_string(),
        vni: 7001,
        dst_port: 14789,
        local: None,
        mtu: 1400,
        learning: false,
        bridge: TEST_BRIDGE.to_string(),
        group: None,
        underlay_index: None,
    };
    vxlans.ensure(&vxlan_spec).await.unwrap();
    vxlans.ensure(&vxlan_spec).await.unwrap();

    let info = bridges.get(TEST_BRIDGE).await.unwrap();
    assert!(
        info.attached_interfaces.iter().any(|i| i == TEST_VXLAN),
        "vxlan should be enslaved to the bridge, got {:?}",
        info.attached_interfaces
    );

    vxlans.delete(TEST_VXLAN).await.unwrap();
    vxlans.delete(TEST_VXLAN).await.unwrap();
    bridges.delete(TEST_BRIDGE).await.unwrap();
}

#[tokio::test]
async fn tagged_routes_roundtrip_through_a_table() {
    if !is_root() {
        eprintln!("skipping: requires root privileges");
        return;
    }
    let netlink = Netlink::connect().await.unwrap();
    let bridges = BridgeManager::new(netlink.handle());
    let routes = RouteManager::new(netlink.handle());

    // A local subnet to make the gateway resolvable.
    let bridge_spec = BridgeSpec {
        name: TEST_BRIDGE.to_string(),
        mtu: 1450,
        stp: None,
    };
    match bridges.ensure(&bridge_spec).await {
        Ok(()) => {}
        Err(err) if skippable(&err) => {
            eprintln!("skipping: {err}");
            return;
        }
        Err(err) => panic!("bridge ensure failed: {err}"),
    }
    bridges
        .add_address(TEST_BRIDGE, "10.199.99.1/24".parse().unwrap())
        .await
        .unwrap();

    let spec = RouteSpec {
        destination: "172.31.73.0/24".parse().unwrap(),
        gateway: Some("10.199.99.2".parse().unwrap()),
        table: TEST_TABLE,
        metric: 100,
    };
    routes.replace(&spec).await.unwrap();
    // Replace is an upsert; repeating it must not fail or duplicate.
    routes.replace(&spec).await.unwrap();

    let listed = routes
        .list_by_protocol(TEST_TABLE, ROUTE_PROTOCOL_VXMESH)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].destination.to_string(), "172.31.73.0/24");
    assert_eq!(listed[0].gateway, Some("10.199.99.2".parse().unwrap()));

    let removed = routes
        .flush_by_protocol(TEST_TABLE, ROUTE_PROTOCOL_VXMESH)
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(routes
        .list_by_protocol(TEST_TABLE, ROUTE_PROTOCOL_VXMESH)
        .await
        .unwrap()
        .is_empty());

    // Deleting a route that is already gone is not an error.
    routes
        .delete("172.31.73.0/24".parse().unwrap(), TEST_TABLE)
        .await
        .unwrap();

    // Desired-state sync: one route changes gateway, one is new, one
    // (from the seed below) goes stale.
    let seed = RouteSpec {
        destination: "172.31.74.0/24".parse().unwrap(),
        gateway: Some("10.199.99.2".parse().unwrap()),
        table: TEST_TABLE,
        metric: 100,
    };
    routes.replace(&seed).await.unwrap();

    let desired = vec![
        RouteSpec {
            destination: "172.31.73.0/24".parse().unwrap(),
            gateway: Some("10.199.99.3".parse().unwrap()),
            table: TEST_TABLE,
            metric: 100,
        },
        RouteSpec {
            destination: "172.31.75.0/24".parse().unwrap(),
            gateway: Some("10.199.99.2".parse().unwrap()),
            table: TEST_TABLE,
            metric: 50,
        },
    ];
    routes.sync(TEST_TABLE, &desired).await.unwrap();

    let mut listed = routes
        .list_by_protocol(TEST_TABLE, ROUTE_PROTOCOL_VXMESH)
        .await
        .unwrap();
    listed.sort_by_key(|e| e.destination.to_string());
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].destination.to_string(), "172.31.73.0/24");
    assert_eq!(listed[0].gateway, Some("10.199.99.3".parse().unwrap()));
    assert_eq!(listed[1].destination.to_string(), "172.31.75.0/24");

    routes
        .flush_by_protocol(TEST_TABLE, ROUTE_PROTOCOL_VXMESH)
        .await
        .unwrap();

    bridges.delete(TEST_BRIDGE).await.unwrap();
}
