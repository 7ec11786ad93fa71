//! Route export and import policy.
//!
//! Pure functions over the configuration: no kernel access, no RPC. The
//! control plane calls [`should_import`] on every received route and the
//! coordinator calls [`export_routes_for`] when (re-)announcing.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;
use tokio::time::Instant;

use crate::config::OverlayConfig;
use crate::controlplane::Route;

/// Table used for routes whose VNI matches no configured overlay.
pub const FALLBACK_TABLE: u32 = 100;

/// Build the exportable routes of an overlay.
///
/// The next hop is the overlay's bridge IPv4 address (host part) when one
/// is configured, otherwise the caller-supplied local underlay address.
pub fn export_routes_for(overlay: &OverlayConfig, local_next_hop: Option<IpAddr>) -> Vec<Route> {
    let next_hop = overlay
        .bridge
        .ipv4
        .map(|net| IpAddr::V4(net.addr()))
        .or(local_next_hop);
    let lease_seconds = overlay.routing.import.install.route_lease_seconds;
    let metric = overlay.routing.export.metric;

    overlay
        .routing
        .export
        .networks
        .iter()
        .map(|network| Route {
            prefix: *network,
            next_hop,
            metric,
            lease_seconds,
            tags: Vec::new(),
            vni: overlay.vni,
            peer_id: String::new(),
            received_at: Instant::now(),
            expires_at: None,
        })
        .collect()
}

/// Evaluate an overlay's import policy for a route.
///
/// Deny wins over everything; `accept_all` wins over the allow list; with
/// neither, only routes covered by an allow prefix come in.
pub fn should_import(route: &Route, overlay: &OverlayConfig) -> bool {
    let import = &overlay.routing.import;

    if import.deny.iter().any(|deny| covers(deny, &route.prefix)) {
        return false;
    }
    if import.accept_all {
        return true;
    }
    import.allow.iter().any(|allow| covers(allow, &route.prefix))
}

/// True when `policy` is a supernet of (or equal to) `prefix`.
fn covers(policy: &IpNet, prefix: &IpNet) -> bool {
    match (policy, prefix) {
        (IpNet::V4(policy), IpNet::V4(prefix)) => {
            policy.prefix_len() <= prefix.prefix_len() && policy.contains(&prefix.network())
        }
        (IpNet::V6(policy), IpNet::V6(prefix)) => {
            policy.prefix_len() <= prefix.prefix_len() && policy.contains(&prefix.network())
        }
        _ => false,
    }
}

/// VNI -> kernel table mapping derived from the overlay list.
pub fn overlay_tables(overlays: &[OverlayConfig]) -> HashMap<u32, u32> {
    overlays
        .iter()
        .map(|overlay| (overlay.vni, overlay.routing.import.install.table))
        .collect()
}

/// Table for a route's VNI, falling back for unknown VNIs.
pub fn table_for_vni(tables: &HashMap<u32, u32>, vni: u32) -> u32 {
    tables.get(&vni).copied().unwrap_or(FALLBACK_TABLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn overlay(yaml_import: &str) -> OverlayConfig {
        let cfg = Config::load_str(&format!(
            r#"
version: 2
node:
  id: test
overlays:
  - vni: 100
    name: vxlan100
    bridge:
      name: br-test
      ipv4: 10.100.0.1/24
    routing:
      export:
        networks: [172.16.10.0/24, 172.16.11.0/24]
        metric: 50
      import:
{yaml_import}
"#
        ))
        .unwrap();
        cfg.overlays[0].clone()
    }

    fn learned(prefix: &str) -> Route {
        Route {
            prefix: prefix.parse().unwrap(),
            next_hop: Some("10.100.0.2".parse().unwrap()),
            metric: 100,
            lease_seconds: 30,
            tags: Vec::new(),
            vni: 100,
            peer_id: "peer-x".to_string(),
            received_at: Instant::now(),
            expires_at: None,
        }
    }

    #[test]
    fn deny_wins_over_accept_all() {
        let overlay = overlay(
            "        accept_all: true\n        deny: [0.0.0.0/0]",
        );
        assert!(!should_import(&learned("10.0.0.0/8"), &overlay));
    }

    #[test]
    fn accept_all_admits_undenied_routes() {
        let overlay = overlay(
            "        accept_all: true\n        deny: [192.168.0.0/16]",
        );
        assert!(should_import(&learned("10.0.0.0/8"), &overlay));
        assert!(!should_import(&learned("192.168.7.0/24"), &overlay));
    }

    #[test]
    fn allow_list_requires_supernet_match() {
        let overlay = overlay("        allow: [172.16.0.0/12]");
        assert!(should_import(&learned("172.16.20.0/24"), &overlay));
        assert!(should_import(&learned("172.16.0.0/12"), &overlay));
        // A mere overlap where the policy is narrower than the route is
        // not a match.
        assert!(!should_import(&learned("172.0.0.0/8"), &overlay));
        assert!(!should_import(&learned("10.0.0.0/8"), &overlay));
    }

    #[test]
    fn default_policy_denies() {
        let overlay = overlay("        accept_all: false");
        assert!(!should_import(&learned("10.0.0.0/8"), &overlay));
    }

    #[test]
    fn family_mismatch_never_matches() {
        let overlay = overlay("        allow: [172.16.0.0/12]");
        assert!(!should_import(&learned("fd00:100::/64"), &overlay));
    }

    #[test]
    fn export_uses_bridge_address_as_next_hop() {
        let overlay = overlay("        accept_all: true");
        let routes = export_routes_for(&overlay, Some("192.168.56.11".parse().unwrap()));
        assert_eq!(routes.len(), 2);
        for route in &routes {
            assert_eq!(route.next_hop, Some("10.100.0.1".parse().unwrap()));
            assert_eq!(route.metric, 50);
            assert_eq!(route.lease_seconds, 30);
            assert_eq!(route.vni, 100);
            assert!(route.is_local());
        }
    }

    #[test]
    fn export_falls_back_to_underlay_next_hop() {
        let mut overlay = overlay("        accept_all: true");
        overlay.bridge.ipv4 = None;
        let local = "192.168.56.11".parse().unwrap();
        let routes = export_routes_for(&overlay, Some(local));
        assert!(routes.iter().all(|r| r.next_hop == Some(local)));
    }

    #[test]
    fn export_is_stable() {
        let overlay = overlay("        accept_all: true");
        let a = export_routes_for(&overlay, None);
        let b = export_routes_for(&overlay, None);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.prefix, y.prefix);
            assert_eq!(x.next_hop, y.next_hop);
            assert_eq!(x.metric, y.metric);
            assert_eq!(x.lease_seconds, y.lease_seconds);
            assert_eq!(x.vni, y.vni);
        }
    }

    #[test]
    fn vni_table_map_falls_back() {
        let overlay = overlay("        accept_all: true");
        let tables = overlay_tables(std::slice::from_ref(&overlay));
        assert_eq!(table_for_vni(&tables, 100), 100);
        assert_eq!(table_for_vni(&tables, 999), FALLBACK_TABLE);
    }
}
