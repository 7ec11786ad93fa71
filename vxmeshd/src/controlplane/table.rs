//! Shared route table.
//!
//! Keyed by prefix: a later route for the same prefix replaces the earlier
//! one no matter who announced it. Learned routes carry a lease and expire
//! if not refreshed; locally-originated routes never do.

use std::collections::HashMap;
use std::sync::RwLock;

use ipnet::IpNet;
use tokio::time::Instant;

use super::{lease_duration, Route};

pub struct RouteTable {
    routes: RwLock<HashMap<IpNet, Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a route, stamping its receive time and lease expiry.
    /// Overwrites any existing entry for the prefix (last writer wins).
    /// Returns the stamped route.
    pub fn add(&self, mut route: Route) -> Route {
        route.received_at = Instant::now();
        route.expires_at = if route.lease_seconds > 0 {
            Some(route.received_at + lease_duration(route.lease_seconds))
        } else {
            None
        };
        self.routes
            .write()
            .unwrap()
            .insert(route.prefix, route.clone());
        route
    }

    pub fn remove(&self, prefix: &IpNet) -> Option<Route> {
        self.routes.write().unwrap().remove(prefix)
    }

    /// Drop every route owned by a peer. Returns how many were removed.
    pub fn remove_by_peer(&self, peer_id: &str) -> usize {
        let mut routes = self.routes.write().unwrap();
        let before = routes.len();
        routes.retain(|_, route| route.peer_id != peer_id);
        before - routes.len()
    }

    pub fn get(&self, prefix: &IpNet) -> Option<Route> {
        self.routes.read().unwrap().get(prefix).cloned()
    }

    pub fn all(&self) -> Vec<Route> {
        self.routes.read().unwrap().values().cloned().collect()
    }

    pub fn get_by_peer(&self, peer_id: &str) -> Vec<Route> {
        self.routes
            .read()
            .unwrap()
            .values()
            .filter(|route| route.peer_id == peer_id)
            .cloned()
            .collect()
    }

    /// Remove and return every route whose lease has elapsed. Routes
    /// without an expiry are untouched.
    pub fn expire_stale(&self) -> Vec<Route> {
        let now = Instant::now();
        let mut routes = self.routes.write().unwrap();
        let expired: Vec<IpNet> = routes
            .values()
            .filter(|route| route.expires_at.map(|at| at <= now).unwrap_or(false))
            .map(|route| route.prefix)
            .collect();
        expired
            .into_iter()
            .filter_map(|prefix| routes.remove(&prefix))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().unwrap().is_empty()
    }

    /// Count of routes per owning peer, for status reporting.
    pub fn count_by_peer(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for route in self.routes.read().unwrap().values() {
            if !route.peer_id.is_empty() {
                *counts.entry(route.peer_id.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn route(prefix: &str, peer: &str, lease: u32) -> Route {
        Route {
            prefix: prefix.parse().unwrap(),
            next_hop: Some("10.100.0.2".parse().unwrap()),
            metric: 100,
            lease_seconds: lease,
            tags: Vec::new(),
            vni: 100,
            peer_id: peer.to_string(),
            received_at: Instant::now(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let table = RouteTable::new();
        table.add(route("172.16.10.0/24", "peer-a", 30));
        table.add(route("172.16.10.0/24", "peer-b", 30));

        let prefix = "172.16.10.0/24".parse().unwrap();
        assert_eq!(table.get(&prefix).unwrap().peer_id, "peer-b");
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn remove_by_peer_spares_other_owners() {
        let table = RouteTable::new();
        table.add(route("172.16.10.0/24", "peer-a", 30));
        table.add(route("172.16.20.0/24", "peer-b", 30));

        assert_eq!(table.remove_by_peer("peer-b"), 1);
        let prefix = "172.16.10.0/24".parse().unwrap();
        assert_eq!(table.get(&prefix).unwrap().peer_id, "peer-a");
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_boundary() {
        let table = RouteTable::new();
        table.add(route("172.16.30.0/24", "peer-c", 10));

        tokio::time::advance(Duration::from_millis(9_900)).await;
        assert!(table.expire_stale().is_empty());

        tokio::time::advance(Duration::from_millis(200)).await;
        let expired = table.expire_stale();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].prefix.to_string(), "172.16.30.0/24");
        let prefix = "172.16.30.0/24".parse().unwrap();
        assert!(table.get(&prefix).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn routes_without_lease_never_expire() {
        let table = RouteTable::new();
        table.add(route("172.16.40.0/24", "", 0));

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(table.expire_stale().is_empty());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn expiry_tracks_receive_time_and_lease() {
        let table = RouteTable::new();
        let stamped = table.add(route("172.16.50.0/24", "peer-d", 30));
        let expected = stamped.received_at + Duration::from_secs(30);
        assert_eq!(stamped.expires_at, Some(expected));
    }

    #[tokio::test]
    async fn all_and_get_by_peer_see_every_entry() {
        let table = RouteTable::new();
        table.add(route("172.16.10.0/24", "peer-a", 30));
        table.add(route("172.16.20.0/24", "peer-b", 30));
        table.add(route("172.16.21.0/24", "peer-b", 30));

        assert_eq!(table.all().len(), 3);
        let from_b = table.get_by_peer("peer-b");
        assert_eq!(from_b.len(), 2);
        assert!(from_b.iter().all(|r| r.peer_id == "peer-b"));
        assert!(table.get_by_peer("peer-c").is_empty());
    }

    #[tokio::test]
    async fn counts_by_peer_skip_local_routes() {
        let table = RouteTable::new();
        table.add(route("172.16.10.0/24", "peer-a", 30));
        table.add(route("172.16.20.0/24", "peer-a", 30));
        table.add(route("172.16.30.0/24", "", 0));

        let counts = table.count_by_peer();
        assert_eq!(counts.get("peer-a"), Some(&2));
        assert!(!counts.contains_key(""));
    }
}
