//! Peer lifecycle coordination.
//!
//! Two independent schedules run here: the announce schedule re-sends the
//! local export set to every healthy peer at half the shortest configured
//! lease (floored at 30 s), and the health schedule probes peers, flushes
//! routes owned by peers that just went down, and expires stale leases.
//! This is also where accepted routes become kernel routes, through
//! [`KernelInstaller`].

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rtnetlink::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, OverlayConfig};
use crate::controlplane::client::PeerClient;
use crate::controlplane::{Route, RouteSink, RouteTable};
use crate::netlink::{addr, RouteManager, RouteSpec, ROUTE_PROTOCOL_VXMESH};
use crate::routing::{self, export_routes_for, overlay_tables, table_for_vni, FALLBACK_TABLE};

/// Health probes and lease expiry run on this period.
const HEALTH_PERIOD: Duration = Duration::from_secs(30);

/// Minimum announce period; leases shorter than a minute still refresh at
/// this floor.
const ANNOUNCE_FLOOR: Duration = Duration::from_secs(30);

/// Installs accepted routes into the kernel, one table per overlay. The
/// control plane invokes this synchronously before acknowledging the RPC
/// that carried the routes.
pub struct KernelInstaller {
    routes: Arc<RouteManager>,
    tables: std::collections::HashMap<u32, u32>,
}

impl KernelInstaller {
    pub fn new(routes: Arc<RouteManager>, overlays: &[OverlayConfig]) -> Self {
        Self {
            routes,
            tables: overlay_tables(overlays),
        }
    }
}

#[async_trait]
impl RouteSink for KernelInstaller {
    async fn routes_ingested(&self, routes: &[Route]) {
        for route in routes {
            let Some(gateway) = route.next_hop else {
                warn!(
                    prefix = %route.prefix,
                    peer = %route.peer_id,
                    "route has no next hop, not installing"
                );
                continue;
            };
            let table = table_for_vni(&self.tables, route.vni);
            let spec = RouteSpec {
                destination: route.prefix,
                gateway: Some(gateway),
                table,
                metric: route.metric,
            };
            match self.routes.replace(&spec).await {
                Ok(()) => {
                    info!(
                        prefix = %route.prefix,
                        next_hop = %gateway,
                        peer = %route.peer_id,
                        table,
                        metric = route.metric,
                        "installed route from peer"
                    );
                }
                Err(err) => {
                    warn!(
                        prefix = %route.prefix,
                        next_hop = %gateway,
                        error = %err,
                        "failed to install route"
                    );
                }
            }
        }
    }

    async fn routes_withdrawn(&self, routes: &[Route]) {
        for route in routes {
            let table = table_for_vni(&self.tables, route.vni);
            match self.routes.delete(route.prefix, table).await {
                Ok(()) => {
                    info!(prefix = %route.prefix, peer = %route.peer_id, table, "removed withdrawn route");
                }
                Err(err) => {
                    warn!(prefix = %route.prefix, error = %err, "failed to remove withdrawn route");
                }
            }
        }
    }
}

pub struct Coordinator {
    cfg: Arc<Config>,
    table: Arc<RouteTable>,
    peers: Arc<PeerClient>,
    routes: Arc<RouteManager>,
    local_routes: Arc<RwLock<Vec<Route>>>,
    handle: Handle,
}

impl Coordinator {
    pub fn new(
        cfg: Arc<Config>,
        table: Arc<RouteTable>,
        peers: Arc<PeerClient>,
        routes: Arc<RouteManager>,
        local_routes: Arc<RwLock<Vec<Route>>>,
        handle: Handle,
    ) -> Self {
        Self {
            cfg,
            table,
            peers,
            routes,
            local_routes,
            handle,
        }
    }

    /// Run both schedules until cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        let announce_period = announce_period(&self.cfg.overlays);
        info!(
            announce_period = ?announce_period,
            health_period = ?HEALTH_PERIOD,
            "starting peer lifecycle coordinator"
        );

        let mut announce = tokio::time::interval(announce_period);
        let mut health = tokio::time::interval(HEALTH_PERIOD);
        // Both intervals fire immediately; the initial exchange already
        // happened during startup.
        announce.tick().await;
        health.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = announce.tick() => self.announce_cycle().await,
                _ = health.tick() => self.health_cycle().await,
            }
        }
        info!("peer lifecycle coordinator stopped");
    }

    /// Recompute the export set and re-announce it, refreshing leases on
    /// the peer side.
    async fn announce_cycle(&self) {
        let local = self.refresh_local_routes().await;
        if local.is_empty() {
            return;
        }
        debug!(route_count = local.len(), "re-announcing local routes");
        self.peers.announce_routes(&local).await;
    }

    async fn health_cycle(&self) {
        let tables = overlay_tables(&self.cfg.overlays);

        let went_down = self.peers.check_peer_health().await;
        for peer_id in &went_down {
            self.flush_peer_routes(peer_id, &tables).await;
        }

        let expired = self.table.expire_stale();
        for route in &expired {
            let table = table_for_vni(&tables, route.vni);
            info!(
                prefix = %route.prefix,
                peer = %route.peer_id,
                table,
                "route lease expired"
            );
            if let Err(err) = self.routes.delete(route.prefix, table).await {
                warn!(prefix = %route.prefix, error = %err, "failed to remove expired route");
            }
        }
    }

    /// Withdraw a down peer's routes from kernel and table, honoring each
    /// route's per-overlay `flush_on_peer_down` flag.
    async fn flush_peer_routes(
        &self,
        peer_id: &str,
        tables: &std::collections::HashMap<u32, u32>,
    ) {
        let owned = self.table.get_by_peer(peer_id);
        if owned.is_empty() {
            return;
        }
        let mut flushed = 0;
        for route in owned {
            let flush = self
                .cfg
                .overlay_for_vni(route.vni)
                .map(|o| o.routing.import.install.flush_on_peer_down)
                .unwrap_or(true);
            if !flush {
                continue;
            }
            let table = table_for_vni(tables, route.vni);
            if let Err(err) = self.routes.delete(route.prefix, table).await {
                warn!(prefix = %route.prefix, error = %err, "failed to remove route of down peer");
            }
            self.table.remove(&route.prefix);
            flushed += 1;
        }
        info!(peer_id = %peer_id, flushed, "flushed routes of unhealthy peer");
    }

    /// Rebuild the export set from the overlay list, detect the underlay
    /// next-hop for overlays without a bridge address, and publish it for
    /// the server's state-exchange replies. Returns the fresh set.
    pub async fn refresh_local_routes(&self) -> Vec<Route> {
        let local_ip = self.detect_underlay_ip().await;
        let mut all = Vec::new();
        for overlay in &self.cfg.overlays {
            all.extend(export_routes_for(overlay, local_ip));
        }
        *self.local_routes.write().unwrap() = all.clone();
        all
    }

    async fn detect_underlay_ip(&self) -> Option<IpAddr> {
        let first_peer = self.peers.first_peer_address()?;
        match addr::detect_local_ip(&self.handle, first_peer).await {
            Ok(found) => found,
            Err(err) => {
                debug!(error = %err, "local underlay address detection failed");
                None
            }
        }
    }
}

/// Announce period: half the shortest configured lease, floored at 30 s.
pub fn announce_period(overlays: &[OverlayConfig]) -> Duration {
    let min_lease = overlays
        .iter()
        .map(|o| o.routing.import.install.route_lease_seconds)
        .filter(|lease| *lease > 0)
        .min()
        .unwrap_or(30);
    ANNOUNCE_FLOOR.max(Duration::from_secs(u64::from(min_lease) / 2))
}

/// Remove every daemon-tagged route from every overlay table plus the
/// fallback table. Best-effort; called once during shutdown.
pub async fn flush_daemon_routes(cfg: &Config, routes: &RouteManager) {
    let mut tables: HashSet<u32> = routing::overlay_tables(&cfg.overlays).values().copied().collect();
    tables.insert(FALLBACK_TABLE);
    for table in tables {
        if let Err(err) = routes.flush_by_protocol(table, ROUTE_PROTOCOL_VXMESH).await {
            warn!(table, error = %err, "failed to flush daemon routes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn overlays_with_leases(leases: &[u32]) -> Vec<OverlayConfig> {
        leases
            .iter()
            .enumerate()
            .map(|(i, lease)| {
                let cfg = Config::load_str(&format!(
                    r#"
version: 2
node:
  id: test
overlays:
  - vni: {vni}
    name: vxlan{vni}
    bridge:
      name: br-{vni}
    routing:
      import:
        install:
          route_lease_seconds: {lease}
"#,
                    vni = i + 1,
                    lease = lease
                ))
                .unwrap();
                cfg.overlays[0].clone()
            })
            .collect()
    }

    #[test]
    fn announce_period_floors_at_thirty_seconds() {
        let overlays = overlays_with_leases(&[30]);
        assert_eq!(announce_period(&overlays), Duration::from_secs(30));

        let overlays = overlays_with_leases(&[10]);
        assert_eq!(announce_period(&overlays), Duration::from_secs(30));
    }

    #[test]
    fn announce_period_halves_the_shortest_lease() {
        let overlays = overlays_with_leases(&[300, 120]);
        assert_eq!(announce_period(&overlays), Duration::from_secs(60));
    }

    #[test]
    fn announce_period_defaults_without_overlays() {
        assert_eq!(announce_period(&[]), Duration::from_secs(30));
    }
}
