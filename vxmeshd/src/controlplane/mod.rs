//! Route-exchange control plane.
//!
//! Both halves of the protocol live here: the gRPC server peers dial into
//! and the client this daemon dials out with. They share the in-memory
//! route table, the ingest pipeline that applies import policy, and the
//! [`RouteSink`] seam through which accepted routes reach the kernel.

pub mod client;
pub mod server;
pub mod table;
pub mod tls;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::OverlayConfig;
use crate::routing;
use vxmesh_api::proto;

pub use table::RouteTable;

/// A route known to this node, either learned from a peer or originated
/// locally from the export policy.
#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: IpNet,
    pub next_hop: Option<IpAddr>,
    pub metric: u32,
    pub lease_seconds: u32,
    pub tags: Vec<String>,
    pub vni: u32,
    /// Originating peer id; empty for locally-originated routes.
    pub peer_id: String,
    pub received_at: Instant,
    pub expires_at: Option<Instant>,
}

impl Route {
    pub fn is_local(&self) -> bool {
        self.peer_id.is_empty()
    }

    /// Validate a wire route into the internal model, attributing it to
    /// `peer_id`.
    pub fn from_wire(wire: &proto::Route, peer_id: &str) -> Result<Route, RoutePayloadError> {
        let prefix: IpNet = wire
            .prefix
            .parse()
            .map_err(|_| RoutePayloadError::Prefix(wire.prefix.clone()))?;
        let next_hop = if wire.next_hop.is_empty() {
            None
        } else {
            Some(
                wire.next_hop
                    .parse::<IpAddr>()
                    .map_err(|_| RoutePayloadError::NextHop(wire.next_hop.clone()))?,
            )
        };
        Ok(Route {
            prefix,
            next_hop,
            metric: wire.metric,
            lease_seconds: wire.lease_seconds,
            tags: wire.tags.clone(),
            vni: wire.vni,
            peer_id: peer_id.to_string(),
            received_at: Instant::now(),
            expires_at: None,
        })
    }

    pub fn to_wire(&self) -> proto::Route {
        proto::Route {
            prefix: self.prefix.to_string(),
            next_hop: self
                .next_hop
                .map(|a| a.to_string())
                .unwrap_or_default(),
            metric: self.metric,
            lease_seconds: self.lease_seconds,
            tags: self.tags.clone(),
            vni: self.vni,
        }
    }
}

/// A route that cannot be parsed is dropped; the rest of its batch is
/// still processed.
#[derive(Debug, Error)]
pub enum RoutePayloadError {
    #[error("unparseable prefix {0:?}")]
    Prefix(String),

    #[error("unparseable next hop {0:?}")]
    NextHop(String),
}

/// Wall-clock milliseconds for wire timestamps.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Receives routes the instant they are accepted into (or withdrawn from)
/// the route table. The daemon installs them into the kernel; tests record
/// them. Ingest completes only after the sink returns, so a peer's RPC is
/// acknowledged only once kernel state reflects it.
#[async_trait]
pub trait RouteSink: Send + Sync {
    async fn routes_ingested(&self, routes: &[Route]);
    async fn routes_withdrawn(&self, routes: &[Route]);
}

/// Shared ingest pipeline for routes arriving over any RPC.
pub struct RouteIngestor {
    overlays: Vec<OverlayConfig>,
    table: Arc<RouteTable>,
    sink: Arc<dyn RouteSink>,
}

impl RouteIngestor {
    pub fn new(overlays: Vec<OverlayConfig>, table: Arc<RouteTable>, sink: Arc<dyn RouteSink>) -> Self {
        Self {
            overlays,
            table,
            sink,
        }
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    /// Validate, filter, store, and install a batch of routes from `sender`.
    /// Returns the accepted routes.
    pub async fn ingest(&self, sender: &str, wires: &[proto::Route]) -> Vec<Route> {
        let mut accepted = Vec::with_capacity(wires.len());
        for wire in wires {
            let route = match Route::from_wire(wire, sender) {
                Ok(route) => route,
                Err(err) => {
                    warn!(peer_id = %sender, error = %err, "dropping invalid route");
                    continue;
                }
            };
            match self.overlays.iter().find(|o| o.vni == route.vni) {
                Some(overlay) => {
                    if !routing::should_import(&route, overlay) {
                        debug!(
                            peer_id = %sender,
                            prefix = %route.prefix,
                            vni = route.vni,
                            "route rejected by import policy"
                        );
                        continue;
                    }
                }
                None => {
                    warn!(
                        peer_id = %sender,
                        prefix = %route.prefix,
                        vni = route.vni,
                        "route for unknown vni, installing into fallback table"
                    );
                }
            }
            let route = self.table.add(route);
            accepted.push(route);
        }

        if !accepted.is_empty() {
            self.sink.routes_ingested(&accepted).await;
        }
        accepted
    }

    /// Remove `sender`-owned entries for the listed prefixes. Prefixes owned
    /// by another peer are left untouched. Returns the removed routes.
    pub async fn withdraw(&self, sender: &str, prefixes: &[String]) -> Vec<Route> {
        let mut removed = Vec::new();
        for raw in prefixes {
            let prefix: IpNet = match raw.parse() {
                Ok(prefix) => prefix,
                Err(_) => {
                    warn!(peer_id = %sender, prefix = %raw, "dropping unparseable withdrawal");
                    continue;
                }
            };
            let owned = self
                .table
                .get(&prefix)
                .map(|r| r.peer_id == sender)
                .unwrap_or(false);
            if !owned {
                debug!(peer_id = %sender, prefix = %prefix, "withdrawal refused, not the owner");
                continue;
            }
            if let Some(route) = self.table.remove(&prefix) {
                removed.push(route);
            }
        }

        if !removed.is_empty() {
            self.sink.routes_withdrawn(&removed).await;
        }
        removed
    }
}

/// Leases are stamped relative to ingest time.
pub(crate) fn lease_duration(lease_seconds: u32) -> Duration {
    Duration::from_secs(u64::from(lease_seconds))
}
