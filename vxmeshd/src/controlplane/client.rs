//! gRPC client side of the control plane: one outbound connection per
//! configured peer.
//!
//! Channels are created lazily, so a peer that is down at startup still
//! gets a connection-map entry and is retried transparently by later RPCs.
//! Health is tracked per peer and only healthy peers participate in
//! announcements and withdrawals.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::{debug, info, warn};

use super::{now_millis, Route, RouteIngestor};
use crate::config::{Config, PeerConfig, TlsConfig};
use crate::observability::{PeerState, PeerStatusView, RouteStats};
use vxmesh_api::proto::control_plane_client::ControlPlaneClient as RpcClient;
use vxmesh_api::proto::{KeepaliveRequest, RouteAnnouncement, RouteWithdrawal, StateRequest};

/// Floor for dial establishment.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Health probes are quick exchanges; anything slower counts as down.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const TRANSPORT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const TRANSPORT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

struct PeerConn {
    client: RpcClient<Channel>,
    healthy: bool,
    last_seen: Instant,
}

/// Outbound half of the control plane.
pub struct PeerClient {
    node_id: String,
    peers: Vec<PeerConfig>,
    port: u16,
    tls: Option<TlsConfig>,
    ingestor: std::sync::Arc<RouteIngestor>,
    conns: RwLock<HashMap<String, PeerConn>>,
}

impl PeerClient {
    pub fn new(cfg: &Config, ingestor: std::sync::Arc<RouteIngestor>) -> Self {
        let tls = cfg
            .control_plane
            .tls
            .clone()
            .filter(|tls| tls.enabled);
        Self {
            node_id: cfg.node.id.clone(),
            peers: cfg.peers.clone(),
            port: cfg.control_plane.listen.port,
            tls,
            ingestor,
            conns: RwLock::new(HashMap::new()),
        }
    }

    /// Dial every configured peer. Individual failures are logged and do
    /// not block the rest.
    pub async fn connect_to_peers(&self) {
        for peer in &self.peers {
            if let Err(err) = self.connect_peer(peer).await {
                warn!(
                    peer_id = %peer.id,
                    address = %peer.endpoint.address,
                    error = %err,
                    "failed to set up peer connection"
                );
            }
        }
    }

    async fn connect_peer(&self, peer: &PeerConfig) -> anyhow::Result<()> {
        {
            let conns = self.conns.read().await;
            if conns.contains_key(&peer.id) {
                return Ok(());
            }
        }

        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let host = match peer.endpoint.address {
            IpAddr::V4(addr) => addr.to_string(),
            IpAddr::V6(addr) => format!("[{addr}]"),
        };
        let url = format!("{scheme}://{host}:{}", self.port);

        debug!(peer_id = %peer.id, endpoint = %url, "connecting to peer");
        let mut endpoint = Endpoint::from_shared(url.clone())?
            .connect_timeout(DIAL_TIMEOUT)
            .http2_keep_alive_interval(TRANSPORT_KEEPALIVE_INTERVAL)
            .keep_alive_timeout(TRANSPORT_KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true);
        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(super::tls::client_tls(tls, peer.endpoint.address)?)?;
        }
        let channel = endpoint.connect_lazy();

        let mut conns = self.conns.write().await;
        conns.insert(
            peer.id.clone(),
            PeerConn {
                client: RpcClient::new(channel),
                healthy: true,
                last_seen: Instant::now(),
            },
        );
        info!(peer_id = %peer.id, endpoint = %url, "connected to peer");
        Ok(())
    }

    /// Drop all peer connections.
    pub async fn disconnect(&self) {
        let mut conns = self.conns.write().await;
        conns.clear();
        info!("disconnected from all peers");
    }

    /// Run the full-state exchange against every healthy peer, ingesting
    /// whatever each peer returns.
    pub async fn exchange_state_with_peers(&self, local_routes: &[Route]) {
        let request = StateRequest {
            node_id: self.node_id.clone(),
            routes: local_routes.iter().map(Route::to_wire).collect(),
            timestamp_ms: now_millis(),
        };

        for (peer_id, mut client) in self.healthy_clients().await {
            match client.exchange_state(request.clone()).await {
                Ok(response) => {
                    let resp = response.into_inner();
                    let accepted = self.ingestor.ingest(&resp.node_id, &resp.routes).await;
                    info!(
                        peer_id = %peer_id,
                        routes_sent = request.routes.len(),
                        routes_received = resp.routes.len(),
                        imported = accepted.len(),
                        accepted = resp.accepted,
                        "exchanged state with peer"
                    );
                    self.mark_healthy(&peer_id).await;
                }
                Err(status) => {
                    warn!(peer_id = %peer_id, error = %status, "failed to exchange state with peer");
                    self.mark_unhealthy(&peer_id).await;
                }
            }
        }
    }

    /// Announce routes to every healthy peer. A peer that rejects the
    /// announcement is logged but stays healthy; a transport failure marks
    /// it unhealthy.
    pub async fn announce_routes(&self, routes: &[Route]) {
        let peers = self.healthy_clients().await;
        if peers.is_empty() || routes.is_empty() {
            return;
        }

        let request = RouteAnnouncement {
            node_id: self.node_id.clone(),
            routes: routes.iter().map(Route::to_wire).collect(),
            timestamp_ms: now_millis(),
        };

        for (peer_id, mut client) in peers {
            match client.announce_routes(request.clone()).await {
                Ok(response) => {
                    let ack = response.into_inner();
                    if ack.accepted {
                        debug!(
                            peer_id = %peer_id,
                            route_count = request.routes.len(),
                            "announced routes to peer"
                        );
                        self.mark_healthy(&peer_id).await;
                    } else {
                        warn!(peer_id = %peer_id, error = %ack.error, "peer rejected routes");
                    }
                }
                Err(status) => {
                    warn!(peer_id = %peer_id, error = %status, "failed to announce routes to peer");
                    self.mark_unhealthy(&peer_id).await;
                }
            }
        }
    }

    /// Withdraw prefixes from every healthy peer.
    pub async fn withdraw_routes(&self, prefixes: &[IpNet]) {
        let peers = self.healthy_clients().await;
        if peers.is_empty() || prefixes.is_empty() {
            return;
        }

        let request = RouteWithdrawal {
            node_id: self.node_id.clone(),
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            timestamp_ms: now_millis(),
        };

        for (peer_id, mut client) in peers {
            if let Err(status) = client.withdraw_routes(request.clone()).await {
                warn!(peer_id = %peer_id, error = %status, "failed to withdraw routes from peer");
                self.mark_unhealthy(&peer_id).await;
            }
        }
    }

    /// Probe every peer with an empty state exchange. Returns the ids of
    /// peers that transitioned healthy -> unhealthy in this round.
    pub async fn check_peer_health(&self) -> Vec<String> {
        let peers: Vec<(String, RpcClient<Channel>)> = {
            let conns = self.conns.read().await;
            conns
                .iter()
                .map(|(id, conn)| (id.clone(), conn.client.clone()))
                .collect()
        };

        let request = StateRequest {
            node_id: self.node_id.clone(),
            routes: Vec::new(),
            timestamp_ms: now_millis(),
        };

        let mut transitioned = Vec::new();
        for (peer_id, mut client) in peers {
            let outcome = timeout(HEALTH_PROBE_TIMEOUT, client.exchange_state(request.clone())).await;
            let mut conns = self.conns.write().await;
            let Some(conn) = conns.get_mut(&peer_id) else {
                continue;
            };
            match outcome {
                Ok(Ok(_)) => {
                    conn.healthy = true;
                    conn.last_seen = Instant::now();
                }
                Ok(Err(status)) if status.code() == Code::Unavailable => {
                    if conn.healthy {
                        warn!(peer_id = %peer_id, error = %status, "peer unreachable");
                        conn.healthy = false;
                        transitioned.push(peer_id.clone());
                    }
                }
                Ok(Err(status)) => {
                    debug!(peer_id = %peer_id, error = %status, "health probe error");
                }
                Err(_) => {
                    if conn.healthy {
                        warn!(peer_id = %peer_id, "health probe timed out");
                        conn.healthy = false;
                        transitioned.push(peer_id.clone());
                    }
                }
            }
        }
        transitioned
    }

    /// True when at least one peer is healthy.
    pub async fn is_healthy(&self) -> bool {
        self.conns.read().await.values().any(|conn| conn.healthy)
    }

    /// Launch one keepalive stream per peer, each sending
    /// sequence-numbered pings at the peer's configured interval. Replies
    /// refresh `last_seen` (and recover an unhealthy peer); silence for
    /// `dead_after` tears the stream down for re-establishment. Down
    /// transitions are left to the health probe, which is the single
    /// authority the coordinator acts on.
    pub fn spawn_keepalive_streams(self: &std::sync::Arc<Self>, cancel: &CancellationToken) {
        for peer in self.peers.clone() {
            let client = self.clone();
            let token = cancel.child_token();
            tokio::spawn(async move {
                client.run_keepalive(peer, token).await;
            });
        }
    }

    async fn run_keepalive(&self, peer: PeerConfig, cancel: CancellationToken) {
        let interval = peer.health.keepalive_interval();
        let dead_after = peer.health.dead_after();

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let Some(mut client) = self.client_for(&peer.id).await else {
                // Not dialed yet; try again after an interval.
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => continue,
                }
            };

            let (tx, rx) = mpsc::channel::<KeepaliveRequest>(8);
            let node_id = self.node_id.clone();
            let sender_cancel = cancel.child_token();
            let sender = tokio::spawn(async move {
                let mut sequence: u64 = 0;
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = sender_cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            sequence += 1;
                            let req = KeepaliveRequest {
                                node_id: node_id.clone(),
                                sequence,
                                timestamp_ms: now_millis(),
                            };
                            if tx.send(req).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });

            match client.keepalive(ReceiverStream::new(rx)).await {
                Ok(response) => {
                    let mut inbound = response.into_inner();
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                sender.abort();
                                return;
                            }
                            reply = timeout(dead_after, inbound.next()) => match reply {
                                Ok(Some(Ok(resp))) => {
                                    debug!(
                                        peer_id = %peer.id,
                                        sequence = resp.sequence,
                                        "keepalive reply"
                                    );
                                    self.mark_healthy(&peer.id).await;
                                }
                                Ok(Some(Err(status))) => {
                                    debug!(peer_id = %peer.id, error = %status, "keepalive stream error");
                                    break;
                                }
                                Ok(None) => break,
                                Err(_) => {
                                    warn!(peer_id = %peer.id, "no keepalive reply within dead-after window");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(status) => {
                    debug!(peer_id = %peer.id, error = %status, "keepalive stream rejected");
                }
            }
            sender.abort();

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Connection status of every configured peer, including never-dialed
    /// ones.
    pub async fn peer_statuses(&self) -> Vec<PeerStatusView> {
        let conns = self.conns.read().await;
        let counts = self.ingestor.table().count_by_peer();

        self.peers
            .iter()
            .map(|peer| {
                let (state, last_seen_ago) = match conns.get(&peer.id) {
                    Some(conn) if conn.healthy => {
                        (PeerState::Healthy, Some(conn.last_seen.elapsed()))
                    }
                    Some(conn) => (PeerState::Unhealthy, Some(conn.last_seen.elapsed())),
                    None => (PeerState::Disconnected, None),
                };
                PeerStatusView {
                    id: peer.id.clone(),
                    endpoint: peer.endpoint.address.to_string(),
                    state,
                    last_seen_ago,
                    routes: counts.get(&peer.id).copied().unwrap_or(0),
                }
            })
            .collect()
    }

    /// Route counters for status reporting.
    pub fn route_stats(&self, exported: usize) -> RouteStats {
        RouteStats {
            exported,
            installed: self.ingestor.table().len(),
        }
    }

    async fn healthy_clients(&self) -> Vec<(String, RpcClient<Channel>)> {
        let conns = self.conns.read().await;
        conns
            .iter()
            .filter(|(_, conn)| conn.healthy)
            .map(|(id, conn)| (id.clone(), conn.client.clone()))
            .collect()
    }

    async fn client_for(&self, peer_id: &str) -> Option<RpcClient<Channel>> {
        let conns = self.conns.read().await;
        conns.get(peer_id).map(|conn| conn.client.clone())
    }

    async fn mark_healthy(&self, peer_id: &str) {
        let mut conns = self.conns.write().await;
        if let Some(conn) = conns.get_mut(peer_id) {
            conn.healthy = true;
            conn.last_seen = Instant::now();
        }
    }

    async fn mark_unhealthy(&self, peer_id: &str) {
        let mut conns = self.conns.write().await;
        if let Some(conn) = conns.get_mut(peer_id) {
            conn.healthy = false;
        }
    }

    /// Address of the first configured peer, used by local-IP detection.
    pub fn first_peer_address(&self) -> Option<IpAddr> {
        self.peers.first().map(|p| p.endpoint.address)
    }
}
