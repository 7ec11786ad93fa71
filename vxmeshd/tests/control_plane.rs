//! Loopback integration tests for the route-exchange control plane.
//!
//! Two in-process "nodes" talk over 127.0.0.1: a real gRPC server per node
//! and the outbound peer client of the other. No kernel access; route
//! installation is observed through a recording sink.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use vxmesh_api::proto::control_plane_client::ControlPlaneClient;
use vxmesh_api::proto::{KeepaliveRequest, Route as WireRoute, RouteAnnouncement, StateRequest};
use vxmeshd::config::Config;
use vxmeshd::controlplane::client::PeerClient;
use vxmeshd::controlplane::server::{router, ControlPlaneService};
use vxmeshd::controlplane::{Route, RouteIngestor, RouteSink, RouteTable};
use vxmeshd::routing::export_routes_for;

#[derive(Default)]
struct RecordingSink {
    installed: Mutex<Vec<Route>>,
    withdrawn: Mutex<Vec<Route>>,
}

impl RecordingSink {
    fn installed_prefixes(&self) -> Vec<String> {
        self.installed
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prefix.to_string())
            .collect()
    }

    fn withdrawn_prefixes(&self) -> Vec<String> {
        self.withdrawn
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prefix.to_string())
            .collect()
    }
}

#[async_trait]
impl RouteSink for RecordingSink {
    async fn routes_ingested(&self, routes: &[Route]) {
        self.installed.lock().unwrap().extend_from_slice(routes);
    }

    async fn routes_withdrawn(&self, routes: &[Route]) {
        self.withdrawn.lock().unwrap().extend_from_slice(routes);
    }
}

struct TestNode {
    addr: SocketAddr,
    table: Arc<RouteTable>,
    sink: Arc<RecordingSink>,
    cancel: CancellationToken,
}

fn node_config(node_id: &str, bridge_ip: &str, export: &str, import: &str) -> Config {
    Config::load_str(&format!(
        r#"
version: 2
node:
  id: {node_id}
overlays:
  - vni: 100
    name: vxlan100
    bridge:
      name: br-prod
      ipv4: {bridge_ip}
    routing:
      export:
        networks: [{export}]
      import:
{import}
"#
    ))
    .unwrap()
}

/// Start a control-plane server for `cfg` on an ephemeral loopback port.
async fn start_node(cfg: &Config) -> TestNode {
    let table = Arc::new(RouteTable::new());
    let sink = Arc::new(RecordingSink::default());
    let ingestor = Arc::new(RouteIngestor::new(
        cfg.overlays.clone(),
        table.clone(),
        sink.clone(),
    ));

    let mut local = Vec::new();
    for overlay in &cfg.overlays {
        local.extend(export_routes_for(overlay, None));
    }
    let local_routes = Arc::new(RwLock::new(local));

    let service = ControlPlaneService::new(cfg.node.id.clone(), ingestor, local_routes);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();

    let server = router(service, None).unwrap();
    tokio::spawn(async move {
        server
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
            .await
            .unwrap();
    });

    TestNode {
        addr,
        table,
        sink,
        cancel,
    }
}

/// Build the outbound side of a node, pointed at one peer server.
fn peer_client(
    node_id: &str,
    peer_id: &str,
    peer_port: u16,
    import: &str,
) -> (Arc<PeerClient>, Arc<RouteTable>, Arc<RecordingSink>) {
    let cfg = Config::load_str(&format!(
        r#"
version: 2
node:
  id: {node_id}
overlays:
  - vni: 100
    name: vxlan100
    bridge:
      name: br-prod
      ipv4: 10.100.0.1/24
    routing:
      export:
        networks: [172.16.10.0/24]
      import:
{import}
peers:
  - id: {peer_id}
    endpoint:
      address: 127.0.0.1
control_plane:
  listen:
    port: {peer_port}
"#
    ))
    .unwrap();

    let table = Arc::new(RouteTable::new());
    let sink = Arc::new(RecordingSink::default());
    let ingestor = Arc::new(RouteIngestor::new(
        cfg.overlays.clone(),
        table.clone(),
        sink.clone(),
    ));
    (
        Arc::new(PeerClient::new(&cfg, ingestor)),
        table,
        sink,
    )
}

fn wire_route(prefix: &str, next_hop: &str, vni: u32) -> WireRoute {
    WireRoute {
        prefix: prefix.to_string(),
        next_hop: next_hop.to_string(),
        metric: 100,
        lease_seconds: 30,
        tags: Vec::new(),
        vni,
    }
}

const ACCEPT_ALL: &str = "        accept_all: true";

#[tokio::test]
async fn state_exchange_flows_both_ways() {
    // Node B exports 172.16.20.0/24 from its overlay config.
    let cfg_b = node_config("node-b", "10.100.0.2/24", "172.16.20.0/24", ACCEPT_ALL);
    let node_b = start_node(&cfg_b).await;

    let (client_a, table_a, sink_a) =
        peer_client("node-a", "node-b", node_b.addr.port(), ACCEPT_ALL);
    client_a.connect_to_peers().await;

    // Node A's export set, as the coordinator would compute it.
    let cfg_a = node_config("node-a", "10.100.0.1/24", "172.16.10.0/24", ACCEPT_ALL);
    let local_a = export_routes_for(&cfg_a.overlays[0], None);
    client_a.exchange_state_with_peers(&local_a).await;

    // B learned A's route, attributed to node-a, and its sink ran.
    let prefix_a = "172.16.10.0/24".parse().unwrap();
    let learned_by_b = node_b.table.get(&prefix_a).expect("node-b should learn A's route");
    assert_eq!(learned_by_b.peer_id, "node-a");
    assert_eq!(learned_by_b.next_hop, Some("10.100.0.1".parse().unwrap()));
    assert!(learned_by_b.expires_at.is_some());
    assert_eq!(node_b.sink.installed_prefixes(), vec!["172.16.10.0/24"]);

    // A ingested B's reply symmetrically.
    let prefix_b = "172.16.20.0/24".parse().unwrap();
    let learned_by_a = table_a.get(&prefix_b).expect("node-a should learn B's route");
    assert_eq!(learned_by_a.peer_id, "node-b");
    assert_eq!(sink_a.installed_prefixes(), vec!["172.16.20.0/24"]);

    node_b.cancel.cancel();
}

#[tokio::test]
async fn announce_ingests_and_acknowledges() {
    let cfg_b = node_config("node-b", "10.100.0.2/24", "172.16.20.0/24", ACCEPT_ALL);
    let node_b = start_node(&cfg_b).await;

    let mut client = ControlPlaneClient::connect(format!("http://{}", node_b.addr))
        .await
        .unwrap();
    let ack = client
        .announce_routes(RouteAnnouncement {
            node_id: "node-a".to_string(),
            routes: vec![
                wire_route("172.16.10.0/24", "10.100.0.1", 100),
                wire_route("172.16.11.0/24", "10.100.0.1", 100),
            ],
            timestamp_ms: 0,
        })
        .await
        .unwrap()
        .into_inner();

    assert!(ack.accepted);
    assert_eq!(ack.routes_processed, 2);
    assert_eq!(node_b.table.len(), 2);

    // The install callback completed before the ack was sent.
    let mut installed = node_b.sink.installed_prefixes();
    installed.sort();
    assert_eq!(installed, vec!["172.16.10.0/24", "172.16.11.0/24"]);

    node_b.cancel.cancel();
}

#[tokio::test]
async fn withdrawal_is_scoped_to_the_owner() {
    let cfg_b = node_config("node-b", "10.100.0.2/24", "172.16.20.0/24", ACCEPT_ALL);
    let node_b = start_node(&cfg_b).await;

    let mut client = ControlPlaneClient::connect(format!("http://{}", node_b.addr))
        .await
        .unwrap();

    // Seed a route owned by node-c.
    client
        .announce_routes(RouteAnnouncement {
            node_id: "node-c".to_string(),
            routes: vec![wire_route("172.16.30.0/24", "10.100.0.3", 100)],
            timestamp_ms: 0,
        })
        .await
        .unwrap();

    // node-a may not withdraw node-c's prefix.
    let ack = client
        .withdraw_routes(vxmesh_api::proto::RouteWithdrawal {
            node_id: "node-a".to_string(),
            prefixes: vec!["172.16.30.0/24".to_string()],
            timestamp_ms: 0,
        })
        .await
        .unwrap()
        .into_inner();
    assert!(ack.accepted);
    assert_eq!(ack.routes_processed, 0);
    let prefix = "172.16.30.0/24".parse().unwrap();
    assert_eq!(node_b.table.get(&prefix).unwrap().peer_id, "node-c");
    assert!(node_b.sink.withdrawn_prefixes().is_empty());

    // The owner can.
    let ack = client
        .withdraw_routes(vxmesh_api::proto::RouteWithdrawal {
            node_id: "node-c".to_string(),
            prefixes: vec!["172.16.30.0/24".to_string()],
            timestamp_ms: 0,
        })
        .await
        .unwrap()
        .into_inner();
    assert!(ack.accepted);
    assert_eq!(ack.routes_processed, 1);
    assert!(node_b.table.get(&prefix).is_none());
    assert_eq!(node_b.sink.withdrawn_prefixes(), vec!["172.16.30.0/24"]);

    node_b.cancel.cancel();
}

#[tokio::test]
async fn deny_wins_even_with_accept_all() {
    let import = "        accept_all: true\n        deny: [0.0.0.0/0]";
    let cfg_b = node_config("node-b", "10.100.0.2/24", "172.16.20.0/24", import);
    let node_b = start_node(&cfg_b).await;

    let mut client = ControlPlaneClient::connect(format!("http://{}", node_b.addr))
        .await
        .unwrap();
    let ack = client
        .announce_routes(RouteAnnouncement {
            node_id: "node-x".to_string(),
            routes: vec![wire_route("10.0.0.0/8", "10.100.0.9", 100)],
            timestamp_ms: 0,
        })
        .await
        .unwrap()
        .into_inner();

    assert!(ack.accepted);
    assert!(node_b.table.is_empty());
    assert!(node_b.sink.installed_prefixes().is_empty());

    node_b.cancel.cancel();
}

#[tokio::test]
async fn invalid_routes_are_dropped_from_a_batch() {
    let cfg_b = node_config("node-b", "10.100.0.2/24", "172.16.20.0/24", ACCEPT_ALL);
    let node_b = start_node(&cfg_b).await;

    let mut client = ControlPlaneClient::connect(format!("http://{}", node_b.addr))
        .await
        .unwrap();
    let ack = client
        .announce_routes(RouteAnnouncement {
            node_id: "node-a".to_string(),
            routes: vec![
                wire_route("not-a-prefix", "10.100.0.1", 100),
                wire_route("172.16.10.0/24", "bad-hop", 100),
                wire_route("172.16.11.0/24", "10.100.0.1", 100),
            ],
            timestamp_ms: 0,
        })
        .await
        .unwrap()
        .into_inner();

    assert!(ack.accepted);
    assert_eq!(node_b.table.len(), 1);
    assert_eq!(node_b.sink.installed_prefixes(), vec!["172.16.11.0/24"]);

    node_b.cancel.cancel();
}

#[tokio::test]
async fn empty_node_id_gets_a_typed_rejection() {
    let cfg_b = node_config("node-b", "10.100.0.2/24", "172.16.20.0/24", ACCEPT_ALL);
    let node_b = start_node(&cfg_b).await;

    let mut client = ControlPlaneClient::connect(format!("http://{}", node_b.addr))
        .await
        .unwrap();

    let resp = client
        .exchange_state(StateRequest {
            node_id: String::new(),
            routes: Vec::new(),
            timestamp_ms: 0,
        })
        .await
        .unwrap()
        .into_inner();
    assert!(!resp.accepted);

    let ack = client
        .announce_routes(RouteAnnouncement {
            node_id: String::new(),
            routes: vec![wire_route("172.16.10.0/24", "10.100.0.1", 100)],
            timestamp_ms: 0,
        })
        .await
        .unwrap()
        .into_inner();
    assert!(!ack.accepted);
    assert!(node_b.table.is_empty());

    node_b.cancel.cancel();
}

#[tokio::test]
async fn keepalive_echoes_sequences_with_health() {
    let cfg_b = node_config("node-b", "10.100.0.2/24", "172.16.20.0/24", ACCEPT_ALL);
    let node_b = start_node(&cfg_b).await;

    let mut client = ControlPlaneClient::connect(format!("http://{}", node_b.addr))
        .await
        .unwrap();

    let requests = tokio_stream::iter((1..=3u64).map(|sequence| KeepaliveRequest {
        node_id: "node-a".to_string(),
        sequence,
        timestamp_ms: 0,
    }));
    let mut replies = client.keepalive(requests).await.unwrap().into_inner();

    for expected in 1..=3u64 {
        let reply = replies.next().await.unwrap().unwrap();
        assert_eq!(reply.sequence, expected);
        assert_eq!(reply.node_id, "node-b");
        let health = reply.health.unwrap();
        assert!(health.healthy);
    }

    node_b.cancel.cancel();
}

#[tokio::test]
async fn health_check_reports_only_the_transition_round() {
    let cfg_b = node_config("node-b", "10.100.0.2/24", "172.16.20.0/24", ACCEPT_ALL);
    let node_b = start_node(&cfg_b).await;

    let (client_a, _table_a, _sink_a) =
        peer_client("node-a", "node-b", node_b.addr.port(), ACCEPT_ALL);
    client_a.connect_to_peers().await;

    // Healthy peer: no transitions.
    assert!(client_a.check_peer_health().await.is_empty());
    assert!(client_a.is_healthy().await);

    // Take node B down; the next probe flips it, exactly once.
    node_b.cancel.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let transitioned = client_a.check_peer_health().await;
    assert_eq!(transitioned, vec!["node-b".to_string()]);
    assert!(!client_a.is_healthy().await);

    assert!(client_a.check_peer_health().await.is_empty());
}

#[tokio::test]
async fn recovered_peer_turns_healthy_again() {
    // Serve, kill, then re-serve on the same port to simulate recovery.
    let cfg_b = node_config("node-b", "10.100.0.2/24", "172.16.20.0/24", ACCEPT_ALL);
    let node_b = start_node(&cfg_b).await;
    let port = node_b.addr.port();

    let (client_a, _table_a, _sink_a) = peer_client("node-a", "node-b", port, ACCEPT_ALL);
    client_a.connect_to_peers().await;

    node_b.cancel.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(client_a.check_peer_health().await.len(), 1);

    // Bring a fresh server up on the same port.
    let table = Arc::new(RouteTable::new());
    let sink = Arc::new(RecordingSink::default());
    let ingestor = Arc::new(RouteIngestor::new(cfg_b.overlays.clone(), table, sink));
    let service = ControlPlaneService::new(
        "node-b".to_string(),
        ingestor,
        Arc::new(RwLock::new(Vec::new())),
    );
    let listener = loop {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => break listener,
            Err(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
        }
    };
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let server = router(service, None).unwrap();
    tokio::spawn(async move {
        let _ = server
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
            .await;
    });

    // The probe sees the peer again and health flips back without a
    // transition being reported (transitions are down-edges only).
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(client_a.check_peer_health().await.is_empty());
    assert!(client_a.is_healthy().await);

    cancel.cancel();
}
