//! gRPC server side of the control plane.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::{Server as TonicServer, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use super::{now_millis, Route, RouteIngestor, RouteTable};
use vxmesh_api::proto::control_plane_server::{ControlPlane, ControlPlaneServer};
use vxmesh_api::proto::{
    KeepaliveRequest, KeepaliveResponse, PeerHealth, RouteAck, RouteAnnouncement, RouteWithdrawal,
    StateRequest, StateResponse,
};

/// Transport-level liveness, independent of the Keepalive RPC.
const HTTP2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const HTTP2_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// The service implementation behind the four control-plane RPCs.
pub struct ControlPlaneService {
    node_id: String,
    ingestor: Arc<RouteIngestor>,
    table: Arc<RouteTable>,
    local_routes: Arc<RwLock<Vec<Route>>>,
    started_at: Instant,
}

impl ControlPlaneService {
    pub fn new(
        node_id: String,
        ingestor: Arc<RouteIngestor>,
        local_routes: Arc<RwLock<Vec<Route>>>,
    ) -> Self {
        let table = ingestor.table().clone();
        Self {
            node_id,
            ingestor,
            table,
            local_routes,
            started_at: Instant::now(),
        }
    }

    fn exportable_wire_routes(&self) -> Vec<vxmesh_api::proto::Route> {
        self.local_routes
            .read()
            .unwrap()
            .iter()
            .map(Route::to_wire)
            .collect()
    }
}

#[tonic::async_trait]
impl ControlPlane for ControlPlaneService {
    async fn exchange_state(
        &self,
        request: Request<StateRequest>,
    ) -> Result<Response<StateResponse>, Status> {
        let req = request.into_inner();
        if req.node_id.is_empty() {
            return Ok(Response::new(StateResponse {
                node_id: self.node_id.clone(),
                routes: Vec::new(),
                timestamp_ms: now_millis(),
                accepted: false,
            }));
        }

        info!(
            peer_id = %req.node_id,
            route_count = req.routes.len(),
            "received state exchange request"
        );
        let accepted = self.ingestor.ingest(&req.node_id, &req.routes).await;
        debug!(
            peer_id = %req.node_id,
            imported_count = accepted.len(),
            "processed peer routes"
        );

        Ok(Response::new(StateResponse {
            node_id: self.node_id.clone(),
            routes: self.exportable_wire_routes(),
            timestamp_ms: now_millis(),
            accepted: true,
        }))
    }

    async fn announce_routes(
        &self,
        request: Request<RouteAnnouncement>,
    ) -> Result<Response<RouteAck>, Status> {
        let req = request.into_inner();
        if req.node_id.is_empty() {
            return Ok(Response::new(RouteAck {
                accepted: false,
                routes_processed: 0,
                error: "node_id is required".to_string(),
            }));
        }

        debug!(
            peer_id = %req.node_id,
            route_count = req.routes.len(),
            "received route announcement"
        );
        let accepted = self.ingestor.ingest(&req.node_id, &req.routes).await;
        info!(
            peer_id = %req.node_id,
            count = req.routes.len(),
            imported = accepted.len(),
            "processed route announcement"
        );

        Ok(Response::new(RouteAck {
            accepted: true,
            routes_processed: req.routes.len() as u32,
            error: String::new(),
        }))
    }

    async fn withdraw_routes(
        &self,
        request: Request<RouteWithdrawal>,
    ) -> Result<Response<RouteAck>, Status> {
        let req = request.into_inner();
        if req.node_id.is_empty() {
            return Ok(Response::new(RouteAck {
                accepted: false,
                routes_processed: 0,
                error: "node_id is required".to_string(),
            }));
        }

        info!(
            peer_id = %req.node_id,
            prefix_count = req.prefixes.len(),
            "received route withdrawal"
        );
        let removed = self.ingestor.withdraw(&req.node_id, &req.prefixes).await;
        info!(
            peer_id = %req.node_id,
            removed_count = removed.len(),
            "processed route withdrawal"
        );

        Ok(Response::new(RouteAck {
            accepted: true,
            routes_processed: removed.len() as u32,
            error: String::new(),
        }))
    }

    type KeepaliveStream =
        Pin<Box<dyn Stream<Item = Result<KeepaliveResponse, Status>> + Send + 'static>>;

    async fn keepalive(
        &self,
        request: Request<Streaming<KeepaliveRequest>>,
    ) -> Result<Response<Self::KeepaliveStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<KeepaliveResponse, Status>>(64);

        let node_id = self.node_id.clone();
        let table = self.table.clone();
        let started_at = self.started_at;

        tokio::spawn(async move {
            while let Some(result) = inbound.next().await {
                let req = match result {
                    Ok(req) => req,
                    Err(err) => {
                        debug!(error = %err, "keepalive stream error");
                        break;
                    }
                };
                debug!(peer_id = %req.node_id, sequence = req.sequence, "received keepalive");

                let resp = KeepaliveResponse {
                    node_id: node_id.clone(),
                    sequence: req.sequence,
                    timestamp_ms: now_millis(),
                    health: Some(PeerHealth {
                        healthy: true,
                        route_count: table.len() as u32,
                        uptime_seconds: started_at.elapsed().as_secs(),
                    }),
                };
                if tx.send(Ok(resp)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Assemble the tonic router with transport keepalive and optional mTLS.
pub fn router(
    service: ControlPlaneService,
    tls: Option<ServerTlsConfig>,
) -> anyhow::Result<Router> {
    let mut builder = TonicServer::builder()
        .http2_keepalive_interval(Some(HTTP2_KEEPALIVE_INTERVAL))
        .http2_keepalive_timeout(Some(HTTP2_KEEPALIVE_TIMEOUT));
    if let Some(tls) = tls {
        builder = builder.tls_config(tls)?;
    }
    Ok(builder.add_service(ControlPlaneServer::new(service)))
}

/// Serve the control plane until cancellation, draining in-flight RPCs on
/// shutdown. Returns once the listener closes; a failure to bind is an
/// error the daemon treats as fatal.
pub async fn serve(
    service: ControlPlaneService,
    listen: SocketAddr,
    tls: Option<ServerTlsConfig>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!(address = %listen, "control plane server starting");
    router(service, tls)?
        .serve_with_shutdown(listen, async move {
            cancel.cancelled().await;
            info!("control plane server stopping");
        })
        .await
        .map_err(|err| {
            warn!(error = %err, "control plane server failed");
            err.into()
        })
}
