//! vxmeshd: distributed VXLAN overlay daemon.
//!
//! This daemon runs on each host of a mesh and:
//! - Reconciles declared overlays into kernel state (bridges, VXLAN
//!   devices, FDB entries, addresses, policy rules)
//! - Serves the route-exchange control plane to its peers
//! - Dials every configured peer, announces local routes, and installs
//!   learned routes into per-overlay routing tables
//! - Withdraws routes whose owner went unhealthy or whose lease expired

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vxmeshd::config::Config;
use vxmeshd::controlplane::client::PeerClient;
use vxmeshd::controlplane::server::{self, ControlPlaneService};
use vxmeshd::controlplane::{tls, RouteIngestor, RouteTable};
use vxmeshd::coordinator::{flush_daemon_routes, Coordinator, KernelInstaller};
use vxmeshd::netlink::{Netlink, RouteManager};
use vxmeshd::reconciler::Reconciler;

/// vxmesh overlay daemon
#[derive(Parser, Debug)]
#[command(name = "vxmeshd", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/vxmesh/vxmesh.yaml")]
    config: PathBuf,

    /// Run a single reconciliation sweep and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vxmeshd=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let mut cfg = match Config::load_file(&args.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(config = %args.config.display(), error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if cfg.node.hostname.is_empty() {
        cfg.node.hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
    }

    info!(
        node_id = %cfg.node.id,
        hostname = %cfg.node.hostname,
        overlay_count = cfg.overlays.len(),
        peer_count = cfg.peers.len(),
        "starting vxmeshd"
    );

    let netlink = match Netlink::connect().await {
        Ok(netlink) => netlink,
        Err(err) => {
            error!(error = %err, "failed to open netlink socket");
            std::process::exit(1);
        }
    };

    let cfg = Arc::new(cfg);
    let reconciler = Arc::new(Reconciler::new(cfg.clone(), &netlink));

    if args.once {
        match reconciler.run_once().await {
            Ok(()) => info!("reconciliation sweep complete"),
            Err(err) => {
                error!(error = %err, "reconciliation sweep failed");
                std::process::exit(1);
            }
        }
        return;
    }

    // Control-plane plumbing: accepted routes flow through the ingest
    // pipeline into the table and, via the installer, into the kernel.
    let table = Arc::new(RouteTable::new());
    let route_mgr = Arc::new(RouteManager::new(netlink.handle()));
    let installer = Arc::new(KernelInstaller::new(route_mgr.clone(), &cfg.overlays));
    let ingestor = Arc::new(RouteIngestor::new(
        cfg.overlays.clone(),
        table.clone(),
        installer,
    ));
    let local_routes = Arc::new(RwLock::new(Vec::new()));

    let cancel = CancellationToken::new();

    let server_tls = match cfg.control_plane.tls.as_ref().filter(|tls| tls.enabled) {
        Some(tls_cfg) => match tls::server_tls(tls_cfg) {
            Ok(tls) => Some(tls),
            Err(err) => {
                error!(error = %err, "failed to load control-plane TLS material");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let listen = SocketAddr::new(cfg.control_plane.listen.address, cfg.control_plane.listen.port);
    let service = ControlPlaneService::new(cfg.node.id.clone(), ingestor.clone(), local_routes.clone());
    let mut server_handle = tokio::spawn(server::serve(
        service,
        listen,
        server_tls,
        cancel.child_token(),
    ));

    let reconciler_task = reconciler.clone();
    let reconciler_token = cancel.child_token();
    let reconciler_handle = tokio::spawn(async move {
        reconciler_task.run(reconciler_token).await;
    });

    let peers = Arc::new(PeerClient::new(&cfg, ingestor.clone()));
    let coordinator = Coordinator::new(
        cfg.clone(),
        table.clone(),
        peers.clone(),
        route_mgr.clone(),
        local_routes.clone(),
        netlink.handle(),
    );

    // Connect out after local state has had a moment to settle, run the
    // initial exchange, then hand over to the coordinator's schedules.
    let control_peers = peers.clone();
    let control_cancel = cancel.child_token();
    let control_handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        if control_cancel.is_cancelled() {
            return;
        }
        control_peers.connect_to_peers().await;

        let local = coordinator.refresh_local_routes().await;
        control_peers.exchange_state_with_peers(&local).await;
        control_peers.spawn_keepalive_streams(&control_cancel);

        coordinator.run(control_cancel).await;
    });

    // Periodic status line from the introspection views.
    let status_peers = peers.clone();
    let status_reconciler = reconciler.clone();
    let status_local = local_routes.clone();
    let status_token = cancel.child_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = status_token.cancelled() => break,
                _ = ticker.tick() => {
                    let statuses = status_peers.peer_statuses().await;
                    let healthy = statuses
                        .iter()
                        .filter(|s| s.state == vxmeshd::observability::PeerState::Healthy)
                        .count();
                    let exported = status_local.read().unwrap().len();
                    let stats = status_peers.route_stats(exported);
                    let rec = status_reconciler.status();
                    info!(
                        peers_healthy = healthy,
                        peers_configured = statuses.len(),
                        routes_exported = stats.exported,
                        routes_installed = stats.installed,
                        last_reconcile_error = rec.last_error.as_deref().unwrap_or(""),
                        "status"
                    );
                }
            }
        }
    });

    info!(listen = %listen, "daemon initialized, waiting for events");

    let mut exit_code = 0;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => warn!("control plane server stopped unexpectedly"),
                Ok(Err(err)) => {
                    error!(error = %err, "control plane server failed");
                    exit_code = 1;
                }
                Err(err) => {
                    error!(error = %err, "control plane server task panicked");
                    exit_code = 1;
                }
            }
        }
    }

    // Shutdown: stop accepting work, drain the server, close peer
    // connections, then flush every daemon-tagged kernel route.
    cancel.cancel();
    if !server_handle.is_finished() {
        let _ = server_handle.await;
    }
    let _ = control_handle.await;
    let _ = reconciler_handle.await;

    peers.disconnect().await;
    flush_daemon_routes(&cfg, &route_mgr).await;

    info!("shutdown complete");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => futures::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
