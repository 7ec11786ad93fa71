//! vxmesh CLI: inspect and apply overlay configuration from the command
//! line.
//!
//! The CLI works against the same configuration file and kernel objects as
//! the daemon. `apply` runs a single reconciliation sweep, `status` and
//! `routes` read kernel state directly, `doctor` checks the environment.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};

use vxmeshd::config::Config;
use vxmeshd::netlink::{
    BridgeManager, Netlink, RouteManager, VxlanManager, ROUTE_PROTOCOL_VXMESH,
};
use vxmeshd::reconciler::Reconciler;
use vxmeshd::routing::{self, export_routes_for};

#[derive(Parser)]
#[command(name = "vxmesh")]
#[command(about = "Manage vxmesh VXLAN overlays", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/vxmesh/vxmesh.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the configuration: reconcile bridges, VXLAN devices, FDB
    /// entries, and policy rules once
    Apply {
        /// Show what would be done without touching the kernel
        #[arg(long)]
        dry_run: bool,
    },

    /// Show overlay interfaces, bridges, and configured peers
    Status,

    /// List exported and kernel-installed routes
    Routes,

    /// Check the environment for common problems
    Doctor,
}

#[derive(Tabled)]
struct OverlayRow {
    #[tabled(rename = "VNI")]
    vni: u32,
    #[tabled(rename = "INTERFACE")]
    interface: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "MTU")]
    mtu: String,
    #[tabled(rename = "BRIDGE")]
    bridge: String,
    #[tabled(rename = "BRIDGE-STATE")]
    bridge_state: String,
}

#[derive(Tabled)]
struct PeerRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "ENDPOINT")]
    endpoint: String,
    #[tabled(rename = "KEEPALIVE")]
    keepalive: String,
}

#[derive(Tabled)]
struct ExportRow {
    #[tabled(rename = "VNI")]
    vni: u32,
    #[tabled(rename = "PREFIX")]
    prefix: String,
    #[tabled(rename = "METRIC")]
    metric: u32,
}

#[derive(Tabled)]
struct InstalledRow {
    #[tabled(rename = "TABLE")]
    table: u32,
    #[tabled(rename = "PREFIX")]
    prefix: String,
    #[tabled(rename = "NEXT-HOP")]
    next_hop: String,
    #[tabled(rename = "PEER")]
    peer: String,
    #[tabled(rename = "METRIC")]
    metric: u32,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Apply { dry_run } => apply(&cli.config, dry_run).await,
        Commands::Status => status(&cli.config).await,
        Commands::Routes => routes(&cli.config).await,
        Commands::Doctor => doctor(&cli.config).await,
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    Config::load_file(path).map_err(Into::into)
}

async fn apply(config: &PathBuf, dry_run: bool) -> anyhow::Result<()> {
    let cfg = load_config(config)?;

    println!("Configuration: {}", config.display());
    println!("Node: {}", cfg.node.id);
    println!("Overlays: {}", cfg.overlays.len());
    for overlay in &cfg.overlays {
        println!(
            "  VNI {}: {} (bridge {})",
            overlay.vni, overlay.name, overlay.bridge.name
        );
    }
    println!("Peers: {}", cfg.peers.len());

    if dry_run {
        println!("\nDry run, no changes will be made. Would ensure:");
        for overlay in &cfg.overlays {
            println!("  bridge {}", overlay.bridge.name);
            println!("  vxlan {} (VNI {})", overlay.name, overlay.vni);
        }
        for peer in &cfg.peers {
            println!("  fdb entry for {} ({})", peer.id, peer.endpoint.address);
        }
        return Ok(());
    }

    println!("\nApplying configuration...");
    let netlink = Netlink::connect().await?;
    let reconciler = Reconciler::new(std::sync::Arc::new(cfg), &netlink);
    reconciler.run_once().await?;
    println!("Configuration applied.");
    Ok(())
}

async fn status(config: &PathBuf) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let netlink = Netlink::connect().await?;
    let vxlans = VxlanManager::new(netlink.handle());
    let bridges = BridgeManager::new(netlink.handle());

    println!("Node: {} ({})", cfg.node.id, cfg.node.hostname);
    println!();

    let mut rows = Vec::new();
    for overlay in &cfg.overlays {
        let (state, mtu) = match vxlans.get(&overlay.name).await {
            Ok(info) => (
                if info.up { "up" } else { "down" }.to_string(),
                info.mtu.to_string(),
            ),
            Err(_) => ("missing".to_string(), "-".to_string()),
        };
        let bridge_state = match bridges.get(&overlay.bridge.name).await {
            Ok(info) if info.up => "up".to_string(),
            Ok(_) => "down".to_string(),
            Err(_) => "missing".to_string(),
        };
        rows.push(OverlayRow {
            vni: overlay.vni,
            interface: overlay.name.clone(),
            state,
            mtu,
            bridge: overlay.bridge.name.clone(),
            bridge_state,
        });
    }
    if rows.is_empty() {
        println!("No overlays configured.");
    } else {
        println!("{}", Table::new(rows));
    }

    println!();
    let peer_rows: Vec<PeerRow> = cfg
        .peers
        .iter()
        .map(|peer| PeerRow {
            id: peer.id.clone(),
            endpoint: peer.endpoint.address.to_string(),
            keepalive: format!(
                "{}ms/{}ms",
                peer.health.keepalive_interval_ms, peer.health.dead_after_ms
            ),
        })
        .collect();
    if peer_rows.is_empty() {
        println!("No peers configured.");
    } else {
        println!("{}", Table::new(peer_rows));
    }

    Ok(())
}

async fn routes(config: &PathBuf) -> anyhow::Result<()> {
    let cfg = load_config(config)?;

    println!("Exported routes (announced to peers):");
    let mut exports = Vec::new();
    for overlay in &cfg.overlays {
        for route in export_routes_for(overlay, None) {
            exports.push(ExportRow {
                vni: overlay.vni,
                prefix: route.prefix.to_string(),
                metric: route.metric,
            });
        }
    }
    if exports.is_empty() {
        println!("  (none configured)");
    } else {
        println!("{}", Table::new(exports));
    }

    println!();
    println!("Installed routes (learned from peers):");
    let netlink = Netlink::connect().await?;
    let route_mgr = RouteManager::new(netlink.handle());

    // Resolve next-hops back to peer ids where possible.
    let peer_by_ip: std::collections::HashMap<String, String> = cfg
        .peers
        .iter()
        .map(|p| (p.endpoint.address.to_string(), p.id.clone()))
        .collect();

    let mut tables: Vec<u32> = routing::overlay_tables(&cfg.overlays)
        .values()
        .copied()
        .collect();
    tables.push(routing::FALLBACK_TABLE);
    tables.sort_unstable();
    tables.dedup();

    let mut installed = Vec::new();
    for table in tables {
        for entry in route_mgr
            .list_by_protocol(table, ROUTE_PROTOCOL_VXMESH)
            .await?
        {
            let next_hop = entry
                .gateway
                .map(|gw| gw.to_string())
                .unwrap_or_else(|| "-".to_string());
            let peer = peer_by_ip.get(&next_hop).cloned().unwrap_or_default();
            installed.push(InstalledRow {
                table,
                prefix: entry.destination.to_string(),
                next_hop,
                peer,
                metric: entry.metric,
            });
        }
    }
    if installed.is_empty() {
        println!("  (no routes installed)");
    } else {
        println!("{}", Table::new(installed));
    }

    Ok(())
}

async fn doctor(config: &PathBuf) -> anyhow::Result<()> {
    println!("Running vxmesh diagnostics...");

    let mut passed = 0;
    let mut total = 0;
    let mut check = |name: &str, ok: bool, detail: String| {
        total += 1;
        if ok {
            passed += 1;
            println!("  ok   {name}: {detail}");
        } else {
            println!("  FAIL {name}: {detail}");
        }
    };

    match load_config(config) {
        Ok(cfg) => check(
            "config",
            true,
            format!(
                "{} ({} overlays, {} peers)",
                config.display(),
                cfg.overlays.len(),
                cfg.peers.len()
            ),
        ),
        Err(err) => check("config", false, err.to_string()),
    }

    let is_root = nix::unistd::Uid::effective().is_root();
    check(
        "privileges",
        is_root,
        if is_root {
            "running as root".to_string()
        } else {
            "netlink operations require root".to_string()
        },
    );

    let vxlan_mod = std::path::Path::new("/sys/module/vxlan").exists();
    check(
        "vxlan support",
        vxlan_mod,
        if vxlan_mod {
            "vxlan kernel module loaded".to_string()
        } else {
            "vxlan kernel module not loaded".to_string()
        },
    );

    let bridge_mod = std::path::Path::new("/sys/module/bridge").exists();
    check(
        "bridge support",
        bridge_mod,
        if bridge_mod {
            "bridge kernel module loaded".to_string()
        } else {
            "bridge kernel module not loaded".to_string()
        },
    );

    println!("\n{passed}/{total} checks passed");
    if passed < total {
        anyhow::bail!("some checks failed");
    }
    Ok(())
}
