//! Forwarding-database driver for head-end replication.
//!
//! BUM traffic reaches every remote VTEP through all-zero-MAC FDB entries,
//! one per peer. These are programmed through the `bridge` utility: the
//! netlink neighbour path mishandles appends of duplicate-MAC entries on
//! VXLAN devices, and append semantics are exactly what head-end
//! replication needs.

use std::net::IpAddr;
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{NetlinkError, Result};

/// The flood MAC: entries with this address replicate to their destination.
const ZERO_MAC: &str = "00:00:00:00:00:00";

pub struct FdbManager;

impl FdbManager {
    pub fn new() -> Self {
        Self
    }

    /// Append a flood entry for a remote VTEP. Duplicates are tolerated.
    pub async fn append_peer(&self, vxlan: &str, remote: IpAddr) -> Result<()> {
        let output = run_bridge(&[
            "fdb",
            "append",
            ZERO_MAC,
            "dev",
            vxlan,
            "dst",
            &remote.to_string(),
        ])
        .await?;

        if output.status.success() {
            info!(vxlan = %vxlan, remote = %remote, "fdb peer entry added");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("File exists") {
            debug!(vxlan = %vxlan, remote = %remote, "fdb peer entry already present");
            return Ok(());
        }
        Err(classify_cli_failure(
            format!("bridge fdb append on {vxlan}"),
            &stderr,
        ))
    }

    /// Remove a flood entry. Missing entries are not an error.
    pub async fn delete_peer(&self, vxlan: &str, remote: IpAddr) -> Result<()> {
        let output = run_bridge(&[
            "fdb",
            "del",
            ZERO_MAC,
            "dev",
            vxlan,
            "dst",
            &remote.to_string(),
        ])
        .await?;

        if output.status.success() {
            info!(vxlan = %vxlan, remote = %remote, "fdb peer entry removed");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such") {
            return Ok(());
        }
        Err(classify_cli_failure(
            format!("bridge fdb del on {vxlan}"),
            &stderr,
        ))
    }

    /// Remote VTEP addresses currently present as flood entries.
    pub async fn list_peers(&self, vxlan: &str) -> Result<Vec<IpAddr>> {
        let output = run_bridge(&["fdb", "show", "dev", vxlan]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_cli_failure(
                format!("bridge fdb show on {vxlan}"),
                &stderr,
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_flood_destinations(&stdout))
    }

    /// Converge the flood entries of a device onto `desired`: append the
    /// missing destinations, delete the extra ones.
    pub async fn sync_peers(&self, vxlan: &str, desired: &[IpAddr]) -> Result<()> {
        let current = self.list_peers(vxlan).await?;

        for remote in desired {
            if !current.contains(remote) {
                self.append_peer(vxlan, *remote).await?;
            }
        }

        for remote in &current {
            if !desired.contains(remote) {
                if let Err(err) = self.delete_peer(vxlan, *remote).await {
                    warn!(vxlan = %vxlan, remote = %remote, error = %err, "failed to remove stale fdb entry");
                }
            }
        }

        Ok(())
    }
}

async fn run_bridge(args: &[&str]) -> Result<Output> {
    Command::new("bridge")
        .args(args)
        .output()
        .await
        .map_err(|e| NetlinkError::Unexpected(format!("exec bridge: {e}")))
}

fn classify_cli_failure(ctx: String, stderr: &str) -> NetlinkError {
    let stderr = stderr.trim();
    let msg = format!("{ctx}: {stderr}");
    if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
        NetlinkError::PermissionDenied(msg)
    } else if stderr.contains("No such device") || stderr.contains("does not exist") {
        NetlinkError::NotFound(msg)
    } else if stderr.contains("Invalid") {
        NetlinkError::InvalidArgument(msg)
    } else {
        NetlinkError::Unexpected(msg)
    }
}

/// Pull the `dst` addresses of all-zero-MAC entries out of
/// `bridge fdb show` output.
fn parse_flood_destinations(stdout: &str) -> Vec<IpAddr> {
    let mut peers = Vec::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&ZERO_MAC) {
            continue;
        }
        if let Some(pos) = fields.iter().position(|f| *f == "dst") {
            if let Some(addr) = fields.get(pos + 1).and_then(|a| a.parse::<IpAddr>().ok()) {
                if !peers.contains(&addr) {
                    peers.push(addr);
                }
            }
        }
    }
    peers
}
