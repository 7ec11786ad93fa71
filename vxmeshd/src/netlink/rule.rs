//! Policy-rule driver.
//!
//! Overlay bridges whose import policy enables lookup rules get a pair of
//! rules: `iif <bridge> lookup <table>` and `oif <bridge> lookup <table>`
//! at consecutive priorities. Rules are managed through the `ip` utility;
//! the netlink rule path rejects iif/oif selectors.

use tokio::process::Command;
use tracing::{debug, info};

use super::{NetlinkError, Result};

pub struct RuleManager;

impl RuleManager {
    pub fn new() -> Self {
        Self
    }

    /// Ensure the `iif`/`oif` rule pair for a bridge. Already-present rules
    /// are tolerated.
    pub async fn ensure_bridge_rules(
        &self,
        bridge: &str,
        table: u32,
        base_priority: u32,
    ) -> Result<()> {
        self.add_rule("iif", bridge, table, base_priority).await?;
        self.add_rule("oif", bridge, table, base_priority + 1).await?;
        Ok(())
    }

    async fn add_rule(&self, direction: &str, ifname: &str, table: u32, priority: u32) -> Result<()> {
        let table_s = table.to_string();
        let priority_s = priority.to_string();
        let output = run_ip(&[
            "rule", "add", direction, ifname, "lookup", &table_s, "priority", &priority_s,
        ])
        .await?;

        if output.status.success() {
            info!(direction, ifname, table, priority, "policy rule added");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("File exists") {
            debug!(direction, ifname, table, "policy rule already present");
            return Ok(());
        }
        Err(classify(format!("ip rule add {direction} {ifname}"), &stderr))
    }
}

async fn run_ip(args: &[&str]) -> Result<std::process::Output> {
    Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| NetlinkError::Unexpected(format!("exec ip: {e}")))
}

fn classify(ctx: String, stderr: &str) -> NetlinkError {
    let stderr = stderr.trim();
    let msg = format!("{ctx}: {stderr}");
    if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
        NetlinkError::PermissionDenied(msg)
    } else if stderr.contains("No such device") {
        NetlinkError::NotFound(msg)
    } else if stderr.contains("Invalid") {
        NetlinkError::InvalidArgument(msg)
    } else {
        NetlinkError::Unexpected(msg)
    }
}
