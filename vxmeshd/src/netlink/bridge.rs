//! Linux bridge driver.

use std::net::IpAddr;

use futures::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::link::InfoKind;
use rtnetlink::Handle;
use tracing::{debug, info};

use super::{find_link, is_errno, link_controller, link_is_up, link_kind, link_mtu, link_name, map_err, NetlinkError, Result};

/// Desired state of a bridge. `stp: None` leaves the bridge's STP setting
/// alone (unmanaged bridges keep whatever the administrator chose).
#[derive(Debug, Clone)]
pub struct BridgeSpec {
    pub name: String,
    pub mtu: u32,
    pub stp: Option<bool>,
}

/// Observed state of a bridge.
#[derive(Debug, Clone)]
pub struct BridgeInfo {
    pub name: String,
    pub index: u32,
    pub mtu: u32,
    pub up: bool,
    pub attached_interfaces: Vec<String>,
}

pub struct BridgeManager {
    handle: Handle,
}

impl BridgeManager {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Ensure a bridge exists with the given parameters and is up.
    ///
    /// An existing link of a different kind under the same name is removed
    /// and recreated as a bridge.
    pub async fn ensure(&self, spec: &BridgeSpec) -> Result<()> {
        if let Some(link) = find_link(&self.handle, &spec.name).await? {
            if matches!(link_kind(&link), Some(InfoKind::Bridge)) {
                if link_mtu(&link) != Some(spec.mtu) {
                    self.handle
                        .link()
                        .set(link.header.index)
                        .mtu(spec.mtu)
                        .execute()
                        .await
                        .map_err(|e| map_err(format!("set mtu on bridge {}", spec.name), e))?;
                }
                if !link_is_up(&link) {
                    self.set_up(link.header.index, &spec.name).await?;
                }
                set_stp(&spec.name, spec.stp).await;
                return Ok(());
            }
            info!(
                name = %spec.name,
                "existing link is not a bridge, recreating"
            );
            self.handle
                .link()
                .del(link.header.index)
                .execute()
                .await
                .map_err(|e| map_err(format!("delete link {}", spec.name), e))?;
        }

        debug!(name = %spec.name, mtu = spec.mtu, "creating bridge");
        match self
            .handle
            .link()
            .add()
            .bridge(spec.name.clone())
            .execute()
            .await
        {
            Ok(()) => {}
            Err(err) if is_errno(&err, libc::EEXIST) => {
                debug!(name = %spec.name, "bridge already exists");
            }
            Err(err) => return Err(map_err(format!("create bridge {}", spec.name), err)),
        }

        let index = super::link_index(&self.handle, &spec.name)
            .await?
            .ok_or_else(|| {
                NetlinkError::Unexpected(format!("bridge {} missing after create", spec.name))
            })?;
        self.handle
            .link()
            .set(index)
            .mtu(spec.mtu)
            .execute()
            .await
            .map_err(|e| map_err(format!("set mtu on bridge {}", spec.name), e))?;
        self.set_up(index, &spec.name).await?;
        set_stp(&spec.name, spec.stp).await;
        Ok(())
    }

    /// Add an address to a bridge. Already-present addresses are fine.
    pub async fn add_address(&self, name: &str, cidr: IpNet) -> Result<()> {
        let index = super::link_index(&self.handle, name)
            .await?
            .ok_or_else(|| NetlinkError::NotFound(format!("bridge {name}")))?;

        let (addr, prefix_len): (IpAddr, u8) = (cidr.addr(), cidr.prefix_len());
        match self
            .handle
            .address()
            .add(index, addr, prefix_len)
            .execute()
            .await
        {
            Ok(()) => {
                info!(bridge = %name, address = %cidr, "address added to bridge");
                Ok(())
            }
            Err(err) if is_errno(&err, libc::EEXIST) => {
                debug!(bridge = %name, address = %cidr, "address already present");
                Ok(())
            }
            Err(err) => Err(map_err(format!("add address {cidr} to {name}"), err)),
        }
    }

    /// Observed bridge state, including enslaved interfaces.
    pub async fn get(&self, name: &str) -> Result<BridgeInfo> {
        let link = find_link(&self.handle, name)
            .await?
            .ok_or_else(|| NetlinkError::NotFound(format!("bridge {name}")))?;
        if !matches!(link_kind(&link), Some(InfoKind::Bridge)) {
            return Err(NetlinkError::Unexpected(format!("{name} is not a bridge")));
        }
        let index = link.header.index;

        let mut attached = Vec::new();
        let mut links = self.handle.link().get().execute();
        loop {
            match links.try_next().await {
                Ok(Some(other)) => {
                    if link_controller(&other) == Some(index) {
                        if let Some(other_name) = link_name(&other) {
                            attached.push(other_name.to_string());
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => return Err(map_err("list links", err)),
            }
        }

        Ok(BridgeInfo {
            name: name.to_string(),
            index,
            mtu: link_mtu(&link).unwrap_or(0),
            up: link_is_up(&link),
            attached_interfaces: attached,
        })
    }

    /// Remove a bridge. Missing bridges are not an error.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let Some(index) = super::link_index(&self.handle, name).await? else {
            return Ok(());
        };
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| map_err(format!("delete bridge {name}"), e))
    }

    async fn set_up(&self, index: u32, name: &str) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| map_err(format!("bring up bridge {name}"), e))
    }
}

/// STP is a sysfs knob, not a netlink attribute. Failures are logged and
/// tolerated; a bridge without STP still forwards.
async fn set_stp(name: &str, stp: Option<bool>) {
    let Some(stp) = stp else {
        return;
    };
    let path = format!("/sys/class/net/{name}/bridge/stp_state");
    let value = if stp { "1" } else { "0" };
    match tokio::fs::read_to_string(&path).await {
        Ok(current) if current.trim() == value => {}
        _ => {
            if let Err(err) = tokio::fs::write(&path, value).await {
                debug!(bridge = %name, error = %err, "could not set stp state");
            }
        }
    }
}
