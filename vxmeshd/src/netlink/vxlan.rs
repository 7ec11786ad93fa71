//! VXLAN tunnel endpoint driver.

use std::net::IpAddr;

use netlink_packet_route::link::InfoKind;
use rtnetlink::Handle;
use tracing::{debug, info};

use super::{find_link, is_errno, link_controller, link_is_up, link_kind, map_err, vxlan_local, vxlan_vni, NetlinkError, Result};

/// Desired state of a VXLAN device.
#[derive(Debug, Clone)]
pub struct VxlanSpec {
    pub name: String,
    pub vni: u32,
    pub dst_port: u16,
    /// Local tunnel address. When absent the kernel picks a source address
    /// per encapsulated packet.
    pub local: Option<IpAddr>,
    pub mtu: u32,
    pub learning: bool,
    /// Bridge the device is enslaved to.
    pub bridge: String,
    /// Multicast group for BUM delivery; exclusive with head-end
    /// replication over FDB entries.
    pub group: Option<IpAddr>,
    /// Underlay device the tunnel is bound to.
    pub underlay_index: Option<u32>,
}

/// Observed state of a VXLAN device.
#[derive(Debug, Clone)]
pub struct VxlanInfo {
    pub name: String,
    pub index: u32,
    pub vni: u32,
    pub mtu: u32,
    pub up: bool,
}

pub struct VxlanManager {
    handle: Handle,
}

impl VxlanManager {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Ensure a VXLAN device exists per `spec`, is up, and is enslaved to
    /// its bridge.
    ///
    /// A device with the same name but a different VNI or local address
    /// (or a different link kind entirely) is deleted and recreated; the
    /// kernel cannot retune a VXLAN in place. A device that exists while
    /// the spec carries no local hint is left as-is, so an underlay that
    /// gains its address later replaces the device exactly once.
    pub async fn ensure(&self, spec: &VxlanSpec) -> Result<()> {
        if let Some(link) = find_link(&self.handle, &spec.name).await? {
            let local_matches = match spec.local {
                None => true,
                Some(want) => vxlan_local(&link) == Some(want),
            };
            let is_match = matches!(link_kind(&link), Some(InfoKind::Vxlan))
                && vxlan_vni(&link) == Some(spec.vni)
                && local_matches;
            if is_match {
                if !link_is_up(&link) {
                    self.set_up(link.header.index, &spec.name).await?;
                }
                self.ensure_enslaved(link.header.index, &link, spec).await?;
                return Ok(());
            }
            info!(
                name = %spec.name,
                vni = spec.vni,
                "existing link does not match, recreating"
            );
            self.handle
                .link()
                .del(link.header.index)
                .execute()
                .await
                .map_err(|e| map_err(format!("delete link {}", spec.name), e))?;
        }

        debug!(
            name = %spec.name,
            vni = spec.vni,
            port = spec.dst_port,
            local = ?spec.local,
            group = ?spec.group,
            "creating vxlan device"
        );
        let mut request = self
            .handle
            .link()
            .add()
            .vxlan(spec.name.clone(), spec.vni)
            .port(spec.dst_port)
            .learning(spec.learning);
        if let Some(index) = spec.underlay_index {
            request = request.link(index);
        }
        match spec.local {
            Some(IpAddr::V4(addr)) => request = request.local(addr),
            Some(IpAddr::V6(addr)) => request = request.local6(addr),
            None => {}
        }
        match spec.group {
            Some(IpAddr::V4(addr)) => request = request.group(addr),
            Some(IpAddr::V6(addr)) => request = request.group6(addr),
            None => {}
        }
        match request.execute().await {
            Ok(()) => {}
            Err(err) if is_errno(&err, libc::EEXIST) => {
                debug!(name = %spec.name, "vxlan already exists");
            }
            Err(err) => return Err(map_err(format!("create vxlan {}", spec.name), err)),
        }

        let index = super::link_index(&self.handle, &spec.name)
            .await?
            .ok_or_else(|| {
                NetlinkError::Unexpected(format!("vxlan {} missing after create", spec.name))
            })?;
        self.handle
            .link()
            .set(index)
            .mtu(spec.mtu)
            .execute()
            .await
            .map_err(|e| map_err(format!("set mtu on vxlan {}", spec.name), e))?;
        self.set_up(index, &spec.name).await?;

        let link = find_link(&self.handle, &spec.name).await?.ok_or_else(|| {
            NetlinkError::Unexpected(format!("vxlan {} vanished after create", spec.name))
        })?;
        self.ensure_enslaved(index, &link, spec).await?;
        Ok(())
    }

    /// Observed state of a VXLAN device.
    pub async fn get(&self, name: &str) -> Result<VxlanInfo> {
        let link = find_link(&self.handle, name)
            .await?
            .ok_or_else(|| NetlinkError::NotFound(format!("vxlan {name}")))?;
        if !matches!(link_kind(&link), Some(InfoKind::Vxlan)) {
            return Err(NetlinkError::Unexpected(format!("{name} is not a vxlan device")));
        }
        Ok(VxlanInfo {
            name: name.to_string(),
            index: link.header.index,
            vni: vxlan_vni(&link).unwrap_or(0),
            mtu: super::link_mtu(&link).unwrap_or(0),
            up: link_is_up(&link),
        })
    }

    /// Remove a VXLAN device. Missing devices are not an error.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let Some(index) = super::link_index(&self.handle, name).await? else {
            return Ok(());
        };
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| map_err(format!("delete vxlan {name}"), e))
    }

    async fn ensure_enslaved(
        &self,
        index: u32,
        link: &netlink_packet_route::link::LinkMessage,
        spec: &VxlanSpec,
    ) -> Result<()> {
        let bridge_index = super::link_index(&self.handle, &spec.bridge)
            .await?
            .ok_or_else(|| NetlinkError::NotFound(format!("bridge {}", spec.bridge)))?;
        if link_controller(link) == Some(bridge_index) {
            return Ok(());
        }
        debug!(vxlan = %spec.name, bridge = %spec.bridge, "attaching vxlan to bridge");
        self.handle
            .link()
            .set(index)
            .controller(bridge_index)
            .execute()
            .await
            .map_err(|e| map_err(format!("attach {} to bridge {}", spec.name, spec.bridge), e))
    }

    async fn set_up(&self, index: u32, name: &str) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| map_err(format!("bring up vxlan {name}"), e))
    }
}
