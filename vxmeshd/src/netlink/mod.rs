//! Drivers for the kernel networking objects the daemon owns: bridges,
//! VXLAN devices, FDB entries, routes, and policy rules.
//!
//! All drivers share one rtnetlink connection. Every mutating operation is
//! idempotent: "ensure X" succeeds whether X already existed or not, and
//! deletes treat "not found" as success.

pub mod addr;
pub mod bridge;
pub mod fdb;
pub mod route;
pub mod rule;
pub mod vxlan;

pub use bridge::{BridgeInfo, BridgeManager, BridgeSpec};
pub use fdb::FdbManager;
pub use route::{RouteEntry, RouteManager, RouteSpec, ROUTE_PROTOCOL_VXMESH};
pub use rule::RuleManager;
pub use vxlan::{VxlanInfo, VxlanManager, VxlanSpec};

use futures::TryStreamExt;
use netlink_packet_route::link::{
    InfoData, InfoKind, InfoVxlan, LinkAttribute, LinkFlag, LinkInfo, LinkMessage,
};
use rtnetlink::Handle;
use thiserror::Error;

/// Failure kinds surfaced by the drivers. The reconciler retries
/// [`NetlinkError::Transient`] on its next tick and logs the rest.
#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transient kernel error: {0}")]
    Transient(String),

    #[error("unexpected kernel state: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, NetlinkError>;

/// Classify an rtnetlink failure into the driver error taxonomy.
pub(crate) fn map_err(ctx: impl std::fmt::Display, err: rtnetlink::Error) -> NetlinkError {
    let msg = format!("{ctx}: {err}");
    match &err {
        rtnetlink::Error::NetlinkError(e) => match -e.raw_code() {
            libc::EPERM | libc::EACCES => NetlinkError::PermissionDenied(msg),
            libc::ENOENT | libc::ESRCH | libc::ENODEV | libc::ENXIO => NetlinkError::NotFound(msg),
            libc::EINVAL | libc::EADDRNOTAVAIL | libc::ERANGE | libc::EAFNOSUPPORT => {
                NetlinkError::InvalidArgument(msg)
            }
            libc::EBUSY | libc::EAGAIN | libc::ENOMEM | libc::ENOBUFS | libc::ETIMEDOUT => {
                NetlinkError::Transient(msg)
            }
            _ => NetlinkError::Unexpected(msg),
        },
        rtnetlink::Error::RequestFailed => NetlinkError::Transient(msg),
        _ => NetlinkError::Unexpected(msg),
    }
}

/// True when `err` is the given errno (e.g. `libc::EEXIST`).
pub(crate) fn is_errno(err: &rtnetlink::Error, code: i32) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(e) if e.raw_code() == -code)
}

/// Shared rtnetlink connection. The message pump runs on the runtime; the
/// handle is cheap to clone and is handed to each driver.
pub struct Netlink {
    handle: Handle,
}

impl Netlink {
    /// Open the netlink socket and spawn its connection task.
    pub async fn connect() -> Result<Netlink> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| NetlinkError::Unexpected(format!("netlink socket: {e}")))?;
        tokio::spawn(connection);
        Ok(Netlink { handle })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

/// Look up a link by name. Missing links are `Ok(None)`, not an error.
pub(crate) async fn find_link(handle: &Handle, name: &str) -> Result<Option<LinkMessage>> {
    let mut links = handle
        .link()
        .get()
        .match_name(name.to_string())
        .execute();
    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(err) if is_errno(&err, libc::ENODEV) => Ok(None),
        Err(err) => Err(map_err(format!("get link {name}"), err)),
    }
}

/// Look up a link index by name.
pub(crate) async fn link_index(handle: &Handle, name: &str) -> Result<Option<u32>> {
    Ok(find_link(handle, name).await?.map(|link| link.header.index))
}

pub(crate) fn link_name(link: &LinkMessage) -> Option<&str> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.as_str()),
        _ => None,
    })
}

pub(crate) fn link_mtu(link: &LinkMessage) -> Option<u32> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Mtu(mtu) => Some(*mtu),
        _ => None,
    })
}

pub(crate) fn link_is_up(link: &LinkMessage) -> bool {
    link.header.flags.contains(&LinkFlag::Up)
}

/// Index of the controller (master) device, when enslaved.
pub(crate) fn link_controller(link: &LinkMessage) -> Option<u32> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Controller(index) => Some(*index),
        _ => None,
    })
}

pub(crate) fn link_kind(link: &LinkMessage) -> Option<InfoKind> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::LinkInfo(infos) => infos.iter().find_map(|info| match info {
            LinkInfo::Kind(kind) => Some(kind.clone()),
            _ => None,
        }),
        _ => None,
    })
}

/// VNI of a VXLAN link, if the link carries VXLAN info data.
pub(crate) fn vxlan_vni(link: &LinkMessage) -> Option<u32> {
    vxlan_info(link, |d| match d {
        InfoVxlan::Id(id) => Some(*id),
        _ => None,
    })
}

/// Local tunnel address of a VXLAN link, if one is set.
pub(crate) fn vxlan_local(link: &LinkMessage) -> Option<std::net::IpAddr> {
    vxlan_info(link, |d| match d {
        InfoVxlan::Local(addr) => {
            let octets: [u8; 4] = addr.as_slice().try_into().ok()?;
            Some(std::net::IpAddr::V4(std::net::Ipv4Addr::from(octets)))
        }
        InfoVxlan::Local6(addr) => {
            let octets: [u8; 16] = addr.as_slice().try_into().ok()?;
            Some(std::net::IpAddr::V6(std::net::Ipv6Addr::from(octets)))
        }
        _ => None,
    })
}

fn vxlan_info<T>(link: &LinkMessage, pick: impl Fn(&InfoVxlan) -> Option<T>) -> Option<T> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::LinkInfo(infos) => infos.iter().find_map(|info| match info {
            LinkInfo::Data(InfoData::Vxlan(data)) => data.iter().find_map(&pick),
            _ => None,
        }),
        _ => None,
    })
}
