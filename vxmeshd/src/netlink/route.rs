//! Kernel route driver.
//!
//! Every route this daemon installs is stamped with a private protocol
//! value so that listing and flushing can tell the daemon's routes apart
//! from routes owned by the kernel, an administrator, or another routing
//! daemon. Co-resident daemons must not use the same value.

use std::net::IpAddr;

use futures::TryStreamExt;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage, RouteProtocol};
use netlink_packet_route::AddressFamily;
use rtnetlink::{Handle, IpVersion};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{is_errno, map_err, NetlinkError, Result};

/// Protocol tag carried by every vxmesh-installed route.
pub const ROUTE_PROTOCOL_VXMESH: u8 = 99;

/// A route to be installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub table: u32,
    pub metric: u32,
}

/// A route observed in the kernel.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub table: u32,
    pub metric: u32,
    pub protocol: u8,
}

/// Route mutations arrive from the control-plane ingest path and from the
/// lifecycle coordinator concurrently; the internal mutex serializes them
/// against the kernel.
pub struct RouteManager {
    handle: Handle,
    lock: Mutex<()>,
}

impl RouteManager {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            lock: Mutex::new(()),
        }
    }

    /// Install or overwrite a route, tagged with the daemon protocol.
    pub async fn replace(&self, spec: &RouteSpec) -> Result<()> {
        let _guard = self.lock.lock().await;
        match spec.destination {
            IpNet::V4(dest) => {
                let gateway = match spec.gateway {
                    Some(IpAddr::V4(gw)) => Some(gw),
                    Some(IpAddr::V6(gw)) => {
                        return Err(NetlinkError::InvalidArgument(format!(
                            "IPv6 gateway {gw} for IPv4 destination {dest}"
                        )));
                    }
                    None => None,
                };
                let mut request = self
                    .handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(dest.addr(), dest.prefix_len());
                if let Some(gw) = gateway {
                    request = request.gateway(gw);
                }
                stamp(request.message_mut(), spec.table, spec.metric);
                request
                    .replace()
                    .execute()
                    .await
                    .map_err(|e| map_err(format!("replace route {dest}"), e))?;
            }
            IpNet::V6(dest) => {
                let gateway = match spec.gateway {
                    Some(IpAddr::V6(gw)) => Some(gw),
                    Some(IpAddr::V4(gw)) => {
                        return Err(NetlinkError::InvalidArgument(format!(
                            "IPv4 gateway {gw} for IPv6 destination {dest}"
                        )));
                    }
                    None => None,
                };
                let mut request = self
                    .handle
                    .route()
                    .add()
                    .v6()
                    .destination_prefix(dest.addr(), dest.prefix_len());
                if let Some(gw) = gateway {
                    request = request.gateway(gw);
                }
                stamp(request.message_mut(), spec.table, spec.metric);
                request
                    .replace()
                    .execute()
                    .await
                    .map_err(|e| map_err(format!("replace route {dest}"), e))?;
            }
        }
        debug!(
            destination = %spec.destination,
            gateway = ?spec.gateway,
            table = spec.table,
            "route installed"
        );
        Ok(())
    }

    /// Delete a route from a table. Missing routes are not an error.
    pub async fn delete(&self, destination: IpNet, table: u32) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut message = RouteMessage::default();
        message.header.destination_prefix_length = destination.prefix_len();
        message.header.table = table as u8;
        match destination {
            IpNet::V4(dest) => {
                message.header.address_family = AddressFamily::Inet;
                message
                    .attributes
                    .push(RouteAttribute::Destination(RouteAddress::Inet(dest.addr())));
            }
            IpNet::V6(dest) => {
                message.header.address_family = AddressFamily::Inet6;
                message
                    .attributes
                    .push(RouteAttribute::Destination(RouteAddress::Inet6(dest.addr())));
            }
        }

        match self.handle.route().del(message).execute().await {
            Ok(()) => {
                debug!(destination = %destination, table, "route deleted");
                Ok(())
            }
            Err(err) if is_errno(&err, libc::ESRCH) => Ok(()),
            Err(err) => Err(map_err(format!("delete route {destination}"), err)),
        }
    }

    /// All routes in `table` carrying the given protocol tag, both families.
    pub async fn list_by_protocol(&self, table: u32, protocol: u8) -> Result<Vec<RouteEntry>> {
        let mut entries = Vec::new();
        for version in [IpVersion::V4, IpVersion::V6] {
            let mut routes = self.handle.route().get(version).execute();
            loop {
                match routes.try_next().await {
                    Ok(Some(message)) => {
                        if message_table(&message) != table {
                            continue;
                        }
                        if message.header.protocol != RouteProtocol::Other(protocol) {
                            continue;
                        }
                        if let Some(entry) = to_entry(&message, table, protocol) {
                            entries.push(entry);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => return Err(map_err("list routes", err)),
                }
            }
        }
        Ok(entries)
    }

    /// Delete every tagged route in a table. Failures on individual routes
    /// are logged and skipped, never fatal.
    pub async fn flush_by_protocol(&self, table: u32, protocol: u8) -> Result<usize> {
        let entries = self.list_by_protocol(table, protocol).await?;
        let mut removed = 0;
        for entry in entries {
            match self.delete(entry.destination, table).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(destination = %entry.destination, table, error = %err, "failed to flush route");
                }
            }
        }
        if removed > 0 {
            info!(table, removed, "flushed daemon routes");
        }
        Ok(removed)
    }

    /// Converge a table's tagged routes onto `desired`: install missing
    /// routes, replace ones whose gateway or metric changed, delete stale
    /// ones.
    pub async fn sync(&self, table: u32, desired: &[RouteSpec]) -> Result<()> {
        let current = self.list_by_protocol(table, ROUTE_PROTOCOL_VXMESH).await?;

        for spec in desired {
            let existing = current.iter().find(|e| e.destination == spec.destination);
            let changed = match existing {
                Some(e) => e.gateway != spec.gateway || e.metric != spec.metric,
                None => true,
            };
            if changed {
                self.replace(spec).await?;
            }
        }

        for entry in &current {
            if !desired.iter().any(|s| s.destination == entry.destination) {
                if let Err(err) = self.delete(entry.destination, table).await {
                    warn!(destination = %entry.destination, error = %err, "failed to remove stale route");
                }
            }
        }

        Ok(())
    }
}

fn stamp(message: &mut RouteMessage, table: u32, metric: u32) {
    message.header.table = table as u8;
    message.header.protocol = RouteProtocol::Other(ROUTE_PROTOCOL_VXMESH);
    if metric > 0 {
        message.attributes.push(RouteAttribute::Priority(metric));
    }
}

/// Effective table of a route message; large ids live in the Table
/// attribute rather than the header.
fn message_table(message: &RouteMessage) -> u32 {
    message
        .attributes
        .iter()
        .find_map(|attr| match attr {
            RouteAttribute::Table(t) => Some(*t),
            _ => None,
        })
        .unwrap_or(u32::from(message.header.table))
}

fn to_entry(message: &RouteMessage, table: u32, protocol: u8) -> Option<RouteEntry> {
    let prefix_len = message.header.destination_prefix_length;
    let destination = message
        .attributes
        .iter()
        .find_map(|attr| match attr {
            RouteAttribute::Destination(RouteAddress::Inet(addr)) => {
                Ipv4Net::new(*addr, prefix_len).ok().map(IpNet::V4)
            }
            RouteAttribute::Destination(RouteAddress::Inet6(addr)) => {
                Ipv6Net::new(*addr, prefix_len).ok().map(IpNet::V6)
            }
            _ => None,
        })
        .or_else(|| default_destination(message.header.address_family, prefix_len))?;

    let gateway = message.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Gateway(RouteAddress::Inet(addr)) => Some(IpAddr::V4(*addr)),
        RouteAttribute::Gateway(RouteAddress::Inet6(addr)) => Some(IpAddr::V6(*addr)),
        _ => None,
    });

    let metric = message
        .attributes
        .iter()
        .find_map(|attr| match attr {
            RouteAttribute::Priority(p) => Some(*p),
            _ => None,
        })
        .unwrap_or(0);

    Some(RouteEntry {
        destination,
        gateway,
        table,
        metric,
        protocol,
    })
}

/// A dump entry with no Destination attribute is the default route.
fn default_destination(family: AddressFamily, prefix_len: u8) -> Option<IpNet> {
    if prefix_len != 0 {
        return None;
    }
    match family {
        AddressFamily::Inet => Some(IpNet::V4(Ipv4Net::default())),
        AddressFamily::Inet6 => Some(IpNet::V6(Ipv6Net::default())),
        _ => None,
    }
}
