//! Interface address queries used when building tunnels and route
//! announcements.

use std::collections::HashMap;
use std::net::IpAddr;

use futures::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::address::{AddressAttribute, AddressMessage, AddressScope};
use netlink_packet_route::link::LinkFlag;
use rtnetlink::Handle;

use super::{map_err, Result};

/// First usable address of a named interface, preferring IPv4 and skipping
/// link-local addresses. `Ok(None)` when the interface is missing or has no
/// usable address.
pub async fn interface_address(handle: &Handle, ifname: &str) -> Result<Option<IpAddr>> {
    let Some(index) = super::link_index(handle, ifname).await? else {
        return Ok(None);
    };

    let mut v6_fallback = None;
    let mut addresses = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute();
    loop {
        match addresses.try_next().await {
            Ok(Some(message)) => {
                if message.header.scope == AddressScope::Link {
                    continue;
                }
                match message_address(&message) {
                    Some(addr @ IpAddr::V4(_)) => return Ok(Some(addr)),
                    Some(addr @ IpAddr::V6(_)) => {
                        if v6_fallback.is_none() {
                            v6_fallback = Some(addr);
                        }
                    }
                    None => {}
                }
            }
            Ok(None) => break,
            Err(err) => return Err(map_err(format!("list addresses of {ifname}"), err)),
        }
    }
    Ok(v6_fallback)
}

/// Address of the first up, non-loopback interface whose subnet contains
/// `peer`. Used to pick the underlay next-hop advertised alongside routes
/// when an overlay has no bridge address of its own.
pub async fn detect_local_ip(handle: &Handle, peer: IpAddr) -> Result<Option<IpAddr>> {
    let mut usable: HashMap<u32, bool> = HashMap::new();
    let mut links = handle.link().get().execute();
    loop {
        match links.try_next().await {
            Ok(Some(link)) => {
                let flags = &link.header.flags;
                let is_usable =
                    flags.contains(&LinkFlag::Up) && !flags.contains(&LinkFlag::Loopback);
                usable.insert(link.header.index, is_usable);
            }
            Ok(None) => break,
            Err(err) => return Err(map_err("list links", err)),
        }
    }

    let mut addresses = handle.address().get().execute();
    loop {
        match addresses.try_next().await {
            Ok(Some(message)) => {
                if message.header.scope == AddressScope::Link {
                    continue;
                }
                if !usable.get(&message.header.index).copied().unwrap_or(false) {
                    continue;
                }
                let Some(addr) = message_address(&message) else {
                    continue;
                };
                let Ok(subnet) = IpNet::new(addr, message.header.prefix_len) else {
                    continue;
                };
                if subnet.contains(&peer) {
                    return Ok(Some(addr));
                }
            }
            Ok(None) => break,
            Err(err) => return Err(map_err("list addresses", err)),
        }
    }
    Ok(None)
}

fn message_address(message: &AddressMessage) -> Option<IpAddr> {
    message.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(addr) => Some(*addr),
        _ => None,
    })
}
