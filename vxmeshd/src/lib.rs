//! vxmesh daemon library.
//!
//! The daemon keeps a set of declared VXLAN overlays alive on this host
//! (bridges, tunnel devices, FDB entries, policy rules) and exchanges
//! routes with peer daemons over an authenticated gRPC control plane,
//! installing learned routes into per-overlay kernel tables.

pub mod config;
pub mod controlplane;
pub mod coordinator;
pub mod netlink;
pub mod observability;
pub mod reconciler;
pub mod routing;
