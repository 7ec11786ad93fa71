//! Read-only introspection surfaces.
//!
//! The daemon exposes its peer, route, and reconciler state as plain data
//! for whatever collector sits on top; it owns no HTTP listener or metrics
//! encoding itself.

use std::time::{Duration, SystemTime};

/// Connection state of a configured peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Unhealthy,
    Healthy,
}

/// Point-in-time view of one peer.
#[derive(Debug, Clone)]
pub struct PeerStatusView {
    pub id: String,
    pub endpoint: String,
    pub state: PeerState,
    pub last_seen_ago: Option<Duration>,
    /// Routes currently attributed to this peer.
    pub routes: usize,
}

/// Route counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteStats {
    pub exported: usize,
    pub installed: usize,
}

/// Reconciler progress.
#[derive(Debug, Clone, Default)]
pub struct ReconcilerStatus {
    pub running: bool,
    pub last_run: Option<SystemTime>,
    pub last_error: Option<String>,
}
