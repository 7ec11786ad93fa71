//! Configuration loading, validation, and schema normalization.
//!
//! Two schema versions are accepted. Version 2 is the native shape with a
//! list of overlays; version 1 carries a single overlay under `overlay.vxlan`
//! and is normalized into the version-2 shape here, so the rest of the
//! daemon only ever sees normalized configuration.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::Deserialize;
use thiserror::Error;

/// Highest routing table id usable without conflicting with the reserved
/// kernel tables (253-255).
const MAX_TABLE_ID: u32 = 252;

/// Linux interface name length limit (IFNAMSIZ - 1).
const MAX_IFNAME_LEN: usize = 15;

/// Configuration errors. All of them are fatal to daemon startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Normalized daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub bridges: Vec<BridgeDef>,
    pub overlays: Vec<OverlayConfig>,
    pub peers: Vec<PeerConfig>,
    pub control_plane: ControlPlaneConfig,
    pub reconcile_interval: Duration,
}

/// Identity of this host.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default)]
    pub hostname: String,
}

/// A Linux bridge this daemon is allowed to create and configure.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeDef {
    pub name: String,
    #[serde(default)]
    pub stp: bool,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub manage: bool,
}

/// One VXLAN overlay network.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    pub vni: u32,
    pub name: String,
    #[serde(default = "default_dstport")]
    pub dstport: u16,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub learning: bool,
    #[serde(default)]
    pub underlay_interface: Option<String>,
    pub bridge: OverlayBridge,
    #[serde(default)]
    pub bum: BumConfig,
    #[serde(default)]
    pub routing: RoutingPolicy,
}

/// The bridge an overlay's VXLAN device is enslaved to.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayBridge {
    pub name: String,
    #[serde(default)]
    pub ipv4: Option<Ipv4Net>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Net>,
}

/// How broadcast/unknown-unicast/multicast traffic is delivered.
#[derive(Debug, Clone, Deserialize)]
pub struct BumConfig {
    #[serde(default)]
    pub mode: BumMode,
    #[serde(default)]
    pub group: Option<IpAddr>,
}

impl Default for BumConfig {
    fn default() -> Self {
        BumConfig {
            mode: BumMode::HeadEndReplication,
            group: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BumMode {
    HeadEndReplication,
    Multicast,
}

impl Default for BumMode {
    fn default() -> Self {
        BumMode::HeadEndReplication
    }
}

/// Route export and import policy of an overlay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub export: ExportPolicy,
    #[serde(default)]
    pub import: ImportPolicy,
}

/// Which prefixes this node announces for an overlay.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportPolicy {
    #[serde(default)]
    pub networks: Vec<IpNet>,
    #[serde(default = "default_metric")]
    pub metric: u32,
}

impl Default for ExportPolicy {
    fn default() -> Self {
        ExportPolicy {
            networks: Vec::new(),
            metric: default_metric(),
        }
    }
}

/// Which prefixes this node accepts from peers, and how they are installed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportPolicy {
    #[serde(default)]
    pub accept_all: bool,
    #[serde(default)]
    pub allow: Vec<IpNet>,
    #[serde(default)]
    pub deny: Vec<IpNet>,
    #[serde(default)]
    pub install: InstallPolicy,
}

/// Kernel installation settings for imported routes.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallPolicy {
    #[serde(default = "default_table")]
    pub table: u32,
    #[serde(default = "default_true")]
    pub flush_on_peer_down: bool,
    #[serde(default = "default_lease")]
    pub route_lease_seconds: u32,
    #[serde(default)]
    pub lookup_rules: LookupRules,
}

impl Default for InstallPolicy {
    fn default() -> Self {
        InstallPolicy {
            table: default_table(),
            flush_on_peer_down: true,
            route_lease_seconds: default_lease(),
            lookup_rules: LookupRules::default(),
        }
    }
}

/// Policy-rule pair (`iif`/`oif` -> table) for an overlay bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct LookupRules {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rule_priority")]
    pub priority: u32,
}

impl Default for LookupRules {
    fn default() -> Self {
        LookupRules {
            enabled: false,
            priority: default_rule_priority(),
        }
    }
}

/// A remote vxmesh node.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub endpoint: PeerEndpoint,
    #[serde(default)]
    pub health: PeerHealthConfig,
}

/// Underlay address of a peer. Deserializing straight into `IpAddr` rejects
/// missing or unparseable addresses at load time.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerEndpoint {
    pub address: IpAddr,
    #[serde(default)]
    pub via_interface: Option<String>,
}

/// Keepalive timing for a peer.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerHealthConfig {
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_dead_after_ms")]
    pub dead_after_ms: u64,
}

impl Default for PeerHealthConfig {
    fn default() -> Self {
        PeerHealthConfig {
            keepalive_interval_ms: default_keepalive_ms(),
            dead_after_ms: default_dead_after_ms(),
        }
    }
}

impl PeerHealthConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn dead_after(&self) -> Duration {
        Duration::from_millis(self.dead_after_ms)
    }
}

/// Control-plane listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        ControlPlaneConfig {
            listen: ListenConfig::default(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: IpAddr,
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            address: default_listen_address(),
            port: default_listen_port(),
        }
    }
}

/// Mutual-TLS material for the control plane. When `ca_file` is set on the
/// server side, client certificates are required and verified against it.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: PathBuf,
    #[serde(default)]
    pub key_file: PathBuf,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

fn default_dstport() -> u16 {
    4789
}

fn default_mtu() -> u32 {
    1450
}

fn default_metric() -> u32 {
    100
}

fn default_table() -> u32 {
    100
}

fn default_lease() -> u32 {
    30
}

fn default_rule_priority() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_keepalive_ms() -> u64 {
    1500
}

fn default_dead_after_ms() -> u64 {
    6000
}

fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_listen_port() -> u16 {
    9898
}

fn default_version() -> u32 {
    2
}

fn default_reconcile_secs() -> u64 {
    10
}

/// On-disk file shape. Captures both schema versions; `into_config`
/// normalizes to the version-2 shape.
#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default = "default_version")]
    version: u32,
    node: NodeConfig,
    #[serde(default)]
    bridges: Vec<BridgeDef>,
    #[serde(default)]
    overlays: Vec<OverlayConfig>,
    #[serde(default)]
    peers: Vec<PeerConfig>,
    #[serde(default)]
    control_plane: Option<ControlPlaneConfig>,
    #[serde(default = "default_reconcile_secs")]
    reconcile_interval_seconds: u64,

    // Version-1 fields.
    #[serde(default)]
    overlay: Option<LegacyOverlay>,
    #[serde(default)]
    routing: Option<RoutingPolicy>,
    #[serde(default)]
    kvm: Option<LegacyKvm>,
    #[serde(default)]
    security: Option<LegacySecurity>,
}

#[derive(Debug, Deserialize)]
struct LegacyOverlay {
    vxlan: LegacyVxlan,
    #[serde(default)]
    peers: Vec<PeerConfig>,
}

#[derive(Debug, Deserialize)]
struct LegacyVxlan {
    vni: u32,
    name: String,
    #[serde(default = "default_dstport")]
    dstport: u16,
    #[serde(default)]
    learning: bool,
    #[serde(default = "default_mtu")]
    mtu: u32,
    bridge: String,
}

#[derive(Debug, Deserialize)]
struct LegacyKvm {
    #[serde(default)]
    pub bridges: Vec<BridgeDef>,
}

#[derive(Debug, Deserialize)]
struct LegacySecurity {
    #[serde(default)]
    control_plane: Option<ControlPlaneConfig>,
}

impl RawFile {
    fn into_config(self) -> Result<Config, ConfigError> {
        let cfg = match self.version {
            2 => Config {
                node: self.node,
                bridges: self.bridges,
                overlays: self.overlays,
                peers: self.peers,
                control_plane: self.control_plane.unwrap_or_default(),
                reconcile_interval: Duration::from_secs(self.reconcile_interval_seconds),
            },
            1 => {
                let legacy = self
                    .overlay
                    .ok_or_else(|| invalid("version 1 requires an `overlay` section"))?;
                let vxlan = legacy.vxlan;
                let overlay = OverlayConfig {
                    vni: vxlan.vni,
                    name: vxlan.name,
                    dstport: vxlan.dstport,
                    mtu: vxlan.mtu,
                    learning: vxlan.learning,
                    underlay_interface: None,
                    bridge: OverlayBridge {
                        name: vxlan.bridge,
                        ipv4: None,
                        ipv6: None,
                    },
                    bum: BumConfig::default(),
                    routing: self.routing.unwrap_or_default(),
                };
                Config {
                    node: self.node,
                    bridges: self.kvm.map(|k| k.bridges).unwrap_or_default(),
                    overlays: vec![overlay],
                    peers: legacy.peers,
                    control_plane: self
                        .security
                        .and_then(|s| s.control_plane)
                        .unwrap_or_default(),
                    reconcile_interval: Duration::from_secs(self.reconcile_interval_seconds),
                }
            }
            v => return Err(invalid(format!("unsupported config version {v}"))),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load_str(&data)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn load_str(data: &str) -> Result<Config, ConfigError> {
        let raw: RawFile = serde_yaml::from_str(data)?;
        raw.into_config()
    }

    /// Managed-bridge descriptor for a bridge name, if one is declared.
    pub fn managed_bridge(&self, name: &str) -> Option<&BridgeDef> {
        self.bridges.iter().find(|b| b.name == name && b.manage)
    }

    /// Overlay owning a VNI.
    pub fn overlay_for_vni(&self, vni: u32) -> Option<&OverlayConfig> {
        self.overlays.iter().find(|o| o.vni == vni)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.is_empty() {
            return Err(invalid("node.id must not be empty"));
        }

        let mut vnis = HashSet::new();
        let mut names = HashSet::new();
        let mut bridge_names = HashSet::new();
        for overlay in &self.overlays {
            overlay.validate()?;
            if !vnis.insert(overlay.vni) {
                return Err(invalid(format!("duplicate vni {}", overlay.vni)));
            }
            if !names.insert(overlay.name.as_str()) {
                return Err(invalid(format!("duplicate overlay name {:?}", overlay.name)));
            }
            if !bridge_names.insert(overlay.bridge.name.as_str()) {
                return Err(invalid(format!(
                    "bridge {:?} is used by more than one overlay",
                    overlay.bridge.name
                )));
            }
        }

        let mut peer_ids = HashSet::new();
        for peer in &self.peers {
            if peer.id.is_empty() {
                return Err(invalid("peer id must not be empty"));
            }
            if !peer_ids.insert(peer.id.as_str()) {
                return Err(invalid(format!("duplicate peer id {:?}", peer.id)));
            }
            if peer.id == self.node.id {
                return Err(invalid(format!(
                    "peer id {:?} collides with this node's id",
                    peer.id
                )));
            }
        }

        if self.control_plane.listen.port == 0 {
            return Err(invalid("control_plane.listen.port must not be 0"));
        }
        if self.reconcile_interval.is_zero() {
            return Err(invalid("reconcile_interval_seconds must be at least 1"));
        }
        if let Some(tls) = &self.control_plane.tls {
            if tls.enabled {
                if tls.cert_file.as_os_str().is_empty() {
                    return Err(invalid("tls.cert_file is required when tls is enabled"));
                }
                if tls.key_file.as_os_str().is_empty() {
                    return Err(invalid("tls.key_file is required when tls is enabled"));
                }
            }
        }

        Ok(())
    }
}

impl OverlayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.vni == 0 || self.vni > 0x00FF_FFFF {
            return Err(invalid(format!(
                "overlay {:?}: vni {} out of range 1..=16777215",
                self.name, self.vni
            )));
        }
        if self.name.is_empty() || self.name.len() > MAX_IFNAME_LEN {
            return Err(invalid(format!(
                "overlay interface name {:?} must be 1..={MAX_IFNAME_LEN} characters",
                self.name
            )));
        }
        if self.bridge.name.is_empty() || self.bridge.name.len() > MAX_IFNAME_LEN {
            return Err(invalid(format!(
                "bridge name {:?} must be 1..={MAX_IFNAME_LEN} characters",
                self.bridge.name
            )));
        }
        if !(1280..=9000).contains(&self.mtu) {
            return Err(invalid(format!(
                "overlay {:?}: mtu {} out of range 1280..=9000",
                self.name, self.mtu
            )));
        }
        if self.dstport == 0 {
            return Err(invalid(format!(
                "overlay {:?}: dstport must not be 0",
                self.name
            )));
        }
        if self.bum.mode == BumMode::Multicast {
            match self.bum.group {
                Some(group) if group.is_multicast() => {}
                Some(group) => {
                    return Err(invalid(format!(
                        "overlay {:?}: {group} is not a multicast group address",
                        self.name
                    )));
                }
                None => {
                    return Err(invalid(format!(
                        "overlay {:?}: bum mode multicast requires a group address",
                        self.name
                    )));
                }
            }
        }
        let install = &self.routing.import.install;
        if install.table == 0 || install.table > MAX_TABLE_ID {
            return Err(invalid(format!(
                "overlay {:?}: install table {} out of range 1..={MAX_TABLE_ID}",
                self.name, install.table
            )));
        }
        Ok(())
    }
}
