//! Reconciliation of declared overlays against actual kernel state.
//!
//! Each tick sweeps every overlay in order: bridge, bridge addresses,
//! VXLAN device (with bridge attachment), FDB flood entries, policy rules.
//! An error aborts the current overlay's cycle and the sweep moves on to
//! the next overlay; transient kernel errors heal on the next tick. The
//! sweep never touches the route table or the control plane.

use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use rtnetlink::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BumMode, Config, OverlayConfig};
use crate::netlink::{
    addr, BridgeManager, BridgeSpec, FdbManager, Netlink, NetlinkError, RuleManager, VxlanManager,
    VxlanSpec,
};
use crate::observability::ReconcilerStatus;

#[derive(Default)]
struct State {
    running: bool,
    last_run: Option<SystemTime>,
    last_error: Option<String>,
}

pub struct Reconciler {
    cfg: Arc<Config>,
    handle: Handle,
    bridge: BridgeManager,
    vxlan: VxlanManager,
    fdb: FdbManager,
    rule: RuleManager,
    state: Arc<RwLock<State>>,
}

impl Reconciler {
    pub fn new(cfg: Arc<Config>, netlink: &Netlink) -> Self {
        let handle = netlink.handle();
        Self {
            cfg,
            bridge: BridgeManager::new(handle.clone()),
            vxlan: VxlanManager::new(handle.clone()),
            fdb: FdbManager::new(),
            rule: RuleManager::new(),
            handle,
            state: Arc::new(RwLock::new(State::default())),
        }
    }

    pub fn status(&self) -> ReconcilerStatus {
        let state = self.state.read().unwrap();
        ReconcilerStatus {
            running: state.running,
            last_run: state.last_run,
            last_error: state.last_error.clone(),
        }
    }

    /// Run the reconciliation loop until cancellation. A sweep fires
    /// immediately, then on every interval tick.
    pub async fn run(&self, cancel: CancellationToken) {
        self.state.write().unwrap().running = true;
        info!(interval = ?self.cfg.reconcile_interval, "starting reconciler loop");

        self.reconcile().await;

        let mut ticker = tokio::time::interval(self.cfg.reconcile_interval);
        ticker.tick().await; // the immediate tick was just consumed above
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.reconcile().await,
            }
        }

        self.state.write().unwrap().running = false;
        info!("reconciler loop stopped");
    }

    /// Perform exactly one sweep and report its aggregate outcome.
    pub async fn run_once(&self) -> anyhow::Result<()> {
        self.reconcile().await;
        match self.state.read().unwrap().last_error.clone() {
            Some(err) => Err(anyhow::anyhow!(err)),
            None => Ok(()),
        }
    }

    async fn reconcile(&self) {
        self.state.write().unwrap().last_run = Some(SystemTime::now());
        debug!("starting reconciliation");

        if self.cfg.overlays.is_empty() {
            warn!("no overlays configured, skipping reconciliation");
            return;
        }

        let mut sweep_error = None;
        for overlay in &self.cfg.overlays {
            if let Err(err) = self.reconcile_overlay(overlay).await {
                error!(
                    overlay = %overlay.name,
                    vni = overlay.vni,
                    error = %err,
                    "overlay reconciliation failed"
                );
                sweep_error = Some(format!(
                    "overlay {} (VNI {}): {err}",
                    overlay.name, overlay.vni
                ));
            }
        }

        self.state.write().unwrap().last_error = sweep_error;
        debug!(overlay_count = self.cfg.overlays.len(), "reconciliation complete");
    }

    async fn reconcile_overlay(&self, overlay: &OverlayConfig) -> Result<(), NetlinkError> {
        debug!(
            overlay = %overlay.name,
            vni = overlay.vni,
            bridge = %overlay.bridge.name,
            "reconciling overlay"
        );

        self.ensure_bridge(overlay).await?;
        self.ensure_bridge_addresses(overlay).await?;
        self.ensure_vxlan(overlay).await?;
        self.sync_fdb(overlay).await?;
        self.ensure_rules(overlay).await?;

        Ok(())
    }

    async fn ensure_bridge(&self, overlay: &OverlayConfig) -> Result<(), NetlinkError> {
        let managed = self.cfg.managed_bridge(&overlay.bridge.name);
        let spec = BridgeSpec {
            name: overlay.bridge.name.clone(),
            mtu: managed
                .and_then(|bridge| bridge.mtu)
                .unwrap_or(overlay.mtu),
            stp: managed.map(|bridge| bridge.stp),
        };
        self.bridge.ensure(&spec).await
    }

    async fn ensure_bridge_addresses(&self, overlay: &OverlayConfig) -> Result<(), NetlinkError> {
        if let Some(ipv4) = overlay.bridge.ipv4 {
            self.bridge
                .add_address(&overlay.bridge.name, ipv4.into())
                .await?;
        }
        if let Some(ipv6) = overlay.bridge.ipv6 {
            self.bridge
                .add_address(&overlay.bridge.name, ipv6.into())
                .await?;
        }
        Ok(())
    }

    async fn ensure_vxlan(&self, overlay: &OverlayConfig) -> Result<(), NetlinkError> {
        let (local, underlay_index) = self.underlay_hint(overlay).await?;
        let spec = VxlanSpec {
            name: overlay.name.clone(),
            vni: overlay.vni,
            dst_port: overlay.dstport,
            local,
            mtu: overlay.mtu,
            learning: overlay.learning,
            bridge: overlay.bridge.name.clone(),
            group: match overlay.bum.mode {
                BumMode::Multicast => overlay.bum.group,
                BumMode::HeadEndReplication => None,
            },
            underlay_index,
        };
        self.vxlan.ensure(&spec).await
    }

    /// Local tunnel address and underlay device index, when the declared
    /// underlay interface exists and has a usable address. Absence is not
    /// fatal; the device then relies on kernel source selection until a
    /// later tick can rebuild it.
    async fn underlay_hint(
        &self,
        overlay: &OverlayConfig,
    ) -> Result<(Option<IpAddr>, Option<u32>), NetlinkError> {
        let Some(ifname) = &overlay.underlay_interface else {
            return Ok((None, None));
        };

        let index = crate::netlink::link_index(&self.handle, ifname).await?;
        if index.is_none() {
            warn!(
                overlay = %overlay.name,
                underlay = %ifname,
                "underlay interface not found, creating vxlan without local address"
            );
            return Ok((None, None));
        }

        let local = addr::interface_address(&self.handle, ifname).await?;
        if local.is_none() {
            warn!(
                overlay = %overlay.name,
                underlay = %ifname,
                "underlay interface has no usable address, creating vxlan without local address"
            );
        }
        Ok((local, index))
    }

    async fn sync_fdb(&self, overlay: &OverlayConfig) -> Result<(), NetlinkError> {
        match overlay.bum.mode {
            BumMode::HeadEndReplication => {
                let peer_ips: Vec<IpAddr> = self
                    .cfg
                    .peers
                    .iter()
                    .map(|peer| peer.endpoint.address)
                    .collect();
                debug!(
                    vxlan = %overlay.name,
                    peer_count = peer_ips.len(),
                    "syncing fdb entries"
                );
                self.fdb.sync_peers(&overlay.name, &peer_ips).await
            }
            BumMode::Multicast => {
                // The kernel floods via the multicast group; no per-peer
                // entries to manage.
                debug!(vxlan = %overlay.name, "multicast bum mode, skipping fdb sync");
                Ok(())
            }
        }
    }

    async fn ensure_rules(&self, overlay: &OverlayConfig) -> Result<(), NetlinkError> {
        let install = &overlay.routing.import.install;
        if !install.lookup_rules.enabled {
            return Ok(());
        }
        self.rule
            .ensure_bridge_rules(
                &overlay.bridge.name,
                install.table,
                install.lookup_rules.priority,
            )
            .await
    }
}
