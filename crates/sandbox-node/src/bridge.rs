use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tracing::{error, info, warn};

use crate::namespace::{self, NamespaceError};
use crate::proxy::{ProxyConfig, ProxyStats, TcpProxy};
use crate::slot::Slot;

/// Fixed guest-internal address every sandbox's envd binds to (§4.2, §6).
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 21);
pub const GUEST_CONTROL_PORT: u16 = 49983;
pub const GUEST_VNC_PORT: u16 = 5900;

/// Grace period between bringing up L2 and probing L1 against it (§4.2, §9
/// Open Question: a fixed sleep is a heuristic, not a readiness probe).
const LAYER2_READY_GRACE: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    Layer2Setup(String),
    Layer1Setup(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Layer2Setup(msg) => write!(f, "layer2 setup failed: {msg}"),
            BridgeError::Layer1Setup(msg) => write!(f, "layer1 setup failed: {msg}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<NamespaceError> for BridgeError {
    fn from(err: NamespaceError) -> Self {
        BridgeError::Layer2Setup(err.to_string())
    }
}

/// Which of the four proxies came up during `Setup` (§12 "VNC bridge
/// optionality" — VNC failures are reported, never fatal).
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeSetupReport {
    pub control_ready: bool,
    pub vnc_ready: bool,
}

/// The two-layer TCP bridge for one sandbox: a namespace-internal forwarder
/// (L2) and a host-side retrying proxy (L1), for both the control channel
/// and VNC (§4.2).
pub struct SandboxBridge {
    slot: Slot,
    control_l1: TcpProxy,
    vnc_l1: TcpProxy,
}

impl SandboxBridge {
    pub fn new(slot: Slot, proxy_config: ProxyConfig) -> Self {
        let control_target = SocketAddr::V4(SocketAddrV4::new(slot.vpeer_ip, GUEST_CONTROL_PORT));
        let vnc_target = SocketAddr::V4(SocketAddrV4::new(slot.vpeer_ip, GUEST_VNC_PORT));

        Self {
            slot,
            control_l1: TcpProxy::new(format!("{}-control-l1", slot.namespace_name()), control_target, proxy_config),
            vnc_l1: TcpProxy::new(format!("{}-vnc-l1", slot.namespace_name()), vnc_target, proxy_config),
        }
    }

    /// Setup order per §4.2: cleanup stale forwarders for this slot, bring
    /// up control L2, grace period, control L1 (fatal on failure, tearing
    /// down L2 if L1 fails), then VNC L2/L1 (non-fatal).
    pub async fn setup(&self) -> Result<BridgeSetupReport, BridgeError> {
        self.cleanup_stale().await;

        let control_l2_addr = SocketAddrV4::new(self.slot.vpeer_ip, GUEST_CONTROL_PORT);
        let control_guest_addr = SocketAddrV4::new(GUEST_IP, GUEST_CONTROL_PORT);
        namespace::start_layer2(&self.slot.namespace_name(), control_l2_addr, control_guest_addr).await?;

        tokio::time::sleep(LAYER2_READY_GRACE).await;

        let control_listen = SocketAddr::V4(SocketAddrV4::new(self.slot.host_ip, GUEST_CONTROL_PORT));
        if let Err(e) = self.control_l1.start(control_listen).await {
            namespace::stop_layer2(&self.slot.namespace_name(), self.slot.vpeer_ip).await;
            return Err(BridgeError::Layer1Setup(e.to_string()));
        }

        info!(
            namespace = %self.slot.namespace_name(),
            access_url = %self.access_url(),
            "control channel bridge ready"
        );

        let mut report = BridgeSetupReport { control_ready: true, vnc_ready: false };

        let vnc_l2_addr = SocketAddrV4::new(self.slot.vpeer_ip, GUEST_VNC_PORT);
        let vnc_guest_addr = SocketAddrV4::new(GUEST_IP, GUEST_VNC_PORT);
        match namespace::start_layer2(&self.slot.namespace_name(), vnc_l2_addr, vnc_guest_addr).await {
            Ok(_) => {
                tokio::time::sleep(LAYER2_READY_GRACE).await;
                let vnc_listen = SocketAddr::V4(SocketAddrV4::new(self.slot.host_ip, GUEST_VNC_PORT));
                match self.vnc_l1.start(vnc_listen).await {
                    Ok(_) => {
                        report.vnc_ready = true;
                        info!(namespace = %self.slot.namespace_name(), vnc_url = %self.vnc_url(), "vnc bridge ready");
                    }
                    Err(e) => {
                        warn!(namespace = %self.slot.namespace_name(), error = %e, "vnc layer1 setup failed, leaving vnc unavailable");
                        namespace::stop_layer2(&self.slot.namespace_name(), self.slot.vpeer_ip).await;
                    }
                }
            }
            Err(e) => {
                warn!(namespace = %self.slot.namespace_name(), error = %e, "vnc layer2 setup failed, leaving vnc unavailable");
            }
        }

        Ok(report)
    }

    /// Tears down all four proxies, collecting every error rather than
    /// short-circuiting on the first failure (§4.2 Teardown).
    pub async fn teardown(&self) {
        self.control_l1.stop().await;
        namespace::stop_layer2(&self.slot.namespace_name(), self.slot.vpeer_ip).await;
        self.vnc_l1.stop().await;
        namespace::stop_layer2(&self.slot.namespace_name(), self.slot.vpeer_ip).await;
    }

    /// Best-effort cleanup of forwarders left over from a previous, crashed
    /// bridge on this slot, run before `Setup` brings up fresh ones (§4.2,
    /// §12). Errors are logged, never surfaced — a failed cleanup should not
    /// block a fresh sandbox from starting.
    async fn cleanup_stale(&self) {
        namespace::stop_layer2(&self.slot.namespace_name(), self.slot.vpeer_ip).await;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }

    pub fn access_url(&self) -> String {
        format!("http://{}:{}", self.slot.host_ip, GUEST_CONTROL_PORT)
    }

    pub fn vnc_url(&self) -> String {
        format!("vnc://{}:{}", self.slot.host_ip, GUEST_VNC_PORT)
    }

    pub fn control_stats(&self) -> ProxyStats {
        self.control_l1.stats()
    }

    pub fn vnc_stats(&self) -> ProxyStats {
        self.vnc_l1.stats()
    }

    pub async fn is_control_healthy(&self) -> bool {
        self.control_l1.is_healthy().await
    }
}
