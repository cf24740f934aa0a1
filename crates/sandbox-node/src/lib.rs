pub mod bridge;
pub mod cleanup;
pub mod metrics;
pub mod namespace;
pub mod proxy;
pub mod slot;

pub use bridge::{BridgeError, BridgeSetupReport, SandboxBridge};
pub use proxy::{ProxyConfig, ProxyError, ProxyStats, TcpProxy};
pub use slot::{Slot, SlotError, SlotManager};
