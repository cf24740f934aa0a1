use std::time::Duration;

use sysinfo::System;
use tracing::info;

use sandbox_node::slot::SlotManager;

/// Interval at which this node samples its own CPU metrics, the data a
/// heartbeat RPC would carry to the scheduler's node view cache (§4.4).
const METRICS_INTERVAL: Duration = Duration::from_secs(15);

/// Bootstraps the node-side ambient state: slot bookkeeping and periodic
/// metrics sampling. The gRPC `Sandbox.Create`/heartbeat transport that would
/// consume this data, and the Firecracker lifecycle that would trigger a
/// `SandboxBridge::setup` per sandbox, are both out of scope (§1) — this
/// binary keeps the in-process state this crate owns alive and observable
/// until shut down, the same role `sandbox-scheduler`'s `main.rs` plays for
/// the placement side.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let slots = SlotManager::new();
    let mut sys = System::new();

    info!("sandbox-node starting");

    let metrics_loop = async {
        let mut interval = tokio::time::interval(METRICS_INTERVAL);
        loop {
            interval.tick().await;
            let metrics = sandbox_node::metrics::collect_node_metrics(&mut sys, 0);
            info!(
                cpu_count = metrics.cpu_count,
                cpu_percent = metrics.cpu_percent,
                active_slots = slots.active_count(),
                "node metrics sample"
            );
        }
    };

    tokio::select! {
        _ = metrics_loop => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, exiting");
        }
    }
}
