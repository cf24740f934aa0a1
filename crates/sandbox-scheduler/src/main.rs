use std::time::Duration;

use sandbox_scheduler::config::PlacementConfig;
use sandbox_scheduler::{NodeViewCache, PlacementConfigHandle};
use tracing::info;

/// Nodes whose last heartbeat is older than this are dropped from the cache (§3 lifecycle).
const NODE_STALE_AFTER: Duration = Duration::from_secs(60);
const EVICTION_INTERVAL: Duration = Duration::from_secs(10);

/// Bootstraps the node view cache and placement config for the scheduling
/// core. The gRPC service façade that would feed heartbeats in and accept
/// create requests is out of scope; this binary brings up the ambient state
/// a façade would wire into and keeps it healthy (periodic stale-node
/// eviction) until shut down.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let placement_config = PlacementConfigHandle::new(PlacementConfig::from_env());
    let nodes = NodeViewCache::new();

    info!(
        r = placement_config.current().r,
        k = placement_config.current().k,
        "sandbox-scheduler starting"
    );

    let eviction_nodes = &nodes;
    let eviction_loop = async {
        let mut interval = tokio::time::interval(EVICTION_INTERVAL);
        loop {
            interval.tick().await;
            let before = eviction_nodes.len();
            eviction_nodes.evict_stale(NODE_STALE_AFTER);
            let after = eviction_nodes.len();
            if before != after {
                info!(evicted = before - after, remaining = after, "evicted stale nodes");
            }
        }
    };

    tokio::select! {
        _ = eviction_loop => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, exiting");
        }
    }
}
