use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use sandbox_contracts::{NodeMetricsSnapshot, NodeStatus};

use crate::placement::PlacementCandidate;

/// Per-node cached metrics and status, as maintained by heartbeats and read
/// by the placement engine (§4.4).
///
/// `metrics` and `status` are guarded separately so a status flip doesn't
/// have to wait on a metrics writer and vice versa — the cache never hands
/// out a torn combination of the two because each is read as one snapshot.
pub struct NodeView {
    pub node_id: String,
    metrics: RwLock<NodeMetricsSnapshot>,
    status: RwLock<NodeStatus>,
    in_progress: AtomicU32,
    last_heartbeat: RwLock<Instant>,
}

impl NodeView {
    pub fn new(node_id: impl Into<String>, metrics: NodeMetricsSnapshot, status: NodeStatus) -> Self {
        Self {
            node_id: node_id.into(),
            metrics: RwLock::new(metrics),
            status: RwLock::new(status),
            in_progress: AtomicU32::new(0),
            last_heartbeat: RwLock::new(Instant::now()),
        }
    }

    pub fn metrics(&self) -> NodeMetricsSnapshot {
        *self.metrics.read().expect("node metrics lock poisoned")
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read().expect("node status lock poisoned")
    }

    pub fn in_progress_count(&self) -> u32 {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Applied atomically by the heartbeat path; a concurrent placement read
    /// sees either the old or the new snapshot, never a mix of the two.
    pub fn apply_heartbeat(&self, metrics: NodeMetricsSnapshot, status: NodeStatus) {
        *self.metrics.write().expect("node metrics lock poisoned") = metrics;
        *self.status.write().expect("node status lock poisoned") = status;
        *self.last_heartbeat.write().expect("heartbeat lock poisoned") = Instant::now();
    }

    pub fn age(&self) -> Duration {
        self.last_heartbeat
            .read()
            .expect("heartbeat lock poisoned")
            .elapsed()
    }

    /// Called before a start request is sent to this node; paired with
    /// `finish_start` regardless of whether the start succeeds or fails (§4.4).
    pub fn begin_start(&self) {
        self.in_progress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn finish_start(&self) {
        self.in_progress.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
            Some(c.saturating_sub(1))
        }).ok();
    }
}

impl PlacementCandidate for NodeView {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn metrics(&self) -> NodeMetricsSnapshot {
        self.metrics()
    }

    fn status(&self) -> NodeStatus {
        self.status()
    }

    fn in_progress_count(&self) -> u32 {
        self.in_progress_count()
    }
}

/// Registry of all nodes the coordinator currently knows about.
#[derive(Default)]
pub struct NodeViewCache {
    nodes: RwLock<HashMap<String, Arc<NodeView>>>,
}

impl NodeViewCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the node view on first heartbeat, or applies the snapshot to
    /// the existing one.
    pub fn apply_heartbeat(
        &self,
        node_id: &str,
        metrics: NodeMetricsSnapshot,
        status: NodeStatus,
    ) {
        if let Some(existing) = self.nodes.read().expect("node cache lock poisoned").get(node_id) {
            existing.apply_heartbeat(metrics, status);
            return;
        }

        let view = Arc::new(NodeView::new(node_id, metrics, status));
        self.nodes
            .write()
            .expect("node cache lock poisoned")
            .insert(node_id.to_string(), view);
    }

    /// A point-in-time view of all known nodes, for a single placement call (§4.6).
    pub fn snapshot(&self) -> Vec<Arc<NodeView>> {
        self.nodes
            .read()
            .expect("node cache lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<NodeView>> {
        self.nodes.read().expect("node cache lock poisoned").get(node_id).cloned()
    }

    /// Drops nodes whose last heartbeat is older than `max_age` (§3 lifecycle).
    pub fn evict_stale(&self, max_age: Duration) {
        self.nodes
            .write()
            .expect("node cache lock poisoned")
            .retain(|_, view| view.age() <= max_age);
    }

    pub fn len(&self) -> usize {
        self.nodes.read().expect("node cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
