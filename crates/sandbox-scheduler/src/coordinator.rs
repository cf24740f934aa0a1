use std::collections::HashSet;
use std::fmt;

use rand::Rng;
use sandbox_contracts::{ClientId, MachineInfo, NodeAgentError, SandboxResourceRequest};
use tracing::{info, warn};

use crate::agent_client::NodeAgentClient;
use crate::config::PlacementConfigHandle;
use crate::node_view::NodeViewCache;
use crate::placement::{choose_node, PlacementError};

/// Bounded retry budget for a single create attempt (§4.6): after this many
/// excludable failures, the coordinator gives up rather than looping forever
/// over a shrinking node pool.
const MAX_PLACEMENT_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    NoCapacity,
    AttemptsExhausted,
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::NoCapacity => write!(f, "no capacity available for sandbox"),
            CoordinatorError::AttemptsExhausted => {
                write!(f, "exhausted placement attempts without a successful start")
            }
        }
    }
}

impl std::error::Error for CoordinatorError {}

/// Drives one create request through placement, start, and retry-on-excludable-failure.
///
/// State machine per §4.6: `Placing -> Starting -> Running` on success;
/// `Starting` on an excludable error loops back to `Placing` with an
/// augmented excluded set, up to `MAX_PLACEMENT_ATTEMPTS`.
pub struct PlacementCoordinator<A: NodeAgentClient> {
    nodes: NodeViewCache,
    config: PlacementConfigHandle,
    agent: A,
}

impl<A: NodeAgentClient> PlacementCoordinator<A> {
    pub fn new(nodes: NodeViewCache, config: PlacementConfigHandle, agent: A) -> Self {
        Self { nodes, config, agent }
    }

    pub fn node_views(&self) -> &NodeViewCache {
        &self.nodes
    }

    pub async fn create_sandbox(
        &self,
        resources: &SandboxResourceRequest,
        machine: MachineInfo,
    ) -> Result<ClientId, CoordinatorError> {
        let mut excluded = HashSet::new();
        let mut rng = rand::thread_rng();

        for attempt in 0..MAX_PLACEMENT_ATTEMPTS {
            let candidates = self.nodes.snapshot();
            let config = self.config.current();

            let chosen = match choose_node(&candidates, &excluded, resources, machine, config, &mut rng) {
                Ok(node) => node,
                Err(PlacementError::NoCapacity) => {
                    warn!(sandbox_id = %resources.sandbox_id, attempt, "no node available for placement");
                    return Err(CoordinatorError::NoCapacity);
                }
            };

            chosen.begin_start();
            let result = self.agent.create_sandbox(&chosen.node_id, resources).await;
            chosen.finish_start();

            match result {
                Ok(client_id) => {
                    info!(
                        sandbox_id = %resources.sandbox_id,
                        node_id = %chosen.node_id,
                        attempt,
                        "sandbox placed"
                    );
                    return Ok(client_id);
                }
                Err(err) if err.is_excludable() => {
                    warn!(
                        sandbox_id = %resources.sandbox_id,
                        node_id = %chosen.node_id,
                        attempt,
                        error = %err,
                        "node start failed, excluding node and retrying placement"
                    );
                    excluded.insert(chosen.node_id.clone());
                }
                Err(err) => {
                    // Resource exhausted: the node pool may still fit
                    // elsewhere right now, so the node stays eligible and
                    // is not added to `excluded` — the next draw may land on
                    // it again.
                    warn!(
                        sandbox_id = %resources.sandbox_id,
                        node_id = %chosen.node_id,
                        attempt,
                        error = %err,
                        "node resource exhausted, retrying placement"
                    );
                }
            }
        }

        Err(CoordinatorError::AttemptsExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_client::fakes::ScriptedAgentClient;
    use crate::config::PlacementConfig;
    use sandbox_contracts::{MachineArch, NodeMetricsSnapshot, NodeStatus};

    fn machine() -> MachineInfo {
        MachineInfo { arch: MachineArch::X86_64 }
    }

    fn request() -> SandboxResourceRequest {
        SandboxResourceRequest::new(Some("sb_test".into()), 2, 512, 1024, 60, "tmpl", "build", machine())
    }

    fn metrics() -> NodeMetricsSnapshot {
        NodeMetricsSnapshot { cpu_count: 8, cpu_allocated: 0, cpu_percent: 0.0, arch: MachineArch::X86_64 }
    }

    #[tokio::test]
    async fn places_on_single_ready_node() {
        let nodes = NodeViewCache::new();
        nodes.apply_heartbeat("node_a", metrics(), NodeStatus::Ready);

        let agent = ScriptedAgentClient::new();
        agent.push("node_a", Ok(ClientId("client_1".into())));

        let coordinator = PlacementCoordinator::new(nodes, PlacementConfigHandle::new(PlacementConfig::default()), agent);
        let result = coordinator.create_sandbox(&request(), machine()).await;

        assert_eq!(result.unwrap(), ClientId("client_1".into()));
    }

    #[tokio::test]
    async fn empty_pool_returns_no_capacity() {
        let nodes = NodeViewCache::new();
        let agent = ScriptedAgentClient::new();
        let coordinator = PlacementCoordinator::new(nodes, PlacementConfigHandle::new(PlacementConfig::default()), agent);

        let result = coordinator.create_sandbox(&request(), machine()).await;
        assert_eq!(result.unwrap_err(), CoordinatorError::NoCapacity);
    }

    #[tokio::test]
    async fn excludable_failure_retries_on_other_node() {
        let nodes = NodeViewCache::new();
        nodes.apply_heartbeat("node_a", metrics(), NodeStatus::Ready);
        nodes.apply_heartbeat("node_b", metrics(), NodeStatus::Ready);

        let agent = ScriptedAgentClient::new();
        agent.push("node_a", Err(NodeAgentError::Unavailable("boom".into())));
        agent.push("node_b", Ok(ClientId("client_b".into())));

        let mut config = PlacementConfig::default();
        config.k = 2;
        let coordinator = PlacementCoordinator::new(nodes, PlacementConfigHandle::new(config), agent);

        let result = coordinator.create_sandbox(&request(), machine()).await;
        assert_eq!(result.unwrap(), ClientId("client_b".into()));
    }

    #[tokio::test]
    async fn resource_exhausted_does_not_exclude_node() {
        // Only one node in the pool: if ResourceExhausted excluded it, the
        // retry would have no candidate left and return NoCapacity instead
        // of trying node_a again.
        let nodes = NodeViewCache::new();
        nodes.apply_heartbeat("node_a", metrics(), NodeStatus::Ready);

        let agent = ScriptedAgentClient::new();
        agent.push("node_a", Err(NodeAgentError::ResourceExhausted("cpu".into())));
        agent.push("node_a", Ok(ClientId("client_a".into())));

        let coordinator = PlacementCoordinator::new(nodes, PlacementConfigHandle::new(PlacementConfig::default()), agent);
        let result = coordinator.create_sandbox(&request(), machine()).await;

        assert_eq!(result.unwrap(), ClientId("client_a".into()));
    }

    #[tokio::test]
    async fn in_progress_counter_is_decremented_after_success() {
        let nodes = NodeViewCache::new();
        nodes.apply_heartbeat("node_a", metrics(), NodeStatus::Ready);

        let agent = ScriptedAgentClient::new();
        agent.push("node_a", Ok(ClientId("client_1".into())));

        let coordinator = PlacementCoordinator::new(nodes, PlacementConfigHandle::new(PlacementConfig::default()), agent);
        coordinator.create_sandbox(&request(), machine()).await.unwrap();

        let view = coordinator.node_views().get("node_a").unwrap();
        assert_eq!(view.in_progress_count(), 0);
    }

    #[tokio::test]
    async fn in_progress_counter_is_decremented_after_failure() {
        let nodes = NodeViewCache::new();
        nodes.apply_heartbeat("node_a", metrics(), NodeStatus::Ready);

        let agent = ScriptedAgentClient::new();
        agent.push("node_a", Err(NodeAgentError::Internal("boom".into())));

        let coordinator = PlacementCoordinator::new(nodes, PlacementConfigHandle::new(PlacementConfig::default()), agent);
        let _ = coordinator.create_sandbox(&request(), machine()).await;

        let view = coordinator.node_views().get("node_a").unwrap();
        assert_eq!(view.in_progress_count(), 0);
    }
}
