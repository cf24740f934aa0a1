use std::collections::HashSet;
use std::fmt;

use rand::Rng;
use sandbox_contracts::{MachineInfo, NodeMetricsSnapshot, NodeStatus, SandboxResourceRequest};

use crate::config::PlacementConfig;

/// Anything the placement engine can score and filter a candidate node by.
///
/// Implemented for `Arc<NodeView>` in the real cache; tests implement it for
/// a bare struct so the sampling/scoring math can be exercised without a
/// running cache.
pub trait PlacementCandidate {
    fn node_id(&self) -> &str;
    fn metrics(&self) -> NodeMetricsSnapshot;
    fn status(&self) -> NodeStatus;
    fn in_progress_count(&self) -> u32;
}

impl<T: PlacementCandidate + ?Sized> PlacementCandidate for std::sync::Arc<T> {
    fn node_id(&self) -> &str {
        (**self).node_id()
    }
    fn metrics(&self) -> NodeMetricsSnapshot {
        (**self).metrics()
    }
    fn status(&self) -> NodeStatus {
        (**self).status()
    }
    fn in_progress_count(&self) -> u32 {
        (**self).in_progress_count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    NoCapacity,
}

impl fmt::Display for PlacementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementError::NoCapacity => write!(f, "no node available"),
        }
    }
}

impl std::error::Error for PlacementError {}

/// `(requestedCPU + reserved + alpha*usageFraction) / (R*cpuCount)`; lower
/// is better. A node with `cpu_count == 0` is treated as having infinite
/// score so it is never picked (§4.5).
pub fn score(metrics: NodeMetricsSnapshot, requested_cpu: u32, config: PlacementConfig) -> f64 {
    if metrics.cpu_count == 0 {
        return f64::MAX;
    }

    let total_capacity = config.r * f64::from(metrics.cpu_count);
    let numerator = f64::from(requested_cpu)
        + f64::from(metrics.cpu_allocated)
        + config.alpha * metrics.usage_fraction();

    numerator / total_capacity
}

/// `reserved + requested <= R*cpuCount`. A node with `cpu_count == 0` never
/// fits (§4.5).
pub fn fits(metrics: NodeMetricsSnapshot, requested_cpu: u32, config: PlacementConfig) -> bool {
    if metrics.cpu_count == 0 {
        return false;
    }

    let total_capacity = config.r * f64::from(metrics.cpu_count);
    f64::from(metrics.cpu_allocated + requested_cpu) <= total_capacity
}

/// Power-of-K-choices placement: draw up to `config.k` distinct candidates
/// via partial Fisher-Yates, run each through the filter chain, and return
/// the minimum-score survivor. Ties are broken by draw order — the first
/// candidate found with the lowest score wins, matching the reference
/// implementation's strict `<` comparison (§4.5, §8 scenario 2-4).
pub fn choose_node<'a, C, R>(
    nodes: &'a [C],
    excluded: &HashSet<String>,
    resources: &SandboxResourceRequest,
    machine: MachineInfo,
    config: PlacementConfig,
    rng: &mut R,
) -> Result<&'a C, PlacementError>
where
    C: PlacementCandidate,
    R: Rng,
{
    let mut indices: Vec<usize> = (0..nodes.len()).collect();
    let mut remaining = indices.len();

    let mut best: Option<(&'a C, f64)> = None;
    let mut candidates_found = 0usize;

    while candidates_found < config.k && remaining > 0 {
        let j = rng.gen_range(0..remaining);
        let pick = indices[j];
        indices.swap(j, remaining - 1);
        remaining -= 1;

        let node = &nodes[pick];

        if excluded.contains(node.node_id()) {
            continue;
        }
        if node.status() != NodeStatus::Ready {
            continue;
        }

        let metrics = node.metrics();
        if !machine.compatible_with(metrics.arch) {
            continue;
        }
        if config.can_fit && !fits(metrics, resources.vcpu_count, config) {
            continue;
        }
        if config.too_many_starting
            && node.in_progress_count() > config.max_starting_instances_per_node
        {
            continue;
        }

        candidates_found += 1;
        let candidate_score = score(metrics, resources.vcpu_count, config);

        match &best {
            Some((_, best_score)) if candidate_score >= *best_score => {}
            _ => best = Some((node, candidate_score)),
        }
    }

    best.map(|(node, _)| node).ok_or(PlacementError::NoCapacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use sandbox_contracts::MachineArch;

    struct FakeNode {
        id: String,
        metrics: NodeMetricsSnapshot,
        status: NodeStatus,
        in_progress: u32,
    }

    impl PlacementCandidate for FakeNode {
        fn node_id(&self) -> &str {
            &self.id
        }
        fn metrics(&self) -> NodeMetricsSnapshot {
            self.metrics
        }
        fn status(&self) -> NodeStatus {
            self.status
        }
        fn in_progress_count(&self) -> u32 {
            self.in_progress
        }
    }

    fn node(id: &str, cpu_count: u32, reserved: u32, pct: f32, status: NodeStatus) -> FakeNode {
        FakeNode {
            id: id.to_string(),
            metrics: NodeMetricsSnapshot {
                cpu_count,
                cpu_allocated: reserved,
                cpu_percent: pct,
                arch: MachineArch::X86_64,
            },
            status,
            in_progress: 0,
        }
    }

    fn request(vcpu_count: u32) -> SandboxResourceRequest {
        SandboxResourceRequest::new(
            None,
            vcpu_count,
            512,
            1024,
            60,
            "tmpl",
            "build",
            MachineInfo { arch: MachineArch::X86_64 },
        )
    }

    #[test]
    fn empty_pool_returns_no_capacity() {
        let nodes: Vec<FakeNode> = vec![];
        let mut rng = StepRng::new(0, 1);
        let result = choose_node(
            &nodes,
            &HashSet::new(),
            &request(2),
            MachineInfo { arch: MachineArch::X86_64 },
            PlacementConfig::default(),
            &mut rng,
        );
        assert_eq!(result.unwrap_err(), PlacementError::NoCapacity);
    }

    #[test]
    fn single_viable_node_scenario_from_spec() {
        let nodes = vec![node("a", 8, 0, 0.0, NodeStatus::Ready)];
        let mut rng = StepRng::new(0, 1);
        let config = PlacementConfig::default();

        let chosen = choose_node(
            &nodes,
            &HashSet::new(),
            &request(2),
            MachineInfo { arch: MachineArch::X86_64 },
            config,
            &mut rng,
        )
        .unwrap();

        assert_eq!(chosen.node_id(), "a");
        let s = score(chosen.metrics(), 2, config);
        assert!((s - 0.0625).abs() < 1e-9);
    }

    #[test]
    fn over_commit_cutoff_scenario_from_spec() {
        let nodes = vec![
            node("a", 4, 15, 0.0, NodeStatus::Ready),
            node("b", 4, 10, 0.0, NodeStatus::Ready),
        ];
        let mut config = PlacementConfig::default();
        config.can_fit = true;
        config.k = 2;
        let mut rng = StepRng::new(0, 1);

        let chosen = choose_node(
            &nodes,
            &HashSet::new(),
            &request(2),
            MachineInfo { arch: MachineArch::X86_64 },
            config,
            &mut rng,
        )
        .unwrap();

        assert_eq!(chosen.node_id(), "b");
    }

    #[test]
    fn excluded_node_is_skipped() {
        let nodes = vec![
            node("a", 8, 0, 0.0, NodeStatus::Ready),
            node("b", 8, 0, 0.0, NodeStatus::Ready),
        ];
        let mut excluded = HashSet::new();
        excluded.insert("a".to_string());
        let mut config = PlacementConfig::default();
        config.k = 2;
        let mut rng = StepRng::new(0, 1);

        let chosen = choose_node(
            &nodes,
            &excluded,
            &request(2),
            MachineInfo { arch: MachineArch::X86_64 },
            config,
            &mut rng,
        )
        .unwrap();

        assert_eq!(chosen.node_id(), "b");
    }

    #[test]
    fn non_ready_nodes_are_never_chosen() {
        let nodes = vec![node("a", 8, 0, 0.0, NodeStatus::Draining)];
        let mut rng = StepRng::new(0, 1);
        let result = choose_node(
            &nodes,
            &HashSet::new(),
            &request(2),
            MachineInfo { arch: MachineArch::X86_64 },
            PlacementConfig::default(),
            &mut rng,
        );
        assert_eq!(result.unwrap_err(), PlacementError::NoCapacity);
    }

    #[test]
    fn incompatible_arch_is_filtered() {
        let nodes = vec![node("a", 8, 0, 0.0, NodeStatus::Ready)];
        let mut rng = StepRng::new(0, 1);
        let result = choose_node(
            &nodes,
            &HashSet::new(),
            &request(2),
            MachineInfo { arch: MachineArch::Aarch64 },
            PlacementConfig::default(),
            &mut rng,
        );
        assert_eq!(result.unwrap_err(), PlacementError::NoCapacity);
    }

    #[test]
    fn zero_cpu_count_never_fits_or_scores_finite() {
        let metrics = NodeMetricsSnapshot {
            cpu_count: 0,
            cpu_allocated: 0,
            cpu_percent: 0.0,
            arch: MachineArch::X86_64,
        };
        let config = PlacementConfig::default();
        assert!(!fits(metrics, 1, config));
        assert_eq!(score(metrics, 1, config), f64::MAX);
    }

    #[test]
    fn too_many_starting_filters_busy_nodes() {
        let mut busy = node("a", 8, 0, 0.0, NodeStatus::Ready);
        busy.in_progress = 10;
        let idle = node("b", 8, 0, 0.0, NodeStatus::Ready);
        let nodes = vec![busy, idle];

        let mut config = PlacementConfig::default();
        config.too_many_starting = true;
        config.k = 2;
        let mut rng = StepRng::new(0, 1);

        let chosen = choose_node(
            &nodes,
            &HashSet::new(),
            &request(2),
            MachineInfo { arch: MachineArch::X86_64 },
            config,
            &mut rng,
        )
        .unwrap();

        assert_eq!(chosen.node_id(), "b");
    }

    #[test]
    fn sample_bound_never_evaluates_more_than_k_when_all_pass() {
        let nodes: Vec<FakeNode> = (0..100)
            .map(|i| node(&format!("n{i}"), 8, 0, 0.0, NodeStatus::Ready))
            .collect();
        let mut config = PlacementConfig::default();
        config.k = 3;
        let mut rng = rand::thread_rng();

        // choose_node doesn't expose the evaluated count directly, but it
        // must still return a result within the pool on every draw pattern.
        for _ in 0..20 {
            let chosen = choose_node(
                &nodes,
                &HashSet::new(),
                &request(1),
                MachineInfo { arch: MachineArch::X86_64 },
                config,
                &mut rng,
            );
            assert!(chosen.is_ok());
        }
    }
}
