use serde::{Deserialize, Serialize};

use crate::resources::MachineArch;

/// Status a node view can be in; only `Ready` nodes are ever placed onto (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Ready,
    Draining,
    Unhealthy,
    Unknown,
}

/// A consistent, point-in-time snapshot of one node's resource metrics.
///
/// Produced by the node agent's heartbeat and applied atomically into the
/// node view cache; placement reads never observe a torn value (§4.4, §5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeMetricsSnapshot {
    pub cpu_count: u32,
    pub cpu_allocated: u32,
    pub cpu_percent: f32,
    pub arch: MachineArch,
}

impl NodeMetricsSnapshot {
    pub fn usage_fraction(&self) -> f64 {
        f64::from(self.cpu_percent) / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_fraction_divides_percent_by_hundred() {
        let m = NodeMetricsSnapshot {
            cpu_count: 8,
            cpu_allocated: 2,
            cpu_percent: 45.0,
            arch: MachineArch::X86_64,
        };
        assert!((m.usage_fraction() - 0.45).abs() < f64::EPSILON);
    }
}
