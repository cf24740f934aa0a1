use sandbox_contracts::{MachineArch, NodeMetricsSnapshot};
use sysinfo::System;

/// Collects this host's current CPU metrics for the heartbeat the scheduler's
/// node view cache consumes (§4.4). `cpu_allocated` (reserved vCPUs) is
/// tracked by the caller, not sysinfo, since it reflects sandbox bookkeeping
/// rather than OS state.
pub fn collect_node_metrics(sys: &mut System, cpu_allocated: u32) -> NodeMetricsSnapshot {
    sys.refresh_cpu_all();

    NodeMetricsSnapshot {
        cpu_count: sys.cpus().len() as u32,
        cpu_allocated,
        cpu_percent: sys.global_cpu_usage(),
        arch: detect_arch(),
    }
}

fn detect_arch() -> MachineArch {
    if cfg!(target_arch = "aarch64") {
        MachineArch::Aarch64
    } else {
        MachineArch::X86_64
    }
}
