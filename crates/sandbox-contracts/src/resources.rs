use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// CPU architecture tag a build was compiled for and a node can run.
///
/// Placement only ever compares these for exact equality (§4.5 rule 3);
/// there is no notion of cross-arch emulation in this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineArch {
    X86_64,
    Aarch64,
}

/// The CPU architecture a sandbox's build requires, carried alongside a
/// create request so placement can filter incompatible nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub arch: MachineArch,
}

impl MachineInfo {
    pub fn compatible_with(&self, node_arch: MachineArch) -> bool {
        self.arch == node_arch
    }
}

/// Immutable description of what a create request is asking for.
///
/// Generated once at the API boundary and never mutated as it flows
/// through placement and node-start (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResourceRequest {
    pub sandbox_id: String,
    pub vcpu_count: u32,
    pub mem_size_mib: u64,
    pub disk_size_mib: u64,
    pub max_lifetime_secs: u64,
    pub template_id: String,
    pub build_id: String,
    pub kernel_version: String,
    pub firecracker_version: String,
    pub machine: MachineInfo,
    pub env_vars: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

impl SandboxResourceRequest {
    /// Builds a request, generating a sandbox id if the caller didn't supply one.
    pub fn new(
        sandbox_id: Option<String>,
        vcpu_count: u32,
        mem_size_mib: u64,
        disk_size_mib: u64,
        max_lifetime_secs: u64,
        template_id: impl Into<String>,
        build_id: impl Into<String>,
        machine: MachineInfo,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.unwrap_or_else(|| format!("sb_{}", Uuid::now_v7().simple())),
            vcpu_count,
            mem_size_mib,
            disk_size_mib,
            max_lifetime_secs,
            template_id: template_id.into(),
            build_id: build_id.into(),
            kernel_version: String::new(),
            firecracker_version: String::new(),
            machine,
            env_vars: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_info_requires_exact_arch_match() {
        let req = MachineInfo { arch: MachineArch::X86_64 };
        assert!(req.compatible_with(MachineArch::X86_64));
        assert!(!req.compatible_with(MachineArch::Aarch64));
    }

    #[test]
    fn new_generates_sandbox_id_when_absent() {
        let req = SandboxResourceRequest::new(
            None,
            2,
            512,
            1024,
            3600,
            "tmpl",
            "build",
            MachineInfo { arch: MachineArch::X86_64 },
        );
        assert!(req.sandbox_id.starts_with("sb_"));
    }

    #[test]
    fn new_preserves_caller_supplied_id() {
        let req = SandboxResourceRequest::new(
            Some("sb_fixed".to_string()),
            1,
            256,
            512,
            60,
            "tmpl",
            "build",
            MachineInfo { arch: MachineArch::Aarch64 },
        );
        assert_eq!(req.sandbox_id, "sb_fixed");
    }
}
