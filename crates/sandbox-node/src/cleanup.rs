use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

const PROGRESS_LOG_EVERY: usize = 1000;

#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupReport {
    pub namespaces_removed: usize,
    pub namespaces_failed: usize,
    pub veths_removed: usize,
    pub veths_failed: usize,
}

impl CleanupReport {
    pub fn had_failures(&self) -> bool {
        self.namespaces_failed > 0 || self.veths_failed > 0
    }
}

/// Reclaims `ns-<digits>` namespaces and dangling `veth*` devices left by
/// crashed node agents (§6, §12). Refuses nothing: every failure is counted
/// and logged, never aborts the sweep.
pub async fn cleanup_orphaned_network() -> CleanupReport {
    warn_if_firecracker_running().await;

    let mut report = CleanupReport::default();
    let namespaces = list_orphaned_namespaces().await;

    for (i, ns) in namespaces.iter().enumerate() {
        match remove_namespace(ns).await {
            Ok(()) => report.namespaces_removed += 1,
            Err(e) => {
                report.namespaces_failed += 1;
                warn!(namespace = %ns, error = %e, "failed to remove orphaned namespace");
            }
        }

        if (i + 1) % PROGRESS_LOG_EVERY == 0 {
            info!(processed = i + 1, total = namespaces.len(), "namespace cleanup progress");
        }
    }

    let veths = list_orphaned_veths().await;
    for veth in veths {
        match delete_veth(&veth).await {
            Ok(()) => report.veths_removed += 1,
            Err(e) => {
                report.veths_failed += 1;
                warn!(veth = %veth, error = %e, "failed to delete orphaned veth");
            }
        }
    }

    info!(
        namespaces_removed = report.namespaces_removed,
        namespaces_failed = report.namespaces_failed,
        veths_removed = report.veths_removed,
        veths_failed = report.veths_failed,
        "network cleanup complete"
    );

    report
}

fn is_orphaned_namespace_name(name: &str) -> bool {
    let Some(digits) = name.strip_prefix("ns-") else {
        return false;
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

async fn list_orphaned_namespaces() -> Vec<String> {
    let output = match Command::new("ip").arg("netns").arg("list").output().await {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "failed to list network namespaces");
            return Vec::new();
        }
    };

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| is_orphaned_namespace_name(name))
        .map(|name| name.to_string())
        .collect()
}

async fn remove_namespace(name: &str) -> Result<(), String> {
    let mount_path = format!("/run/netns/{name}");

    let _ = Command::new("umount")
        .arg(&mount_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    let status = Command::new("rm")
        .arg("-f")
        .arg(&mount_path)
        .status()
        .await
        .map_err(|e| e.to_string())?;

    if status.success() {
        Ok(())
    } else {
        Err(format!("rm exited with {status}"))
    }
}

async fn list_orphaned_veths() -> Vec<String> {
    let output = match Command::new("ip").arg("link").arg("show").output().await {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "failed to list network links");
            return Vec::new();
        }
    };

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_veth_link_line)
        .collect()
}

/// Parses a line like `12: veth1a2b3c@if13: <BROADCAST,...>` into `veth1a2b3c`.
fn parse_veth_link_line(line: &str) -> Option<String> {
    let after_colon = line.split_once(": ")?.1;
    let name = after_colon.split(['@', ':']).next()?;
    if name.starts_with("veth") {
        Some(name.to_string())
    } else {
        None
    }
}

async fn delete_veth(name: &str) -> Result<(), String> {
    let status = Command::new("ip")
        .arg("link")
        .arg("delete")
        .arg(name)
        .status()
        .await
        .map_err(|e| e.to_string())?;

    if status.success() {
        Ok(())
    } else {
        Err(format!("ip link delete exited with {status}"))
    }
}

/// Soft check only: warns if firecracker processes are still active during
/// cleanup, but never blocks the sweep on it (§6, §12).
async fn warn_if_firecracker_running() {
    match Command::new("pgrep").arg("-f").arg("firecracker").output().await {
        Ok(output) if output.status.success() => {
            let count = String::from_utf8_lossy(&output.stdout).lines().count();
            warn!(count, "firecracker processes still running during network cleanup");
        }
        _ => {}
    }
}
