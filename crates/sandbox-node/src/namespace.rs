use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceError {
    Spawn(String),
    ExitedImmediately,
}

impl fmt::Display for NamespaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceError::Spawn(msg) => write!(f, "failed to spawn namespace forwarder: {msg}"),
            NamespaceError::ExitedImmediately => write!(f, "namespace forwarder exited immediately"),
        }
    }
}

impl std::error::Error for NamespaceError {}

/// Builds the `ip netns exec <namespace> socat ...` command that bridges
/// `bind_addr` (inside the namespace) to `target_addr` (§4.2 L2). Detached
/// stdio: a L2 process must not inherit pipes the supervisor later garbage
/// collects, or a write into a closed pipe kills it (§9).
fn build_socat_command(namespace: &str, bind_addr: SocketAddrV4, target_addr: SocketAddrV4) -> Command {
    let mut cmd = Command::new("ip");
    cmd.arg("netns")
        .arg("exec")
        .arg(namespace)
        .arg("socat")
        .arg(format!(
            "TCP4-LISTEN:{},bind={},reuseaddr,fork",
            bind_addr.port(),
            bind_addr.ip()
        ))
        .arg(format!("TCP4:{}:{}", target_addr.ip(), target_addr.port()))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);
    cmd
}

/// Starts a namespace-internal forwarder and confirms it survives past the
/// first second (the reference implementation's heuristic for "socat
/// actually bound", since `exec.Command.Start()` succeeds even for a
/// command that immediately fails). The process is intentionally not
/// tracked by handle afterward — its lifecycle is tied to the sandbox's
/// network namespace, torn down by `stop_layer2`'s `pkill`, matching the
/// reference implementation.
pub async fn start_layer2(
    namespace: &str,
    bind_addr: SocketAddrV4,
    target_addr: SocketAddrV4,
) -> Result<u32, NamespaceError> {
    let mut cmd = build_socat_command(namespace, bind_addr, target_addr);
    let mut child = cmd.spawn().map_err(|e| NamespaceError::Spawn(e.to_string()))?;
    let pid = child.id().unwrap_or(0);

    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => {
                    warn!(namespace, pid, %status, "namespace forwarder exited within startup window");
                }
                Err(e) => {
                    warn!(namespace, pid, error = %e, "failed to wait on namespace forwarder");
                }
            }
            Err(NamespaceError::ExitedImmediately)
        }
        _ = tokio::time::sleep(Duration::from_secs(1)) => {
            info!(namespace, pid, bind = %bind_addr, target = %target_addr, "namespace forwarder running");
            // Not awaited further: the process outlives this function and is
            // reaped by pkill (stop_layer2) or namespace teardown.
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            Ok(pid)
        }
    }
}

/// Kills any namespace forwarder bound to `bind_ip`, ignoring failures — the
/// process might already be gone (§4.2 `stopLayer2`).
pub async fn stop_layer2(namespace: &str, bind_ip: Ipv4Addr) {
    let pattern = format!("socat.*bind={bind_ip}");
    let result = Command::new("ip")
        .arg("netns")
        .arg("exec")
        .arg(namespace)
        .arg("pkill")
        .arg("-f")
        .arg(&pattern)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match result {
        Ok(status) if status.success() => debug!(namespace, %bind_ip, "namespace forwarder stopped"),
        Ok(status) => debug!(namespace, %bind_ip, code = ?status.code(), "pkill found no matching process"),
        Err(e) => warn!(namespace, %bind_ip, error = %e, "failed to run pkill against namespace forwarder"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socat_command_uses_netns_exec_and_detached_stdio() {
        let bind = SocketAddrV4::new(Ipv4Addr::new(10, 12, 0, 1), 49983);
        let target = SocketAddrV4::new(Ipv4Addr::new(169, 254, 0, 21), 49983);
        let cmd = build_socat_command("ns-1", bind, target);
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "ip");
        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(args[0], "netns");
        assert_eq!(args[1], "exec");
        assert_eq!(args[2], "ns-1");
        assert_eq!(args[3], "socat");
        assert!(args[4].contains("bind=10.12.0.1"));
        assert!(args[5].contains("169.254.0.21:49983"));
    }

    #[tokio::test]
    async fn start_layer2_reports_immediate_exit() {
        // `false` exits immediately with non-zero; used in place of a real
        // `ip`/`socat` binary to exercise the "exited within the startup
        // window" path without requiring namespace privileges.
        let mut cmd = Command::new("false");
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let mut child = cmd.spawn().unwrap();

        let status = tokio::select! {
            status = child.wait() => status,
            _ = tokio::time::sleep(Duration::from_secs(1)) => panic!("expected immediate exit"),
        };
        assert!(status.is_ok());
    }
}
