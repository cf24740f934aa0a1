use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::scanner::{AddressFamily, ListeningPort};

const DEFAULT_SOCAT_PATH: &str = "/usr/bin/socat";

/// Failure starting one port's `socat` forward. Never propagated past
/// `reconcile` — a failed forward for one port must not stall forwarding of
/// others (§4.3, §7), so this is logged at the call site and the port is
/// retried on the next scan pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwarderError {
    Spawn(String),
}

impl fmt::Display for ForwarderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwarderError::Spawn(msg) => write!(f, "failed to spawn port forward: {msg}"),
        }
    }
}

impl std::error::Error for ForwarderError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortState {
    Forward,
    Delete,
}

struct PortForward {
    pid: i32,
    port: u16,
    family: AddressFamily,
    state: PortState,
    process: Option<Child>,
}

/// Forwards traffic from a per-sandbox source IP to every TCP port a guest
/// process has bound on localhost, by supervising one `socat` per port
/// (§4.3). Not thread-safe — `run` owns the only mutable reference to its
/// port table and is meant to run on a single task.
pub struct Forwarder {
    source_ip: IpAddr,
    socat_path: PathBuf,
    cgroup_procs_path: Option<PathBuf>,
    ports: HashMap<(i32, u16), PortForward>,
}

impl Forwarder {
    pub fn new(source_ip: IpAddr) -> Self {
        Self {
            source_ip,
            socat_path: resolve_socat_path(),
            cgroup_procs_path: None,
            ports: HashMap::new(),
        }
    }

    /// Attaches every forwarder process to the given cgroup for resource
    /// accounting, best effort, mirroring the original's optional cgroup
    /// manager attachment (§12).
    pub fn with_cgroup(mut self, cgroup_procs_path: PathBuf) -> Self {
        self.cgroup_procs_path = Some(cgroup_procs_path);
        self
    }

    /// Consumes scan snapshots until the channel closes, then tears down
    /// every forward still running (§4.3, §5).
    pub async fn run(mut self, mut snapshots: mpsc::Receiver<Vec<ListeningPort>>) {
        while let Some(snapshot) = snapshots.recv().await {
            self.reconcile(snapshot).await;
        }
        self.teardown_all();
    }

    /// One diff pass: mark everything `Delete`, mark survivors and new
    /// arrivals `Forward`, then stop whatever is still marked `Delete`.
    async fn reconcile(&mut self, snapshot: Vec<ListeningPort>) {
        for forward in self.ports.values_mut() {
            forward.state = PortState::Delete;
        }

        for port in snapshot {
            let key = (port.pid, port.port);
            if let Some(existing) = self.ports.get_mut(&key) {
                existing.state = PortState::Forward;
                continue;
            }

            debug!(
                pid = port.pid,
                port = port.port,
                "detected new opened port on localhost that is not forwarded"
            );

            let mut forward = PortForward {
                pid: port.pid,
                port: port.port,
                family: port.family,
                state: PortState::Forward,
                process: None,
            };
            if let Err(e) = self.start(&mut forward) {
                warn!(pid = forward.pid, port = forward.port, error = %e, "failed to start port forward");
            }
            self.ports.insert(key, forward);
        }

        let stale: Vec<(i32, u16)> = self
            .ports
            .iter()
            .filter(|(_, forward)| forward.state == PortState::Delete)
            .map(|(key, _)| *key)
            .collect();

        for key in stale {
            if let Some(forward) = self.ports.remove(&key) {
                self.stop(forward);
            }
        }
    }

    fn start(&self, forward: &mut PortForward) -> Result<(), ForwarderError> {
        let listen_spec = format!(
            "TCP4-LISTEN:{},bind={},reuseaddr,fork",
            forward.port, self.source_ip
        );
        let target_spec = format!(
            "TCP{}:localhost:{}",
            forward.family.ip_version(),
            forward.port
        );

        // Built with std::process::Command, not tokio's, so pre_exec is
        // available; converted to a tokio Command just before spawn (tokio
        // carries pre_exec hooks through but doesn't expose the trait
        // itself).
        let mut cmd = std::process::Command::new(&self.socat_path);
        cmd.arg(&listen_spec)
            .arg(&target_spec)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New process group, so `stop` can kill the whole socat tree at once.
            cmd.process_group(0);

            if let Some(cgroup_path) = self.cgroup_procs_path.clone() {
                unsafe {
                    cmd.pre_exec(move || {
                        std::fs::write(&cgroup_path, std::process::id().to_string())?;
                        Ok(())
                    });
                }
            }
        }

        debug!(
            pid = forward.pid,
            port = forward.port,
            listen_spec = %listen_spec,
            target_spec = %target_spec,
            "starting port forward"
        );

        let mut tokio_cmd = tokio::process::Command::from(cmd);
        match tokio_cmd.spawn() {
            Ok(child) => {
                info!(pid = forward.pid, port = forward.port, "port forward started");
                forward.process = Some(child);
                Ok(())
            }
            Err(e) => Err(ForwarderError::Spawn(e.to_string())),
        }
    }

    fn stop(&self, mut forward: PortForward) {
        let Some(child) = forward.process.take() else {
            return;
        };
        let Some(child_pid) = child.id() else {
            return;
        };

        debug!(pid = forward.pid, port = forward.port, "stopping port forward");

        // socat was launched as its own process group leader, so its pid
        // doubles as the pgid; killing `-pgid` takes down any children too.
        match signal::kill(Pid::from_raw(-(child_pid as i32)), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!(
                pid = child_pid,
                error = %e,
                "failed to kill port forward process group"
            ),
        }
    }

    fn teardown_all(&mut self) {
        let keys: Vec<(i32, u16)> = self.ports.keys().copied().collect();
        for key in keys {
            if let Some(forward) = self.ports.remove(&key) {
                self.stop(forward);
            }
        }
    }
}

/// Checks `/usr/bin/socat` first, then falls back to `$PATH`.
fn resolve_socat_path() -> PathBuf {
    if Path::new(DEFAULT_SOCAT_PATH).exists() {
        return PathBuf::from(DEFAULT_SOCAT_PATH);
    }

    warn!(path = DEFAULT_SOCAT_PATH, "socat not found, trying PATH");

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join("socat");
            if candidate.exists() {
                return candidate;
            }
        }
    }

    PathBuf::from("socat")
}
