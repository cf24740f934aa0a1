use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Hex code for `TCP_LISTEN` as it appears in the `st` column of
/// `/proc/net/tcp{,6}`.
const TCP_LISTEN_STATE: &str = "0A";

/// Failures a single scan pass can hit. Neither variant stops the scanner —
/// a pass that can't read one of the two proc tables still reports
/// whatever it found in the other, logging this error instead of
/// propagating it (§4.3, §7: the forwarder side never surfaces errors to a
/// caller, and the scanner feeding it follows the same policy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerError {
    ProcRead(String),
}

impl fmt::Display for ScannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScannerError::ProcRead(msg) => write!(f, "failed to read proc tcp table: {msg}"),
        }
    }
}

impl std::error::Error for ScannerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn ip_version(self) -> u8 {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningPort {
    pub pid: i32,
    pub port: u16,
    pub address: IpAddr,
    pub family: AddressFamily,
}

/// Which sockets a subscriber wants to see from a scan pass.
///
/// The default excludes `0.0.0.0`/`::` on purpose: a service already bound
/// to all interfaces is reachable without a forward, so only genuinely
/// loopback-only listeners need one (§4.3).
#[derive(Debug, Clone)]
pub struct ScannerFilter {
    pub ips: Vec<IpAddr>,
    pub state: &'static str,
}

impl Default for ScannerFilter {
    fn default() -> Self {
        Self {
            ips: vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
            state: TCP_LISTEN_STATE,
        }
    }
}

struct RawTcpEntry {
    local_addr: IpAddr,
    local_port: u16,
    state: String,
    inode: u64,
    family: AddressFamily,
}

fn hex_to_ipv4(hex: &str) -> Option<Ipv4Addr> {
    if hex.len() != 8 {
        return None;
    }
    let word = u32::from_str_radix(hex, 16).ok()?;
    let bytes = word.to_le_bytes();
    Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
}

/// `/proc/net/tcp6` prints the address as four 32-bit words, each word
/// itself stored in the machine's native (little-endian) order. Reversing
/// each 4-byte chunk independently, then concatenating in order, recovers
/// the real 16-byte address.
fn hex_to_ipv6(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 16];
    for i in 0..4 {
        let chunk = &hex[i * 8..i * 8 + 8];
        let word = u32::from_str_radix(chunk, 16).ok()?;
        bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    Some(Ipv6Addr::from(bytes))
}

fn parse_tcp_line(line: &str, family: AddressFamily) -> Option<RawTcpEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }

    let (ip_hex, port_hex) = fields[1].split_once(':')?;
    let local_addr = match family {
        AddressFamily::V4 => IpAddr::V4(hex_to_ipv4(ip_hex)?),
        AddressFamily::V6 => IpAddr::V6(hex_to_ipv6(ip_hex)?),
    };
    let local_port = u16::from_str_radix(port_hex, 16).ok()?;
    let state = fields[3].to_string();
    let inode: u64 = fields[9].parse().ok()?;

    Some(RawTcpEntry {
        local_addr,
        local_port,
        state,
        inode,
        family,
    })
}

fn parse_tcp_table(content: &str, family: AddressFamily) -> Vec<RawTcpEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| parse_tcp_line(line, family))
        .collect()
}

fn parse_socket_inode(link: &Path) -> Option<u64> {
    let s = link.to_str()?;
    let inner = s.strip_prefix("socket:[")?.strip_suffix(']')?;
    inner.parse().ok()
}

/// Maps every open socket inode on the host to the pid that holds it, by
/// walking `/proc/<pid>/fd/*` and reading the `socket:[inode]` symlinks.
/// Processes that disappear mid-scan, or whose `/proc/<pid>/fd` we can't
/// read (permissions, already exited), are silently skipped.
fn map_inode_to_pid() -> HashMap<u64, i32> {
    let mut map = HashMap::new();

    let Ok(proc_entries) = fs::read_dir("/proc") else {
        return map;
    };

    for entry in proc_entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<i32>().ok())
        else {
            continue;
        };

        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };

        for fd in fds.flatten() {
            if let Ok(link) = fs::read_link(fd.path()) {
                if let Some(inode) = parse_socket_inode(&link) {
                    map.entry(inode).or_insert(pid);
                }
            }
        }
    }

    map
}

fn is_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

fn read_proc_tcp_table(path: &str) -> Result<String, ScannerError> {
    fs::read_to_string(path).map_err(|e| ScannerError::ProcRead(format!("{path}: {e}")))
}

/// Scans `/proc/net/tcp` and `/proc/net/tcp6` for sockets in `LISTEN` state
/// bound to a loopback address, and resolves each to its owning pid (§4.3).
///
/// Sockets bound to `0.0.0.0` or `::` are never returned — they're already
/// reachable without a forward. A table this process can't read (missing
/// IPv6 support, permissions) is logged and skipped rather than failing the
/// whole scan — the other table's listeners still get reported.
pub fn scan_listening_localhost_ports() -> Vec<ListeningPort> {
    let mut raw = Vec::new();

    match read_proc_tcp_table("/proc/net/tcp") {
        Ok(content) => raw.extend(parse_tcp_table(&content, AddressFamily::V4)),
        Err(e) => debug!(error = %e, "skipping ipv4 tcp table"),
    }
    match read_proc_tcp_table("/proc/net/tcp6") {
        Ok(content) => raw.extend(parse_tcp_table(&content, AddressFamily::V6)),
        Err(e) => debug!(error = %e, "skipping ipv6 tcp table"),
    }

    let listening: Vec<_> = raw
        .into_iter()
        .filter(|e| e.state.eq_ignore_ascii_case(TCP_LISTEN_STATE))
        .filter(|e| is_loopback(e.local_addr))
        .collect();

    if listening.is_empty() {
        return Vec::new();
    }

    let inode_to_pid = map_inode_to_pid();

    listening
        .into_iter()
        .filter_map(|e| {
            let pid = *inode_to_pid.get(&e.inode)?;
            Some(ListeningPort {
                pid,
                port: e.local_port,
                address: e.local_addr,
                family: e.family,
            })
        })
        .collect()
}

/// Periodically samples listening localhost ports and publishes snapshots
/// to subscribers, mirroring the scanner/subscriber split of the original
/// port-forwarding service (§4.3).
pub struct Scanner {
    interval: Duration,
}

impl Scanner {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Spawns the scan loop and returns the subscriber's channel. The loop
    /// exits once `cancel` fires or the receiver is dropped.
    pub fn subscribe(
        &self,
        filter: ScannerFilter,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Vec<ListeningPort>> {
        let (tx, rx) = mpsc::channel(4);
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("port scanner cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        let snapshot: Vec<_> = scan_listening_localhost_ports()
                            .into_iter()
                            .filter(|p| filter.ips.contains(&p.address))
                            .collect();
                        if tx.send(snapshot).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }
}
