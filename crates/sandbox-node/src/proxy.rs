use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{self, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Retry/timeout tunables for one proxy instance (§4.1, §5).
#[derive(Debug, Clone, Copy)]
pub struct ProxyConfig {
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub dial_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_interval: Duration::from_millis(500),
            dial_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyStats {
    pub active_connections: i64,
    pub total_connections: u64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
}

#[derive(Default)]
struct ProxyCounters {
    active: AtomicI64,
    total: AtomicU64,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
}

impl ProxyCounters {
    fn snapshot(&self) -> ProxyStats {
        ProxyStats {
            active_connections: self.active.load(Ordering::SeqCst),
            total_connections: self.total.load(Ordering::SeqCst),
            bytes_rx: self.bytes_rx.load(Ordering::SeqCst),
            bytes_tx: self.bytes_tx.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    AlreadyRunning,
    Bind(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::AlreadyRunning => write!(f, "proxy is already running"),
            ProxyError::Bind(msg) => write!(f, "failed to bind proxy listener: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

struct RunningProxy {
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    tracker: TaskTracker,
    local_addr: SocketAddr,
}

/// A reusable TCP proxy: binds a listen address, accepts connections, and
/// forwards each to a fixed target with retry-on-dial-failure (§4.1).
///
/// One instance serves one listen/target pair for its whole life; starting
/// it again after a stop requires a fresh `TcpProxy`, matching the
/// reference implementation's one-shot `Start`/`Stop` pair.
pub struct TcpProxy {
    name: String,
    target_addr: SocketAddr,
    config: ProxyConfig,
    counters: Arc<ProxyCounters>,
    running: Mutex<Option<RunningProxy>>,
}

impl TcpProxy {
    pub fn new(name: impl Into<String>, target_addr: SocketAddr, config: ProxyConfig) -> Self {
        Self {
            name: name.into(),
            target_addr,
            config,
            counters: Arc::new(ProxyCounters::default()),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binds `listen_addr` and starts the accept loop on a background task.
    /// Returns the bound address (useful when `listen_addr`'s port is 0).
    pub async fn start(&self, listen_addr: SocketAddr) -> Result<SocketAddr, ProxyError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| ProxyError::Bind(e.to_string()))?;
        let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind(e.to_string()))?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let accept_task = tokio::spawn(accept_loop(
            self.name.clone(),
            listener,
            self.target_addr,
            self.config,
            self.counters.clone(),
            cancel.clone(),
            tracker.clone(),
        ));

        info!(name = %self.name, listen = %local_addr, target = %self.target_addr, "proxy started");

        *running = Some(RunningProxy { cancel, accept_task, tracker, local_addr });
        Ok(local_addr)
    }

    /// Idempotent: stopping a proxy that isn't running is a no-op. Cancels
    /// the accept loop, closes the listener, and waits up to
    /// `config.stop_timeout` for in-flight connections to drain (§4.1).
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(state) = running.take() else {
            return;
        };

        state.cancel.cancel();
        let _ = state.accept_task.await;

        state.tracker.close();
        if tokio::time::timeout(self.config.stop_timeout, state.tracker.wait())
            .await
            .is_err()
        {
            warn!(name = %self.name, "proxy stop timed out waiting for connections to drain");
        }

        info!(name = %self.name, "proxy stopped");
    }

    pub fn stats(&self) -> ProxyStats {
        self.counters.snapshot()
    }

    pub async fn is_healthy(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }
}

async fn accept_loop(
    name: String,
    listener: TcpListener,
    target_addr: SocketAddr,
    config: ProxyConfig,
    counters: Arc<ProxyCounters>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(name = %name, "accept loop cancelled");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((conn, peer)) => {
                        counters.total.fetch_add(1, Ordering::SeqCst);
                        counters.active.fetch_add(1, Ordering::SeqCst);

                        let name = name.clone();
                        let counters = counters.clone();
                        let cancel = cancel.clone();

                        tracker.spawn(async move {
                            handle_connection_with_retry(&name, conn, peer, target_addr, config, &counters, cancel).await;
                            counters.active.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        // Transient accept errors (e.g. FD exhaustion) must not kill the proxy.
                        warn!(name = %name, error = %e, "accept error, continuing");
                    }
                }
            }
        }
    }
}

async fn handle_connection_with_retry(
    name: &str,
    mut client: TcpStream,
    peer: SocketAddr,
    target_addr: SocketAddr,
    config: ProxyConfig,
    counters: &ProxyCounters,
    cancel: CancellationToken,
) {
    let mut target = None;

    for attempt in 0..config.max_retries {
        if cancel.is_cancelled() {
            return;
        }

        match tokio::time::timeout(config.dial_timeout, TcpStream::connect(target_addr)).await {
            Ok(Ok(stream)) => {
                target = Some(stream);
                break;
            }
            Ok(Err(e)) => {
                debug!(name = %name, peer = %target_addr, attempt, error = %e, "dial failed, retrying");
            }
            Err(_) => {
                debug!(name = %name, peer = %target_addr, attempt, "dial timed out, retrying");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.retry_interval) => {}
            _ = cancel.cancelled() => return,
        }
    }

    let Some(target) = target else {
        error!(name = %name, peer = %target_addr, "exhausted retries dialing target, dropping client connection");
        let _ = client.shutdown().await;
        return;
    };

    debug!(name = %name, client = %peer, target = %target_addr, "connection established");
    copy_bidirectional(client, target, counters, cancel).await;
}

async fn copy_bidirectional(
    client: TcpStream,
    target: TcpStream,
    counters: &ProxyCounters,
    cancel: CancellationToken,
) {
    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut target_rd, mut target_wr) = target.into_split();

    let client_to_target = async {
        let n = io::copy(&mut client_rd, &mut target_wr).await;
        let _ = target_wr.shutdown().await;
        n
    };
    let target_to_client = async {
        let n = io::copy(&mut target_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
        n
    };

    tokio::select! {
        result = client_to_target => {
            if let Ok(n) = result {
                counters.bytes_tx.fetch_add(n, Ordering::SeqCst);
            }
        }
        result = target_to_client => {
            if let Ok(n) = result {
                counters.bytes_rx.fetch_add(n, Ordering::SeqCst);
            }
        }
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};

    #[tokio::test]
    async fn round_trips_bytes_in_both_directions() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = target_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"world").await.unwrap();
        });

        let proxy = TcpProxy::new("test", target_addr, ProxyConfig::default());
        let listen_addr = proxy.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut response = [0u8; 5];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"world");

        proxy.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        tokio::spawn(async move { while target_listener.accept().await.is_ok() {} });

        let proxy = TcpProxy::new("test", target_addr, ProxyConfig::default());
        proxy.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        proxy.stop().await;
        proxy.stop().await;

        assert!(!proxy.is_healthy().await);
    }

    #[tokio::test]
    async fn is_healthy_reflects_running_state() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        tokio::spawn(async move { while target_listener.accept().await.is_ok() {} });

        let proxy = TcpProxy::new("test", target_addr, ProxyConfig::default());
        assert!(!proxy.is_healthy().await);

        proxy.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(proxy.is_healthy().await);

        proxy.stop().await;
        assert!(!proxy.is_healthy().await);
    }

    #[tokio::test]
    async fn starting_twice_without_stop_errors() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        tokio::spawn(async move { while target_listener.accept().await.is_ok() {} });

        let proxy = TcpProxy::new("test", target_addr, ProxyConfig::default());
        proxy.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let second = proxy.start("127.0.0.1:0".parse().unwrap()).await;
        assert_eq!(second.unwrap_err(), ProxyError::AlreadyRunning);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn retries_dial_until_target_becomes_available() {
        // Reserve a port, then close it immediately so the first dial attempt fails.
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = reserved.local_addr().unwrap();
        drop(reserved);

        let config = ProxyConfig {
            max_retries: 10,
            retry_interval: Duration::from_millis(50),
            dial_timeout: Duration::from_millis(200),
            stop_timeout: Duration::from_secs(5),
        };

        let proxy = TcpProxy::new("test", target_addr, config);
        let listen_addr = proxy.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let client_task = tokio::spawn(async move {
            let mut client = TcpStream::connect(listen_addr).await.unwrap();
            let mut buf = [0u8; 2];
            client.write_all(b"hi").await.unwrap();
            client.read_exact(&mut buf).await.unwrap();
            buf
        });

        // Bring the target up after the proxy has already accepted and started retrying.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let target_listener = TcpListener::bind(target_addr).await.unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = target_listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"ok").await.unwrap();
        });

        let response = tokio::time::timeout(Duration::from_secs(3), client_task)
            .await
            .expect("client task timed out")
            .unwrap();
        assert_eq!(&response, b"ok");

        proxy.stop().await;
    }

    #[tokio::test]
    async fn stats_track_total_and_active_connections() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = target_listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1];
                    let _ = conn.read_exact(&mut buf).await;
                });
            }
        });

        let proxy = TcpProxy::new("test", target_addr, ProxyConfig::default());
        let listen_addr = proxy.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = proxy.stats();
        assert_eq!(stats.total_connections, 1);

        drop(client);
        proxy.stop().await;
    }
}
