use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use envd::scanner::{Scanner, ScannerFilter};
use envd::Forwarder;

/// Gateway address this process (running inside the guest) binds forwarded
/// ports to — the guest side of the veth pair the bridge sets up outside
/// (§4.2, §4.3).
const SOURCE_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(169, 254, 0, 21));

const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Entry point for the in-guest agent: scans localhost-only TCP listeners
/// and keeps a `socat` forward alive for each one so the host-side bridge
/// can reach them (§4.3). The command/filesystem/exec RPC surface that
/// would normally share this binary is out of scope here (§1).
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("envd port forwarder starting");

    let cancel = CancellationToken::new();
    let scanner = Scanner::new(SCAN_INTERVAL);
    let snapshots = scanner.subscribe(ScannerFilter::default(), cancel.clone());
    let forwarder = Forwarder::new(SOURCE_IP);

    let run = forwarder.run(snapshots);
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, stopping forwarder");
            cancel.cancel();
            run.await;
        }
    }
}
