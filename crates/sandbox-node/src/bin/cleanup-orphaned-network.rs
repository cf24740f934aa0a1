use std::process::ExitCode;

use sandbox_node::cleanup;

/// Standalone sweep for orphaned `ns-*` namespaces and dangling `veth*`
/// devices left behind by a crashed node agent (§6, §12). Intended to run at
/// or before node-agent startup; refuses nothing, only reports failures.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let report = cleanup::cleanup_orphaned_network().await;

    if report.had_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
