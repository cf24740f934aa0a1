use async_trait::async_trait;
use sandbox_contracts::{ClientId, NodeAgentError, SandboxResourceRequest};

/// The coordinator's view of a node agent's `Sandbox.Create` RPC (§6).
///
/// The RPC transport itself (the gRPC service façade) is out of scope here;
/// this trait is the seam a transport implementation plugs into, the same
/// way the teacher's `AgentClient` wraps a tonic channel behind a small set
/// of async methods rather than exposing the channel directly.
#[async_trait]
pub trait NodeAgentClient: Send + Sync {
    async fn create_sandbox(
        &self,
        node_id: &str,
        request: &SandboxResourceRequest,
    ) -> Result<ClientId, NodeAgentError>;
}
