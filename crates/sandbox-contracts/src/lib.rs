pub mod client;
pub mod error;
pub mod node_metrics;
pub mod resources;

pub use client::ClientId;
pub use error::NodeAgentError;
pub use node_metrics::{NodeMetricsSnapshot, NodeStatus};
pub use resources::{MachineArch, MachineInfo, SandboxResourceRequest};
