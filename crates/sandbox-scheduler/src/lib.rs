pub mod agent_client;
pub mod config;
pub mod coordinator;
pub mod id;
pub mod node_view;
pub mod placement;

pub use agent_client::NodeAgentClient;
pub use config::{PlacementConfig, PlacementConfigHandle};
pub use coordinator::{CoordinatorError, PlacementCoordinator};
pub use node_view::{NodeView, NodeViewCache};
pub use placement::{choose_node, fits, score, PlacementCandidate, PlacementError};
