pub mod election;
pub mod handle;
pub mod log;
pub mod membership;
pub mod node;
pub mod rpc;
pub mod scheduler;
pub mod state;
pub mod types;

pub use handle::{NodeHandle, NodeStatus};
pub use membership::Membership;
pub use node::{Node, NodeOptions, ReadyCallback};
pub use scheduler::Scheduler;
pub use state::NodeState;
pub use types::{ClusterMember, LogEntry, LogIndex, NodeId, Payload, SnapshotMeta, Term};
