use serde::{Deserialize, Serialize};

/// Type alias for term numbers
pub type Term = u64;

/// Type alias for log indices
pub type LogIndex = u64;

/// Node identifier, the `host:port` address peers dial
pub type NodeId = String;

/// A cluster member and whether it takes part in elections and quorums
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ClusterMember {
    pub address: NodeId,
    pub voting: bool,
}

impl ClusterMember {
    pub fn voter(address: impl Into<NodeId>) -> Self {
        Self {
            address: address.into(),
            voting: true,
        }
    }
}

/// What a log entry carries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Payload {
    /// Appended by a fresh leader so earlier-term entries can commit
    NoOp,
    /// Opaque application command
    Application(Vec<u8>),
    AddMember(ClusterMember),
    RemoveMember(NodeId),
}

impl Payload {
    /// Approximate encoded size, used for batching
    pub fn size_hint(&self) -> usize {
        match self {
            Payload::NoOp => 1,
            Payload::Application(data) => data.len() + 9,
            Payload::AddMember(member) => member.address.len() + 10,
            Payload::RemoveMember(address) => address.len() + 9,
        }
    }

    pub fn is_membership_change(&self) -> bool {
        matches!(self, Payload::AddMember(_) | Payload::RemoveMember(_))
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log
    pub index: LogIndex,
    /// The command payload
    pub payload: Payload,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, payload: Payload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    pub fn application(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self::new(term, index, Payload::Application(data))
    }

    /// Encoded size of the entry on the wire (approximate)
    pub fn size_hint(&self) -> usize {
        16 + self.payload.size_hint()
    }
}

/// Snapshot position: everything up to `last_included_index` is folded in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
}
