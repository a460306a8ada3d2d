use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

use super::state::NodeState;
use super::types::{ClusterMember, LogIndex, NodeId, Payload, Term};
use crate::client::{CommandHandle, CommandSubmitter, FailReason};
use crate::util::errors::{RaftError, Result};

/// Snapshot of a node's progress, refreshed at the end of every tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub self_id: NodeId,
    pub state: NodeState,
    pub current_term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    /// Entries held since the last compaction
    pub log_len: usize,
    pub snapshot_index: LogIndex,
    pub members: Vec<ClusterMember>,
    pub connected_peers: Vec<NodeId>,
    pub queue_len: usize,
    pub ready: bool,
    pub serializing: bool,
}

impl NodeStatus {
    pub fn initial(self_id: NodeId) -> Self {
        Self {
            self_id,
            state: NodeState::Follower,
            current_term: 0,
            leader: None,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            log_len: 0,
            snapshot_index: 0,
            members: Vec::new(),
            connected_peers: Vec::new(),
            queue_len: 0,
            ready: false,
            serializing: false,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }
}

/// Thread-safe access to a running node.
///
/// Submitting only enqueues; the outcome arrives through the returned
/// `CommandHandle` once a tick decides it.
#[derive(Clone)]
pub struct NodeHandle {
    self_id: NodeId,
    submitter: CommandSubmitter,
    status: Arc<RwLock<NodeStatus>>,
    dynamic_membership: bool,
    max_command_size: usize,
}

impl NodeHandle {
    pub(crate) fn new(
        self_id: NodeId,
        submitter: CommandSubmitter,
        status: Arc<RwLock<NodeStatus>>,
        dynamic_membership: bool,
        max_command_size: usize,
    ) -> Self {
        Self {
            self_id,
            submitter,
            status,
            dynamic_membership,
            max_command_size,
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Replicate an application command. Commands over `max_command_size`
    /// fail with `CommandTooLarge` without being queued.
    pub fn submit(&self, command: Vec<u8>) -> CommandHandle {
        if command.len() > self.max_command_size {
            tracing::debug!(
                "Rejecting {} byte command, limit is {}",
                command.len(),
                self.max_command_size
            );
            let (responder, handle) = CommandHandle::channel();
            responder.respond(Err(FailReason::CommandTooLarge));
            return handle;
        }
        self.submitter.submit(Payload::Application(command))
    }

    pub fn add_member(&self, member: ClusterMember) -> Result<CommandHandle> {
        self.check_dynamic()?;
        Ok(self.submitter.submit(Payload::AddMember(member)))
    }

    pub fn remove_member(&self, address: impl Into<NodeId>) -> Result<CommandHandle> {
        self.check_dynamic()?;
        Ok(self.submitter.submit(Payload::RemoveMember(address.into())))
    }

    pub fn status(&self) -> NodeStatus {
        self.status.read().clone()
    }

    fn check_dynamic(&self) -> Result<()> {
        if self.dynamic_membership {
            Ok(())
        } else {
            Err(RaftError::InvalidState(
                "dynamic membership change is disabled".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CommandQueue;
    use std::time::Duration;

    #[test]
    fn test_membership_requests_need_dynamic_mode() {
        let queue = CommandQueue::new(4);
        let status = Arc::new(RwLock::new(NodeStatus::initial("a".into())));
        let handle = NodeHandle::new("a".into(), queue.submitter(), status.clone(), false, 64);

        assert!(matches!(
            handle.add_member(ClusterMember::voter("b")),
            Err(RaftError::InvalidState(_))
        ));
        assert!(handle.remove_member("b").is_err());
        assert!(queue.is_empty());

        let dynamic = NodeHandle::new("a".into(), queue.submitter(), status, true, 64);
        let pending = dynamic.add_member(ClusterMember::voter("b")).unwrap();
        assert_eq!(queue.len(), 1);

        queue.drain(FailReason::Discarded);
        assert_eq!(
            pending.wait(Duration::from_millis(10)),
            Some(Err(FailReason::Discarded))
        );
    }

    #[test]
    fn test_oversized_command_is_not_queued() {
        let queue = CommandQueue::new(4);
        let status = Arc::new(RwLock::new(NodeStatus::initial("a".into())));
        let handle = NodeHandle::new("a".into(), queue.submitter(), status, false, 8);

        let rejected = handle.submit(vec![0; 9]);
        assert_eq!(rejected.try_result(), Some(Err(FailReason::CommandTooLarge)));
        assert!(queue.is_empty());

        let accepted = handle.submit(vec![0; 8]);
        assert!(accepted.try_result().is_none());
        assert_eq!(queue.len(), 1);
    }
}
