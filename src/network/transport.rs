use std::time::Duration;

use crate::raft::rpc::RaftMessage;
use crate::raft::types::NodeId;

/// A message delivered to this node
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub from: NodeId,
    pub message: RaftMessage,
}

/// Moves Raft messages between nodes.
///
/// Sending never blocks and never fails: undeliverable messages are dropped
/// and the protocol retransmits. Peers are addressed by their node id, which
/// is also their network address.
pub trait Transport: Send {
    /// Queue `message` for `to`, connecting on first use
    fn send(&mut self, to: &NodeId, message: RaftMessage);

    /// Forget a peer and tear down its connection
    fn remove_peer(&mut self, peer: &NodeId);

    /// Drain messages that already arrived, without blocking
    fn poll(&mut self) -> Vec<InboundMessage>;

    /// Block until a message arrives or `timeout` passes, then drain
    fn wait(&mut self, timeout: Duration) -> Vec<InboundMessage>;

    /// Whether an outbound connection to `peer` is currently up
    fn is_connected(&self, peer: &NodeId) -> bool;

    fn shutdown(&mut self) {}
}
