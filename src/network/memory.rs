//! In-process network for deterministic cluster tests.
//!
//! Every node registered with a `MemoryNetwork` gets a mailbox. Links can be
//! cut in both directions to simulate partitions and healed again later.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::transport::{InboundMessage, Transport};
use crate::raft::rpc::RaftMessage;
use crate::raft::types::NodeId;

#[derive(Default)]
struct Hub {
    mailboxes: HashMap<NodeId, Sender<InboundMessage>>,
    /// Unordered pairs that cannot talk
    cut: HashSet<(NodeId, NodeId)>,
}

impl Hub {
    fn link(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        !self.cut.contains(&Self::link(from, to))
    }
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node; a second registration replaces the first mailbox
    pub fn register(&self, id: impl Into<NodeId>) -> MemoryTransport {
        let id = id.into();
        let (tx, rx) = crossbeam_channel::unbounded();
        self.hub.lock().mailboxes.insert(id.clone(), tx);
        MemoryTransport {
            id,
            hub: self.hub.clone(),
            rx,
        }
    }

    pub fn disconnect(&self, a: &str, b: &str) {
        let link = Hub::link(&a.to_string(), &b.to_string());
        self.hub.lock().cut.insert(link);
    }

    /// Cut `id` off from every other registered node
    pub fn isolate(&self, id: &str) {
        let mut hub = self.hub.lock();
        let others: Vec<NodeId> = hub
            .mailboxes
            .keys()
            .filter(|other| other.as_str() != id)
            .cloned()
            .collect();
        for other in others {
            let link = Hub::link(&id.to_string(), &other);
            hub.cut.insert(link);
        }
    }

    /// Split the cluster in two groups that cannot reach each other
    pub fn partition(&self, left: &[&str], right: &[&str]) {
        for a in left {
            for b in right {
                self.disconnect(a, b);
            }
        }
    }

    pub fn heal(&self) {
        self.hub.lock().cut.clear();
    }
}

pub struct MemoryTransport {
    id: NodeId,
    hub: Arc<Mutex<Hub>>,
    rx: Receiver<InboundMessage>,
}

impl Transport for MemoryTransport {
    fn send(&mut self, to: &NodeId, message: RaftMessage) {
        let hub = self.hub.lock();
        if !hub.reachable(&self.id, to) {
            return;
        }
        if let Some(mailbox) = hub.mailboxes.get(to) {
            let _ = mailbox.send(InboundMessage {
                from: self.id.clone(),
                message,
            });
        }
    }

    fn remove_peer(&mut self, _peer: &NodeId) {}

    fn poll(&mut self) -> Vec<InboundMessage> {
        self.rx.try_iter().collect()
    }

    fn wait(&mut self, timeout: Duration) -> Vec<InboundMessage> {
        match self.rx.recv_timeout(timeout) {
            Ok(first) => {
                let mut messages = vec![first];
                messages.extend(self.rx.try_iter());
                messages
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Vec::new(),
        }
    }

    fn is_connected(&self, peer: &NodeId) -> bool {
        let hub = self.hub.lock();
        hub.mailboxes.contains_key(peer) && hub.reachable(&self.id, peer)
    }
}
