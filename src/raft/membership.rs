//! Cluster membership and quorum arithmetic.
//!
//! Changes arrive as committed log entries and swap the member set in one
//! step. There is no joint-consensus phase, so while a change is in flight
//! the old and new configurations can each assemble a quorum that does not
//! intersect the other; two leaders may then coexist for a short while.

use super::types::{ClusterMember, NodeId, Payload};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    self_id: NodeId,
    /// address -> voting
    members: BTreeMap<NodeId, bool>,
}

impl Membership {
    /// Static cluster: this node plus `peers`, all voting
    pub fn new(self_id: NodeId, peers: &[NodeId]) -> Self {
        let mut members = BTreeMap::new();
        members.insert(self_id.clone(), true);
        for peer in peers {
            members.insert(peer.clone(), true);
        }
        Self { self_id, members }
    }

    pub fn from_members(self_id: NodeId, list: &[ClusterMember]) -> Self {
        let members = list
            .iter()
            .map(|m| (m.address.clone(), m.voting))
            .collect();
        Self { self_id, members }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn members(&self) -> Vec<ClusterMember> {
        self.members
            .iter()
            .map(|(address, voting)| ClusterMember {
                address: address.clone(),
                voting: *voting,
            })
            .collect()
    }

    pub fn addresses(&self) -> Vec<NodeId> {
        self.members.keys().cloned().collect()
    }

    /// Every member except this node
    pub fn peers(&self) -> Vec<NodeId> {
        self.members
            .keys()
            .filter(|id| **id != self.self_id)
            .cloned()
            .collect()
    }

    pub fn is_voter(&self, id: &NodeId) -> bool {
        self.members.get(id).copied().unwrap_or(false)
    }

    pub fn self_is_voter(&self) -> bool {
        self.is_voter(&self.self_id)
    }

    pub fn voter_count(&self) -> usize {
        self.members.values().filter(|voting| **voting).count()
    }

    /// Strict majority of voting members
    pub fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Do the given nodes form a quorum? Non-voters are ignored.
    pub fn is_quorum<'a>(&self, nodes: impl IntoIterator<Item = &'a NodeId>) -> bool {
        let mut seen: Vec<&NodeId> = nodes.into_iter().filter(|id| self.is_voter(id)).collect();
        seen.sort();
        seen.dedup();
        self.voter_count() > 0 && seen.len() >= self.quorum()
    }

    /// Apply a committed membership entry; returns true if the set changed
    pub fn apply(&mut self, payload: &Payload) -> bool {
        match payload {
            Payload::AddMember(member) => {
                let previous = self.members.insert(member.address.clone(), member.voting);
                previous != Some(member.voting)
            }
            Payload::RemoveMember(address) => self.members.remove(address).is_some(),
            _ => false,
        }
    }
}
