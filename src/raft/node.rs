//! The consensus engine.
//!
//! A `Node` owns every piece of protocol state and only changes it inside
//! `tick`. Each tick drains the transport, runs the election and heartbeat
//! timers, moves queued commands into the log (or forwards them to the
//! leader), applies committed entries and drives log compaction.

use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::election::{
    create_request_vote, handle_request_vote, handle_request_vote_response, persist_hard_state,
};
use super::handle::{NodeHandle, NodeStatus};
use super::log::{
    advance_commit_index, create_append_entries, handle_append_entries,
    handle_append_entries_response,
};
use super::membership::Membership;
use super::rpc::{
    AppendEntriesResponse, ApplyCommandRequest, ApplyCommandResponse, InstallSnapshotRequest,
    RaftMessage,
};
use super::state::RaftState;
use super::types::{LogIndex, NodeId, Payload, SnapshotMeta};
use crate::application::StateMachine;
use crate::client::{CommandQueue, FailReason, PendingCommand};
use crate::config::Config;
use crate::network::{InboundMessage, Transport};
use crate::storage::{
    BuiltinSerializer, CompactionPolicy, FileJournal, Journal, LogStore, MemoryJournal,
    SerializerState, SerializerStrategy, SnapshotData, SnapshotDeserializer, SnapshotManager,
    SnapshotSerializer,
};
use crate::util::errors::{RaftError, Result};

pub type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Options that cannot live in a config file
#[derive(Default)]
pub struct NodeOptions {
    /// Called once, after the node first caught up with the cluster
    pub on_ready: Option<ReadyCallback>,
    /// Custom full-dump writer; needs `deserializer` and `full_dump_file`
    pub serializer: Option<Box<dyn SnapshotSerializer>>,
    pub deserializer: Option<Box<dyn SnapshotDeserializer>>,
}

/// Snapshot chunks being received from a leader
struct IncomingSnapshot {
    leader: NodeId,
    meta: SnapshotMeta,
    data: Vec<u8>,
}

pub struct Node {
    config: Config,
    state: RaftState,
    log: LogStore,
    membership: Membership,
    transport: Box<dyn Transport>,
    state_machine: Box<dyn StateMachine>,
    snapshots: SnapshotManager,
    queue: CommandQueue,
    status: Arc<RwLock<NodeStatus>>,

    on_ready: Option<ReadyCallback>,
    ready: bool,

    election_deadline: Instant,
    next_heartbeat: Instant,
    /// New entries wait for replication at the end of the tick
    replicate_now: bool,

    /// Commands with a known log position, resolved when that index applies
    pending: BTreeMap<LogIndex, PendingCommand>,
    /// Commands forwarded to the leader and not answered yet
    forwarded: HashMap<u64, PendingCommand>,
    next_request_id: u64,
    was_leader: bool,
    known_leader: Option<NodeId>,

    incoming_snapshot: Option<IncomingSnapshot>,
    encoded_snapshot: Option<(SnapshotMeta, Arc<Vec<u8>>)>,
}

impl Node {
    /// Build a node, restoring the full dump and journal if configured
    pub fn new(
        self_id: impl Into<NodeId>,
        peers: &[NodeId],
        config: Config,
        state_machine: Box<dyn StateMachine>,
        transport: Box<dyn Transport>,
        options: NodeOptions,
    ) -> Result<Self> {
        config.validate()?;
        let self_id = self_id.into();

        let NodeOptions {
            on_ready,
            serializer,
            deserializer,
        } = options;

        let strategy = match (serializer, deserializer) {
            (Some(serializer), Some(deserializer)) => {
                if config.full_dump_file.is_none() {
                    return Err(RaftError::InvalidConfig(
                        "a custom serializer requires full_dump_file".to_string(),
                    ));
                }
                SerializerStrategy::External {
                    serializer,
                    deserializer,
                }
            }
            (None, None) => SerializerStrategy::Builtin(BuiltinSerializer::new(
                config.background_serialization,
            )),
            _ => {
                return Err(RaftError::InvalidConfig(
                    "serializer and deserializer must be supplied together".to_string(),
                ))
            }
        };

        let mut snapshots = SnapshotManager::new(
            config.full_dump_file.clone(),
            strategy,
            CompactionPolicy {
                min_entries: config.log_compaction_min_entries,
                min_time: config.log_compaction_min_time(),
                split: config.log_compaction_split,
            },
        );

        let journal: Box<dyn Journal> = match &config.journal_file {
            Some(path) => Box::new(FileJournal::open(path.clone())?),
            None => Box::new(MemoryJournal::new()),
        };
        let mut log = LogStore::open(journal)?;

        let mut state = RaftState::new(self_id.clone());
        let hard_state = log.hard_state().clone();
        state.current_term = hard_state.current_term;
        state.voted_for = hard_state.voted_for;

        let mut membership = Membership::new(self_id.clone(), peers);
        let mut state_machine = state_machine;

        // The dump is written before the journal is rewritten, so a journal
        // checkpoint can lag the dump but never lead it
        let checkpoint = log.snapshot_meta();
        match snapshots.load()? {
            Some(dump) => {
                if checkpoint.last_included_index > dump.meta.last_included_index {
                    return Err(RaftError::Corruption(format!(
                        "journal checkpoint {} is ahead of the full dump at {}",
                        checkpoint.last_included_index, dump.meta.last_included_index
                    )));
                }
                state_machine.restore(&dump.state)?;
                if !dump.members.is_empty() {
                    membership = Membership::from_members(self_id.clone(), &dump.members);
                }
                log.compact(dump.meta)?;
                state.commit_index = dump.meta.last_included_index;
                state.last_applied = dump.meta.last_included_index;
            }
            None if checkpoint.last_included_index > 0 => {
                return Err(RaftError::Corruption(
                    "journal was compacted but the full dump is missing".to_string(),
                ));
            }
            None => {}
        }

        tracing::info!(
            "Node {} starting in term {} with {} log entries after index {}",
            self_id,
            state.current_term,
            log.len(),
            log.snapshot_meta().last_included_index
        );

        let queue = CommandQueue::new(config.commands_queue_size);
        let status = Arc::new(RwLock::new(NodeStatus::initial(self_id)));
        let now = Instant::now();

        let mut node = Self {
            config,
            state,
            log,
            membership,
            transport,
            state_machine,
            snapshots,
            queue,
            status,
            on_ready,
            ready: false,
            election_deadline: now,
            next_heartbeat: now,
            replicate_now: false,
            pending: BTreeMap::new(),
            forwarded: HashMap::new(),
            next_request_id: 0,
            was_leader: false,
            known_leader: None,
            incoming_snapshot: None,
            encoded_snapshot: None,
        };
        node.reset_election_timeout(now);
        node.publish_status();
        Ok(node)
    }

    pub fn self_id(&self) -> &NodeId {
        &self.state.node_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle::new(
            self.state.node_id.clone(),
            self.queue.submitter(),
            self.status.clone(),
            self.config.dynamic_membership_change,
            self.config.max_command_size,
        )
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    /// Run one tick with messages that already arrived
    pub fn tick(&mut self) -> Result<()> {
        self.tick_at(Instant::now())
    }

    /// Like `tick`, with an explicit clock reading
    pub fn tick_at(&mut self, now: Instant) -> Result<()> {
        let inbound = self.transport.poll();
        self.process(inbound, now)
    }

    /// Block up to `timeout` for network activity, then tick
    pub fn tick_wait(&mut self, timeout: Duration) -> Result<()> {
        let inbound = self.transport.wait(timeout);
        self.process(inbound, Instant::now())
    }

    /// Stop networking and fail every command still in flight
    pub fn shutdown(&mut self) {
        tracing::info!("Node {} shutting down", self.state.node_id);
        self.transport.shutdown();
        self.queue.drain(FailReason::Discarded);
        for (_, command) in std::mem::take(&mut self.pending) {
            command.fail(FailReason::Discarded);
        }
        for (_, command) in self.forwarded.drain() {
            command.fail(FailReason::Discarded);
        }
        self.publish_status();
    }

    pub fn status(&self) -> NodeStatus {
        let connected_peers = self
            .membership
            .peers()
            .into_iter()
            .filter(|peer| self.transport.is_connected(peer))
            .collect();

        NodeStatus {
            self_id: self.state.node_id.clone(),
            state: self.state.state,
            current_term: self.state.current_term,
            leader: self.state.current_leader.clone(),
            commit_index: self.state.commit_index,
            last_applied: self.state.last_applied,
            last_log_index: self.log.last_index(),
            log_len: self.log.len(),
            snapshot_index: self.log.snapshot_meta().last_included_index,
            members: self.membership.members(),
            connected_peers,
            queue_len: self.queue.len(),
            ready: self.ready,
            serializing: self.snapshots.is_serializing(),
        }
    }

    fn process(&mut self, inbound: Vec<InboundMessage>, now: Instant) -> Result<()> {
        for message in inbound {
            self.handle_message(message, now)?;
        }
        self.step(now)
    }

    fn step(&mut self, now: Instant) -> Result<()> {
        if self.state.is_leader() {
            if self.lease_expired(now) {
                tracing::warn!(
                    "Leader {} lost contact with a quorum, stepping down",
                    self.state.node_id
                );
                self.state.become_follower(self.state.current_term, None);
                self.reset_election_timeout(now);
            } else if now >= self.next_heartbeat {
                self.broadcast_append_entries();
                self.next_heartbeat = now + self.config.append_entries_period();
            }
        } else if now >= self.election_deadline {
            if self.membership.self_is_voter() {
                tracing::info!(
                    "Node {} election timeout, starting election",
                    self.state.node_id
                );
                self.start_election(now)?;
            } else {
                self.reset_election_timeout(now);
            }
        }
        self.observe_leadership();

        self.process_queue(now)?;
        self.expire_commands(now);

        if self.replicate_now && self.state.is_leader() {
            advance_commit_index(&mut self.state, &self.log, &self.membership);
            self.broadcast_append_entries();
        }
        self.replicate_now = false;

        self.apply_committed(now)?;
        self.compact(now)?;
        self.check_ready();
        self.observe_leadership();
        self.publish_status();
        Ok(())
    }

    fn reset_election_timeout(&mut self, now: Instant) {
        let timeout_ms = rand::thread_rng()
            .gen_range(self.config.raft_min_timeout_ms..=self.config.raft_max_timeout_ms);
        self.election_deadline = now + Duration::from_millis(timeout_ms);
    }

    fn handle_message(&mut self, inbound: InboundMessage, now: Instant) -> Result<()> {
        let InboundMessage { from, message } = inbound;

        match message {
            RaftMessage::RequestVote(request) => {
                let response = handle_request_vote(&mut self.state, &mut self.log, request)?;
                // Reset election timeout if we granted the vote
                if response.vote_granted {
                    self.reset_election_timeout(now);
                }
                self.transport
                    .send(&from, RaftMessage::RequestVoteResponse(response));
            }

            RaftMessage::RequestVoteResponse(response) => {
                let won = handle_request_vote_response(
                    &mut self.state,
                    &self.membership,
                    from,
                    response,
                );
                persist_hard_state(&self.state, &mut self.log)?;
                if won {
                    self.become_leader(now)?;
                }
            }

            RaftMessage::AppendEntries(request) => {
                // Reset election timeout when receiving from leader
                if request.term >= self.state.current_term {
                    self.reset_election_timeout(now);
                }
                let response = handle_append_entries(&mut self.state, &mut self.log, request)?;
                self.transport
                    .send(&from, RaftMessage::AppendEntriesResponse(response));
            }

            RaftMessage::AppendEntriesResponse(response) => {
                let rejected = !response.success;
                handle_append_entries_response(
                    &mut self.state,
                    &self.log,
                    &self.membership,
                    from.clone(),
                    response,
                    now,
                );
                persist_hard_state(&self.state, &mut self.log)?;

                // Retry right away from the hinted position
                if rejected && self.state.is_leader() {
                    self.send_append_entries(&from);
                }
            }

            RaftMessage::InstallSnapshot(request) => {
                self.handle_install_snapshot(from, request, now)?;
            }

            RaftMessage::ApplyCommand(request) => {
                self.handle_apply_command(from, request)?;
            }

            RaftMessage::ApplyCommandResponse(response) => {
                self.handle_apply_command_response(response, now);
            }
        }

        self.observe_leadership();
        Ok(())
    }

    fn start_election(&mut self, now: Instant) -> Result<()> {
        self.state.become_candidate();
        persist_hard_state(&self.state, &mut self.log)?;
        self.reset_election_timeout(now);

        tracing::info!(
            "Node {} starting election for term {}",
            self.state.node_id,
            self.state.current_term
        );

        // A lone voter wins outright
        if self.membership.is_quorum(&self.state.votes_received) {
            return self.become_leader(now);
        }

        let request = create_request_vote(&self.state, &self.log);
        for peer in self.membership.peers() {
            if self.membership.is_voter(&peer) {
                self.transport
                    .send(&peer, RaftMessage::RequestVote(request.clone()));
            }
        }
        Ok(())
    }

    fn become_leader(&mut self, now: Instant) -> Result<()> {
        self.state
            .become_leader(self.log.last_index(), self.membership.peers(), now);

        // Entries from earlier terms commit once an entry of this term does
        let index = self
            .log
            .append_new(self.state.current_term, Payload::NoOp)?;
        tracing::debug!(
            "Leader {} appended no-op at index {}",
            self.state.node_id,
            index
        );

        advance_commit_index(&mut self.state, &self.log, &self.membership);
        self.broadcast_append_entries();
        self.next_heartbeat = now + self.config.append_entries_period();
        Ok(())
    }

    /// Has a quorum answered within the last election timeout?
    fn lease_expired(&self, now: Instant) -> bool {
        let lease = self.config.raft_max_timeout();
        let fresh = self
            .state
            .last_contact
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) <= lease)
            .map(|(id, _)| id)
            .chain(std::iter::once(&self.state.node_id));
        !self.membership.is_quorum(fresh)
    }

    fn broadcast_append_entries(&mut self) {
        let peers: Vec<NodeId> = self.state.next_index.keys().cloned().collect();
        for peer in peers {
            self.send_append_entries(&peer);
        }
    }

    /// Send everything from the peer's `next_index` on, then move the cursor
    /// past it without waiting for the acknowledgement
    fn send_append_entries(&mut self, peer: &NodeId) {
        let mut next = match self.state.next_index.get(peer) {
            Some(next) => *next,
            None => return,
        };

        if next <= self.log.snapshot_meta().last_included_index {
            match self.send_snapshot(peer) {
                Some(after_snapshot) => next = after_snapshot,
                None => return,
            }
        }

        let batch = self.config.append_entries_use_batch;
        let max_bytes = self.config.append_entries_batch_size_bytes;

        while let Some(request) =
            create_append_entries(&self.state, &self.log, next, batch, max_bytes)
        {
            let count = request.entries.len() as u64;
            self.transport
                .send(peer, RaftMessage::AppendEntries(request));
            next += count;
            if count == 0 || next > self.log.last_index() {
                break;
            }
        }

        self.state.next_index.insert(peer.clone(), next);
    }

    /// Stream the latest snapshot; returns the index that follows it
    fn send_snapshot(&mut self, peer: &NodeId) -> Option<LogIndex> {
        let snapshot = match self.snapshots.latest() {
            Some(snapshot) => snapshot,
            None => {
                tracing::warn!("No snapshot available for lagging follower {}", peer);
                return None;
            }
        };

        let encoded = match &self.encoded_snapshot {
            Some((meta, bytes)) if *meta == snapshot.meta => bytes.clone(),
            _ => match bincode::serialize(&*snapshot) {
                Ok(bytes) => {
                    let bytes = Arc::new(bytes);
                    self.encoded_snapshot = Some((snapshot.meta, bytes.clone()));
                    bytes
                }
                Err(e) => {
                    tracing::error!("Failed to encode snapshot: {}", e);
                    return None;
                }
            },
        };

        tracing::info!(
            "Sending snapshot at index {} to {} ({} bytes)",
            snapshot.meta.last_included_index,
            peer,
            encoded.len()
        );

        let chunk_size = self.config.log_compaction_batch_size;
        let mut offset = 0;
        loop {
            let end = (offset + chunk_size).min(encoded.len());
            let done = end == encoded.len();
            self.transport.send(
                peer,
                RaftMessage::InstallSnapshot(InstallSnapshotRequest {
                    term: self.state.current_term,
                    leader_id: self.state.node_id.clone(),
                    meta: snapshot.meta,
                    offset: offset as u64,
                    data: encoded[offset..end].to_vec(),
                    done,
                }),
            );
            if done {
                break;
            }
            offset = end;
        }

        Some(snapshot.meta.last_included_index + 1)
    }

    fn handle_install_snapshot(
        &mut self,
        from: NodeId,
        request: InstallSnapshotRequest,
        now: Instant,
    ) -> Result<()> {
        self.state.update_term(request.term);
        persist_hard_state(&self.state, &mut self.log)?;

        if request.term < self.state.current_term {
            self.transport.send(
                &from,
                RaftMessage::AppendEntriesResponse(AppendEntriesResponse {
                    term: self.state.current_term,
                    success: false,
                    match_index: 0,
                    conflict_index: None,
                }),
            );
            return Ok(());
        }

        self.reset_election_timeout(now);
        if !self.state.is_follower() {
            self.state
                .become_follower(request.term, Some(request.leader_id.clone()));
        }
        self.state.current_leader = Some(request.leader_id.clone());

        if request.offset == 0 {
            self.incoming_snapshot = Some(IncomingSnapshot {
                leader: request.leader_id.clone(),
                meta: request.meta,
                data: Vec::new(),
            });
        }

        let in_sequence = matches!(
            &self.incoming_snapshot,
            Some(incoming) if incoming.leader == request.leader_id
                && incoming.meta == request.meta
                && incoming.data.len() as u64 == request.offset
        );
        if !in_sequence {
            // A chunk went missing; the leader starts over on its next round
            self.incoming_snapshot = None;
            return Ok(());
        }

        let mut incoming = match self.incoming_snapshot.take() {
            Some(incoming) => incoming,
            None => return Ok(()),
        };
        incoming.data.extend_from_slice(&request.data);
        if !request.done {
            self.incoming_snapshot = Some(incoming);
            return Ok(());
        }

        let data: SnapshotData = match bincode::deserialize(&incoming.data) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Discarding undecodable snapshot from {}: {}", from, e);
                return Ok(());
            }
        };
        let meta = data.meta;

        if meta.last_included_index > self.state.commit_index {
            self.install_snapshot(data)?;
        }
        self.state.leader_commit = self.state.leader_commit.max(meta.last_included_index);

        self.transport.send(
            &from,
            RaftMessage::AppendEntriesResponse(AppendEntriesResponse {
                term: self.state.current_term,
                success: true,
                match_index: meta.last_included_index,
                conflict_index: None,
            }),
        );
        Ok(())
    }

    /// Replace local state with a snapshot received from the leader
    fn install_snapshot(&mut self, data: SnapshotData) -> Result<()> {
        let meta = data.meta;
        tracing::info!(
            "Node {} installing snapshot at index {} (term {})",
            self.state.node_id,
            meta.last_included_index,
            meta.last_included_term
        );

        // Dump and journal first, so a failure below still restarts cleanly
        self.snapshots.install(data)?;
        self.log.compact(meta)?;
        self.encoded_snapshot = None;

        let installed = self.snapshots.latest().ok_or_else(|| {
            RaftError::InvalidState("installed snapshot is not retained".to_string())
        })?;
        self.state_machine.restore(&installed.state)?;
        self.membership =
            Membership::from_members(self.state.node_id.clone(), &installed.members);

        self.state.commit_index = meta.last_included_index;
        self.state.last_applied = meta.last_included_index;

        // Commands folded into the snapshot cannot be matched any more
        let keep = self.pending.split_off(&(meta.last_included_index + 1));
        for (_, command) in std::mem::replace(&mut self.pending, keep) {
            command.fail(FailReason::Discarded);
        }
        Ok(())
    }

    fn handle_apply_command(&mut self, from: NodeId, request: ApplyCommandRequest) -> Result<()> {
        let oversized = matches!(
            &request.payload,
            Payload::Application(command) if command.len() > self.config.max_command_size
        );
        let result = if oversized {
            Err(FailReason::CommandTooLarge)
        } else if self.state.is_leader() {
            let term = self.state.current_term;
            let index = self.log.append_new(term, request.payload)?;
            self.replicate_now = true;
            Ok((index, term))
        } else {
            Err(FailReason::NotLeader)
        };

        self.transport.send(
            &from,
            RaftMessage::ApplyCommandResponse(ApplyCommandResponse {
                request_id: request.request_id,
                result,
            }),
        );
        Ok(())
    }

    fn handle_apply_command_response(&mut self, response: ApplyCommandResponse, now: Instant) {
        let mut command = match self.forwarded.remove(&response.request_id) {
            Some(command) => command,
            None => return,
        };

        match response.result {
            Ok((index, term)) => {
                if index <= self.state.last_applied {
                    // Applied before the reply arrived; the result is gone
                    if self.log.term_at(index) == Some(term) {
                        command.responder.respond(Ok(Vec::new()));
                    } else {
                        command.fail(FailReason::Discarded);
                    }
                    return;
                }
                command.assigned = Some((index, term));
                command.expires_at = Some(now + self.config.connection_timeout());
                if let Some(previous) = self.pending.insert(index, command) {
                    previous.fail(FailReason::Discarded);
                }
            }
            Err(reason) => command.fail(reason),
        }
    }

    /// Fail commands whose fate depended on a leader we no longer follow
    fn observe_leadership(&mut self) {
        if self.was_leader && !self.state.is_leader() && !self.pending.is_empty() {
            tracing::info!(
                "Node {} lost leadership with {} uncommitted commands",
                self.state.node_id,
                self.pending.len()
            );
            for (_, command) in std::mem::take(&mut self.pending) {
                command.fail(FailReason::LeaderChanged);
            }
        }
        self.was_leader = self.state.is_leader();

        if self.state.current_leader != self.known_leader {
            for (_, command) in self.forwarded.drain() {
                command.fail(FailReason::LeaderChanged);
            }
            self.known_leader = self.state.current_leader.clone();
        }
    }

    fn process_queue(&mut self, now: Instant) -> Result<()> {
        loop {
            if self.state.is_leader() {
                let mut command = match self.queue.pop() {
                    Some(command) => command,
                    None => break,
                };
                let term = self.state.current_term;
                let index = self.log.append_new(term, command.payload.clone())?;
                command.assigned = Some((index, term));
                self.pending.insert(index, command);
                self.replicate_now = true;
            } else if let Some(leader) = self.state.current_leader.clone() {
                let mut command = match self.queue.pop() {
                    Some(command) => command,
                    None => break,
                };
                command.expires_at = Some(now + self.config.connection_timeout());
                let request_id = self.next_request_id;
                self.next_request_id += 1;
                self.transport.send(
                    &leader,
                    RaftMessage::ApplyCommand(ApplyCommandRequest {
                        request_id,
                        payload: command.payload.clone(),
                    }),
                );
                self.forwarded.insert(request_id, command);
            } else if !self.config.commands_wait_leader {
                let failed = self.queue.drain(FailReason::MissingLeader);
                if failed > 0 {
                    tracing::debug!("No leader known, failed {} commands", failed);
                }
                break;
            } else {
                // Keep commands queued until a leader shows up
                break;
            }
        }
        Ok(())
    }

    /// Give up on commands that wait on another node for too long: the
    /// forwarded request or its answer was lost on the way
    fn expire_commands(&mut self, now: Instant) {
        let lost: Vec<u64> = self
            .forwarded
            .iter()
            .filter(|(_, command)| command.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        let stale: Vec<LogIndex> = self
            .pending
            .iter()
            .filter(|(_, command)| command.is_expired(now))
            .map(|(index, _)| *index)
            .collect();
        if lost.is_empty() && stale.is_empty() {
            return;
        }

        tracing::warn!(
            "Node {} timed out {} forwarded and {} unapplied commands",
            self.state.node_id,
            lost.len(),
            stale.len()
        );
        for id in lost {
            if let Some(command) = self.forwarded.remove(&id) {
                command.fail(FailReason::Discarded);
            }
        }
        for index in stale {
            if let Some(command) = self.pending.remove(&index) {
                command.fail(FailReason::Discarded);
            }
        }
    }

    fn apply_committed(&mut self, now: Instant) -> Result<()> {
        while self.state.last_applied < self.state.commit_index {
            let index = self.state.last_applied + 1;
            let entry = match self.log.get(index) {
                Some(entry) => entry.clone(),
                None => {
                    return Err(RaftError::InvalidState(format!(
                        "committed entry {} missing from the log",
                        index
                    )))
                }
            };

            let result = match &entry.payload {
                Payload::Application(command) => self.state_machine.apply(command),
                Payload::NoOp => Vec::new(),
                payload @ (Payload::AddMember(_) | Payload::RemoveMember(_)) => {
                    self.apply_membership(payload, now);
                    Vec::new()
                }
            };
            self.state.last_applied = index;

            if let Some(command) = self.pending.remove(&index) {
                match command.assigned {
                    Some((_, term)) if term == entry.term => command.responder.respond(Ok(result)),
                    // Another leader's entry took this slot
                    _ => command.fail(FailReason::Discarded),
                }
            }
        }
        Ok(())
    }

    fn apply_membership(&mut self, payload: &Payload, now: Instant) {
        if !self.membership.apply(payload) {
            return;
        }
        tracing::info!(
            "Node {} membership is now {:?}",
            self.state.node_id,
            self.membership.addresses()
        );

        match payload {
            Payload::AddMember(member) => {
                if self.state.is_leader() {
                    self.state
                        .add_peer(member.address.clone(), self.log.last_index(), now);
                }
            }
            Payload::RemoveMember(address) if *address == self.state.node_id => {
                tracing::info!("Node {} was removed from the cluster", address);
                if self.state.is_leader() {
                    self.state.become_follower(self.state.current_term, None);
                }
            }
            Payload::RemoveMember(address) => {
                self.state.remove_peer(address);
                self.transport.remove_peer(address);
            }
            _ => {}
        }
    }

    fn compact(&mut self, now: Instant) -> Result<()> {
        self.finish_compaction()?;

        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let applied = self.state.last_applied;

        if applied <= self.log.snapshot_meta().last_included_index
            || !self.snapshots.should_compact(
                self.log.len(),
                now,
                &self.membership.addresses(),
                &self.state.node_id,
                since_epoch,
            )
        {
            return Ok(());
        }

        let last_included_term = match self.log.term_at(applied) {
            Some(term) => term,
            None => return Ok(()),
        };
        let data = SnapshotData {
            meta: SnapshotMeta {
                last_included_index: applied,
                last_included_term,
            },
            members: self.membership.members(),
            state: self.state_machine.snapshot()?,
        };
        self.snapshots.begin(data, now);

        // Synchronous writers are already done
        self.finish_compaction()
    }

    fn finish_compaction(&mut self) -> Result<()> {
        if self.snapshots.poll() == SerializerState::Success {
            if let Some(snapshot) = self.snapshots.latest() {
                self.log.compact(snapshot.meta)?;
            }
        }
        Ok(())
    }

    fn check_ready(&mut self) {
        if self.ready {
            return;
        }

        let caught_up = if self.state.is_leader() {
            self.log.term_at(self.state.commit_index) == Some(self.state.current_term)
                && self.state.last_applied >= self.state.commit_index
        } else {
            self.state.current_leader.is_some()
                && self.state.last_applied >= self.state.leader_commit
        };

        if caught_up {
            self.ready = true;
            tracing::info!(
                "Node {} is ready at index {}",
                self.state.node_id,
                self.state.last_applied
            );
            if let Some(on_ready) = self.on_ready.take() {
                on_ready();
            }
        }
    }

    fn publish_status(&self) {
        let status = self.status();
        *self.status.write() = status;
    }
}
