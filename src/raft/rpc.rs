use serde::{Deserialize, Serialize};
use super::types::{LogEntry, LogIndex, NodeId, Payload, SnapshotMeta, Term};
use crate::client::FailReason;

/// RequestVote RPC - Invoked by candidates to gather votes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,
    /// Candidate requesting vote
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for candidate to update itself
    pub term: Term,
    /// True means candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC - Invoked by leader to replicate log entries and as heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,
    /// So follower can redirect clients
    pub leader_id: NodeId,
    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,
    /// Term of prev_log_index entry
    pub prev_log_term: Term,
    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for leader to update itself
    pub term: Term,
    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,
    /// Follower's last index known to match the leader after this request
    pub match_index: LogIndex,
    /// For faster log backtracking on failure
    pub conflict_index: Option<LogIndex>,
}

/// One chunk of a snapshot streamed to a lagging follower
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub meta: SnapshotMeta,
    /// Byte offset of `data` in the encoded snapshot
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

/// A command a follower hands to the leader it knows about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyCommandRequest {
    pub request_id: u64,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyCommandResponse {
    pub request_id: u64,
    /// Where the leader placed the command
    pub result: Result<(LogIndex, Term), FailReason>,
}

/// Wrapper for all RPC messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    ApplyCommand(ApplyCommandRequest),
    ApplyCommandResponse(ApplyCommandResponse),
}

impl RaftMessage {
    /// Term carried by the message, if it takes part in term bookkeeping
    pub fn term(&self) -> Option<Term> {
        match self {
            RaftMessage::RequestVote(m) => Some(m.term),
            RaftMessage::RequestVoteResponse(m) => Some(m.term),
            RaftMessage::AppendEntries(m) => Some(m.term),
            RaftMessage::AppendEntriesResponse(m) => Some(m.term),
            RaftMessage::InstallSnapshot(m) => Some(m.term),
            RaftMessage::ApplyCommand(_) | RaftMessage::ApplyCommandResponse(_) => None,
        }
    }
}
