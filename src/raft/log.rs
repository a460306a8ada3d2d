use super::election::persist_hard_state;
use super::membership::Membership;
use super::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use super::state::RaftState;
use super::types::{LogIndex, NodeId};
use crate::storage::LogStore;
use crate::util::errors::Result;
use std::time::Instant;

fn reject(raft_state: &RaftState, conflict_index: Option<LogIndex>) -> AppendEntriesResponse {
    AppendEntriesResponse {
        term: raft_state.current_term,
        success: false,
        match_index: 0,
        conflict_index,
    }
}

/// Handle incoming AppendEntries RPC
pub fn handle_append_entries(
    raft_state: &mut RaftState,
    log_store: &mut LogStore,
    request: AppendEntriesRequest,
) -> Result<AppendEntriesResponse> {
    // If request term is greater, update our term and become follower
    raft_state.update_term(request.term);
    persist_hard_state(raft_state, log_store)?;

    // Reply false if term < currentTerm
    if request.term < raft_state.current_term {
        tracing::debug!(
            "Node {} rejected AppendEntries from {} - stale term ({} < {})",
            raft_state.node_id,
            request.leader_id,
            request.term,
            raft_state.current_term
        );
        return Ok(reject(raft_state, None));
    }

    // Valid leader for this term; candidates and stale leaders step down
    if !raft_state.is_follower() {
        raft_state.become_follower(request.term, Some(request.leader_id.clone()));
    }
    raft_state.current_leader = Some(request.leader_id.clone());
    raft_state.leader_commit = raft_state.leader_commit.max(request.leader_commit);

    // Check log consistency. Everything inside the snapshot is committed and
    // therefore matches the leader.
    let snapshot_index = log_store.snapshot_meta().last_included_index;
    if request.prev_log_index > snapshot_index {
        match log_store.term_at(request.prev_log_index) {
            None => {
                tracing::debug!(
                    "Node {} rejected AppendEntries - missing entry at index {}",
                    raft_state.node_id,
                    request.prev_log_index
                );
                return Ok(reject(raft_state, Some(log_store.last_index() + 1)));
            }
            Some(term) if term != request.prev_log_term => {
                tracing::debug!(
                    "Node {} rejected AppendEntries - term mismatch at index {} ({} != {})",
                    raft_state.node_id,
                    request.prev_log_index,
                    term,
                    request.prev_log_term
                );

                // Find the first index with the conflicting term
                let mut conflict_index = request.prev_log_index;
                while conflict_index > log_store.first_index() {
                    match log_store.term_at(conflict_index - 1) {
                        Some(t) if t == term => conflict_index -= 1,
                        _ => break,
                    }
                }
                return Ok(reject(raft_state, Some(conflict_index)));
            }
            Some(_) => {}
        }
    }

    let last_new_index = request.prev_log_index + request.entries.len() as u64;

    // Append new entries, skipping what we already hold
    let entries = request.entries;
    for (i, new_entry) in entries.iter().enumerate() {
        if new_entry.index <= snapshot_index {
            continue;
        }
        match log_store.term_at(new_entry.index) {
            Some(existing_term) if existing_term == new_entry.term => continue,
            Some(_) => {
                // Conflict found, delete this entry and all that follow
                tracing::info!(
                    "Node {} found log conflict at index {}, truncating",
                    raft_state.node_id,
                    new_entry.index
                );
                log_store.truncate(new_entry.index)?;
                log_store.append(entries[i..].to_vec())?;
                break;
            }
            None => {
                log_store.append(entries[i..].to_vec())?;
                break;
            }
        }
    }

    if !entries.is_empty() {
        tracing::debug!(
            "Node {} holds entries up to {} from leader {}",
            raft_state.node_id,
            last_new_index,
            request.leader_id
        );
    }

    // Update commit index
    let commit_bound = request.leader_commit.min(last_new_index);
    if commit_bound > raft_state.commit_index {
        raft_state.commit_index = commit_bound;
        tracing::debug!(
            "Node {} updated commit_index to {}",
            raft_state.node_id,
            raft_state.commit_index
        );
    }

    Ok(AppendEntriesResponse {
        term: raft_state.current_term,
        success: true,
        match_index: last_new_index,
        conflict_index: None,
    })
}

/// Handle AppendEntries response (for leaders); returns true if commit advanced
pub fn handle_append_entries_response(
    raft_state: &mut RaftState,
    log_store: &LogStore,
    membership: &Membership,
    from: NodeId,
    response: AppendEntriesResponse,
    now: Instant,
) -> bool {
    // If response term is greater, update our term and step down
    if raft_state.update_term(response.term) {
        return false;
    }

    // Ignore if we're not leader anymore
    if !raft_state.is_leader() {
        return false;
    }

    // Ignore stale responses
    if response.term < raft_state.current_term {
        return false;
    }

    if !raft_state.next_index.contains_key(&from) {
        return false;
    }
    raft_state.last_contact.insert(from.clone(), now);

    if response.success {
        let match_index = raft_state.match_index.entry(from.clone()).or_insert(0);
        *match_index = (*match_index).max(response.match_index);
        let matched = *match_index;

        // Pipelined sends may already have moved next_index further
        if let Some(next_idx) = raft_state.next_index.get_mut(&from) {
            *next_idx = (*next_idx).max(matched + 1);
        }

        tracing::trace!(
            "Node {} updated match_index for {} to {}",
            raft_state.node_id,
            from,
            matched
        );

        advance_commit_index(raft_state, log_store, membership)
    } else {
        let matched = raft_state.match_index.get(&from).copied().unwrap_or(0);
        if let Some(next_idx) = raft_state.next_index.get_mut(&from) {
            let target = match response.conflict_index {
                // Use conflict information for faster backtracking
                Some(conflict_index) => conflict_index.min(*next_idx),
                // Fallback: decrement by 1
                None => next_idx.saturating_sub(1),
            };
            *next_idx = target.max(matched + 1).max(1);
            tracing::debug!(
                "Node {} moved next_index for {} back to {}",
                raft_state.node_id,
                from,
                *next_idx
            );
        }
        false
    }
}

/// Try to advance commit index based on match_index of voting members
pub fn advance_commit_index(
    raft_state: &mut RaftState,
    log_store: &LogStore,
    membership: &Membership,
) -> bool {
    if !raft_state.is_leader() {
        return false;
    }

    let last_log_index = log_store.last_index();

    // Highest index first; only entries from the current term commit by counting
    for n in ((raft_state.commit_index + 1)..=last_log_index).rev() {
        if log_store.term_at(n) != Some(raft_state.current_term) {
            continue;
        }

        let replicated = raft_state
            .match_index
            .iter()
            .filter(|(_, match_idx)| **match_idx >= n)
            .map(|(id, _)| id)
            .chain(std::iter::once(&raft_state.node_id));

        if membership.is_quorum(replicated) {
            raft_state.commit_index = n;
            tracing::debug!(
                "Leader {} advanced commit_index to {}",
                raft_state.node_id,
                n
            );
            return true;
        }
    }

    false
}

/// Create an AppendEntries request starting at `next_index`.
///
/// With `batch` set, entries are packed up to `max_bytes`; otherwise a single
/// entry goes out. Returns None when `next_index` falls inside the snapshot.
pub fn create_append_entries(
    raft_state: &RaftState,
    log_store: &LogStore,
    next_index: LogIndex,
    batch: bool,
    max_bytes: usize,
) -> Option<AppendEntriesRequest> {
    let prev_log_index = next_index.saturating_sub(1);
    let prev_log_term = log_store.term_at(prev_log_index)?;

    let entries = if batch {
        log_store.entries_from(next_index, max_bytes)
    } else {
        log_store.entries_from(next_index, 0)
    };

    Some(AppendEntriesRequest {
        term: raft_state.current_term,
        leader_id: raft_state.node_id.clone(),
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit: raft_state.commit_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::{LogEntry, Payload, SnapshotMeta};
    use crate::storage::MemoryJournal;

    fn log_store() -> LogStore {
        LogStore::open(Box::new(MemoryJournal::new())).unwrap()
    }

    fn follower(term: u64) -> RaftState {
        let mut raft_state = RaftState::new("node-1".to_string());
        raft_state.current_term = term;
        raft_state
    }

    fn request(
        term: u64,
        prev: (u64, u64),
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: "node-2".to_string(),
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit,
        }
    }

    #[test]
    fn test_append_entries_success() {
        let mut raft_state = follower(1);
        let mut log_store = log_store();

        let response = handle_append_entries(
            &mut raft_state,
            &mut log_store,
            request(1, (0, 0), vec![LogEntry::application(1, 1, vec![1, 2, 3])], 1),
        )
        .unwrap();

        assert!(response.success);
        assert_eq!(response.match_index, 1);
        assert_eq!(log_store.last_index(), 1);
        assert_eq!(raft_state.commit_index, 1);
        assert_eq!(raft_state.current_leader, Some("node-2".to_string()));
    }

    #[test]
    fn test_append_entries_reject_stale_term() {
        let mut raft_state = follower(2);
        let mut log_store = log_store();

        let response =
            handle_append_entries(&mut raft_state, &mut log_store, request(1, (0, 0), vec![], 0))
                .unwrap();

        assert!(!response.success);
        assert_eq!(response.term, 2);
    }

    #[test]
    fn test_missing_prev_entry_hints_log_end() {
        let mut raft_state = follower(1);
        let mut log_store = log_store();
        log_store.append_new(1, Payload::NoOp).unwrap();

        let response =
            handle_append_entries(&mut raft_state, &mut log_store, request(1, (5, 1), vec![], 0))
                .unwrap();

        assert!(!response.success);
        assert_eq!(response.conflict_index, Some(2));
    }

    #[test]
    fn test_conflicting_suffix_is_replaced() {
        let mut raft_state = follower(3);
        let mut log_store = log_store();
        log_store.append_new(1, Payload::NoOp).unwrap();
        log_store.append_new(2, Payload::NoOp).unwrap();
        log_store.append_new(2, Payload::NoOp).unwrap();

        // Leader of term 3 disagrees from index 2 on
        let response = handle_append_entries(
            &mut raft_state,
            &mut log_store,
            request(3, (1, 1), vec![LogEntry::new(3, 2, Payload::NoOp)], 0),
        )
        .unwrap();

        assert!(response.success);
        assert_eq!(log_store.last_index(), 2);
        assert_eq!(log_store.term_at(2), Some(3));
    }

    #[test]
    fn test_term_mismatch_hints_start_of_term() {
        let mut raft_state = follower(3);
        let mut log_store = log_store();
        log_store.append_new(1, Payload::NoOp).unwrap();
        log_store.append_new(2, Payload::NoOp).unwrap();
        log_store.append_new(2, Payload::NoOp).unwrap();

        let response =
            handle_append_entries(&mut raft_state, &mut log_store, request(3, (3, 3), vec![], 0))
                .unwrap();

        assert!(!response.success);
        assert_eq!(response.conflict_index, Some(2));
    }

    #[test]
    fn test_duplicate_delivery_keeps_log() {
        let mut raft_state = follower(1);
        let mut log_store = log_store();
        let entries = vec![
            LogEntry::application(1, 1, vec![1]),
            LogEntry::application(1, 2, vec![2]),
        ];

        for _ in 0..2 {
            let response = handle_append_entries(
                &mut raft_state,
                &mut log_store,
                request(1, (0, 0), entries.clone(), 0),
            )
            .unwrap();
            assert!(response.success);
        }
        assert_eq!(log_store.last_index(), 2);

        // A late, shorter copy must not cut the log back
        handle_append_entries(
            &mut raft_state,
            &mut log_store,
            request(1, (0, 0), entries[..1].to_vec(), 0),
        )
        .unwrap();
        assert_eq!(log_store.last_index(), 2);
    }

    #[test]
    fn test_entries_inside_snapshot_are_skipped() {
        let mut raft_state = follower(1);
        let mut log_store = log_store();
        log_store
            .compact(SnapshotMeta {
                last_included_index: 3,
                last_included_term: 1,
            })
            .unwrap();

        let response = handle_append_entries(
            &mut raft_state,
            &mut log_store,
            request(
                1,
                (2, 1),
                vec![
                    LogEntry::new(1, 3, Payload::NoOp),
                    LogEntry::new(1, 4, Payload::NoOp),
                ],
                4,
            ),
        )
        .unwrap();

        assert!(response.success);
        assert_eq!(log_store.last_index(), 4);
        assert_eq!(raft_state.commit_index, 4);
    }

    fn leader_with_log(entries: u64) -> (RaftState, LogStore, Membership) {
        let membership = Membership::new(
            "node-1".to_string(),
            &["node-2".to_string(), "node-3".to_string()],
        );
        let mut log_store = log_store();
        let mut raft_state = RaftState::new("node-1".to_string());
        raft_state.become_candidate();
        raft_state.become_leader(0, membership.peers(), Instant::now());
        for _ in 0..entries {
            log_store.append_new(raft_state.current_term, Payload::NoOp).unwrap();
        }
        (raft_state, log_store, membership)
    }

    fn ack(match_index: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: 1,
            success: true,
            match_index,
            conflict_index: None,
        }
    }

    #[test]
    fn test_commit_needs_quorum() {
        let (mut raft_state, log_store, membership) = leader_with_log(3);

        let advanced = handle_append_entries_response(
            &mut raft_state,
            &log_store,
            &membership,
            "node-2".to_string(),
            ack(2),
            Instant::now(),
        );

        assert!(advanced);
        assert_eq!(raft_state.commit_index, 2);
        assert_eq!(raft_state.next_index.get("node-2"), Some(&3));
    }

    #[test]
    fn test_old_term_entries_do_not_commit_by_count() {
        let (mut raft_state, mut log_store, membership) = leader_with_log(0);
        log_store.append_new(0, Payload::NoOp).unwrap();

        let advanced = handle_append_entries_response(
            &mut raft_state,
            &log_store,
            &membership,
            "node-2".to_string(),
            ack(1),
            Instant::now(),
        );

        assert!(!advanced);
        assert_eq!(raft_state.commit_index, 0);
    }

    #[test]
    fn test_rejection_moves_next_index_back() {
        let (mut raft_state, log_store, membership) = leader_with_log(0);
        raft_state.next_index.insert("node-2".to_string(), 10);

        handle_append_entries_response(
            &mut raft_state,
            &log_store,
            &membership,
            "node-2".to_string(),
            AppendEntriesResponse {
                term: 1,
                success: false,
                match_index: 0,
                conflict_index: Some(4),
            },
            Instant::now(),
        );
        assert_eq!(raft_state.next_index.get("node-2"), Some(&4));
    }

    #[test]
    fn test_unbatched_sends_single_entry() {
        let (raft_state, log_store, _) = leader_with_log(5);

        let single = create_append_entries(&raft_state, &log_store, 2, false, 1024).unwrap();
        assert_eq!(single.entries.len(), 1);
        assert_eq!(single.prev_log_index, 1);

        let batched = create_append_entries(&raft_state, &log_store, 2, true, usize::MAX).unwrap();
        assert_eq!(batched.entries.len(), 4);

        let heartbeat = create_append_entries(&raft_state, &log_store, 6, true, 1024).unwrap();
        assert!(heartbeat.entries.is_empty());
        assert_eq!(heartbeat.prev_log_term, 1);
    }
}
