use super::membership::Membership;
use super::rpc::{RequestVoteRequest, RequestVoteResponse};
use super::state::RaftState;
use super::types::NodeId;
use crate::storage::{LogStore, PersistentState};
use crate::util::errors::Result;

/// Write term and vote to the journal if they changed
pub fn persist_hard_state(raft_state: &RaftState, log_store: &mut LogStore) -> Result<()> {
    log_store.save_hard_state(PersistentState {
        current_term: raft_state.current_term,
        voted_for: raft_state.voted_for.clone(),
    })
}

/// Handle incoming RequestVote RPC
pub fn handle_request_vote(
    raft_state: &mut RaftState,
    log_store: &mut LogStore,
    request: RequestVoteRequest,
) -> Result<RequestVoteResponse> {
    tracing::debug!(
        "Node {} received RequestVote from {} (term: {})",
        raft_state.node_id,
        request.candidate_id,
        request.term
    );

    // If request term is greater, update our term and become follower
    raft_state.update_term(request.term);

    let mut vote_granted = false;

    // Grant vote if:
    // 1. Candidate's term is at least as current as ours
    // 2. We haven't voted yet in this term, or we already voted for this candidate
    // 3. Candidate's log is at least as up-to-date as ours
    if request.term >= raft_state.current_term {
        let can_vote = raft_state.voted_for.is_none()
            || raft_state.voted_for.as_ref() == Some(&request.candidate_id);

        if can_vote {
            let last_log_term = log_store.last_term();
            let last_log_index = log_store.last_index();

            let log_is_up_to_date = request.last_log_term > last_log_term
                || (request.last_log_term == last_log_term
                    && request.last_log_index >= last_log_index);

            if log_is_up_to_date {
                vote_granted = true;
                raft_state.voted_for = Some(request.candidate_id.clone());

                tracing::info!(
                    "Node {} granted vote to {} in term {}",
                    raft_state.node_id,
                    request.candidate_id,
                    request.term
                );
            } else {
                tracing::debug!(
                    "Node {} denied vote to {} - log not up-to-date",
                    raft_state.node_id,
                    request.candidate_id
                );
            }
        } else {
            tracing::debug!(
                "Node {} denied vote to {} - already voted for {:?}",
                raft_state.node_id,
                request.candidate_id,
                raft_state.voted_for
            );
        }
    } else {
        tracing::debug!(
            "Node {} denied vote to {} - request term {} < current term {}",
            raft_state.node_id,
            request.candidate_id,
            request.term,
            raft_state.current_term
        );
    }

    // The vote must be durable before the candidate hears about it
    persist_hard_state(raft_state, log_store)?;

    Ok(RequestVoteResponse {
        term: raft_state.current_term,
        vote_granted,
    })
}

/// Handle incoming RequestVote response; returns true when the election is won
pub fn handle_request_vote_response(
    raft_state: &mut RaftState,
    membership: &Membership,
    from: NodeId,
    response: RequestVoteResponse,
) -> bool {
    // If response term is greater, update our term and become follower
    if raft_state.update_term(response.term) {
        return false;
    }

    // Ignore if we're not a candidate anymore
    if !raft_state.is_candidate() {
        return false;
    }

    // Ignore stale responses
    if response.term < raft_state.current_term {
        return false;
    }

    if response.vote_granted {
        raft_state.add_vote(from.clone());

        tracing::debug!(
            "Node {} received vote from {} ({}/{} votes)",
            raft_state.node_id,
            from,
            raft_state.votes_received.len(),
            membership.quorum()
        );

        if membership.is_quorum(&raft_state.votes_received) {
            tracing::info!(
                "Node {} won election in term {} with {} votes",
                raft_state.node_id,
                raft_state.current_term,
                raft_state.votes_received.len()
            );
            return true;
        }
    }

    false
}

/// Create a RequestVote request for this node
pub fn create_request_vote(raft_state: &RaftState, log_store: &LogStore) -> RequestVoteRequest {
    RequestVoteRequest {
        term: raft_state.current_term,
        candidate_id: raft_state.node_id.clone(),
        last_log_index: log_store.last_index(),
        last_log_term: log_store.last_term(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::Payload;
    use crate::storage::MemoryJournal;

    fn log_store() -> LogStore {
        LogStore::open(Box::new(MemoryJournal::new())).unwrap()
    }

    fn vote_request(term: u64, candidate: &str, last_index: u64, last_term: u64) -> RequestVoteRequest {
        RequestVoteRequest {
            term,
            candidate_id: candidate.to_string(),
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    #[test]
    fn test_grant_vote_to_candidate() {
        let mut raft_state = RaftState::new("node-1".to_string());
        let mut log_store = log_store();

        let response =
            handle_request_vote(&mut raft_state, &mut log_store, vote_request(1, "node-2", 0, 0))
                .unwrap();

        assert!(response.vote_granted);
        assert_eq!(raft_state.voted_for, Some("node-2".to_string()));
        assert_eq!(log_store.hard_state().voted_for, Some("node-2".to_string()));
        assert_eq!(log_store.hard_state().current_term, 1);
    }

    #[test]
    fn test_deny_vote_if_already_voted() {
        let mut raft_state = RaftState::new("node-1".to_string());
        raft_state.current_term = 1;
        raft_state.voted_for = Some("node-2".to_string());
        let mut log_store = log_store();

        let response =
            handle_request_vote(&mut raft_state, &mut log_store, vote_request(1, "node-3", 0, 0))
                .unwrap();

        assert!(!response.vote_granted);
    }

    #[test]
    fn test_deny_vote_for_stale_log() {
        let mut raft_state = RaftState::new("node-1".to_string());
        let mut log_store = log_store();
        log_store.append_new(2, Payload::NoOp).unwrap();
        log_store.append_new(2, Payload::NoOp).unwrap();

        // Older last term loses even with a longer log
        let response =
            handle_request_vote(&mut raft_state, &mut log_store, vote_request(3, "node-2", 5, 1))
                .unwrap();
        assert!(!response.vote_granted);
        assert_eq!(raft_state.current_term, 3);

        // Same last term but shorter log loses too
        let response =
            handle_request_vote(&mut raft_state, &mut log_store, vote_request(3, "node-3", 1, 2))
                .unwrap();
        assert!(!response.vote_granted);
    }

    #[test]
    fn test_deny_vote_for_lower_term() {
        let mut raft_state = RaftState::new("node-1".to_string());
        raft_state.current_term = 4;
        let mut log_store = log_store();

        let response =
            handle_request_vote(&mut raft_state, &mut log_store, vote_request(3, "node-2", 0, 0))
                .unwrap();
        assert!(!response.vote_granted);
        assert_eq!(response.term, 4);
    }

    #[test]
    fn test_majority_wins_election() {
        let membership = Membership::new(
            "node-1".to_string(),
            &["node-2".to_string(), "node-3".to_string()],
        );
        let mut raft_state = RaftState::new("node-1".to_string());
        raft_state.become_candidate();

        let won = handle_request_vote_response(
            &mut raft_state,
            &membership,
            "node-2".to_string(),
            RequestVoteResponse {
                term: 1,
                vote_granted: true,
            },
        );
        assert!(won);
    }

    #[test]
    fn test_higher_term_response_ends_candidacy() {
        let membership = Membership::new("node-1".to_string(), &["node-2".to_string()]);
        let mut raft_state = RaftState::new("node-1".to_string());
        raft_state.become_candidate();

        let won = handle_request_vote_response(
            &mut raft_state,
            &membership,
            "node-2".to_string(),
            RequestVoteResponse {
                term: 3,
                vote_granted: false,
            },
        );
        assert!(!won);
        assert!(raft_state.is_follower());
        assert_eq!(raft_state.current_term, 3);
    }
}
