use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::raft::types::{LogIndex, Payload, Term};

/// Why a submitted command did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailReason {
    /// The command queue was at capacity
    QueueFull,
    /// No leader known and the node is not configured to wait for one
    MissingLeader,
    /// The entry was replaced before it committed
    Discarded,
    /// The command reached a node that is not the leader
    NotLeader,
    /// Leadership moved before the entry committed
    LeaderChanged,
    /// The command is larger than `max_command_size`
    CommandTooLarge,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailReason::QueueFull => write!(f, "QUEUE_FULL"),
            FailReason::MissingLeader => write!(f, "MISSING_LEADER"),
            FailReason::Discarded => write!(f, "DISCARDED"),
            FailReason::NotLeader => write!(f, "NOT_LEADER"),
            FailReason::LeaderChanged => write!(f, "LEADER_CHANGED"),
            FailReason::CommandTooLarge => write!(f, "COMMAND_TOO_LARGE"),
        }
    }
}

impl std::error::Error for FailReason {}

/// Success carries whatever the state machine returned for the command
pub type CommandResult = Result<Vec<u8>, FailReason>;

/// Sending half of a command's result slot
#[derive(Debug, Clone)]
pub struct Responder(Sender<CommandResult>);

impl Responder {
    pub fn respond(&self, result: CommandResult) {
        // The submitter may have stopped waiting
        let _ = self.0.try_send(result);
    }
}

/// Returned to the submitter; resolves once the engine decides the outcome
#[derive(Debug)]
pub struct CommandHandle {
    rx: Receiver<CommandResult>,
}

impl CommandHandle {
    pub fn channel() -> (Responder, CommandHandle) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (Responder(tx), CommandHandle { rx })
    }

    /// Block until the outcome is known or `timeout` passes
    pub fn wait(&self, timeout: Duration) -> Option<CommandResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            // Engine dropped the command without answering
            Err(RecvTimeoutError::Disconnected) => Some(Err(FailReason::Discarded)),
        }
    }

    pub fn try_result(&self) -> Option<CommandResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(FailReason::Discarded)),
        }
    }
}

/// A command owned by the queue until the core assigns it an index
#[derive(Debug)]
pub struct PendingCommand {
    pub payload: Payload,
    pub submitted_at: Instant,
    pub responder: Responder,
    /// Set once a leader accepted the command
    pub assigned: Option<(LogIndex, Term)>,
    /// Tick time after which a command waiting on another node is given up
    pub expires_at: Option<Instant>,
}

impl PendingCommand {
    pub fn new(payload: Payload) -> (Self, CommandHandle) {
        let (responder, handle) = CommandHandle::channel();
        let command = Self {
            payload,
            submitted_at: Instant::now(),
            responder,
            assigned: None,
            expires_at: None,
        };
        (command, handle)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    pub fn fail(self, reason: FailReason) {
        tracing::debug!(
            "Command submitted {:?} ago failed: {}",
            self.submitted_at.elapsed(),
            reason
        );
        self.responder.respond(Err(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_receives_result_once() {
        let (command, handle) = PendingCommand::new(Payload::Application(b"x".to_vec()));
        assert!(handle.try_result().is_none());

        command.responder.respond(Ok(b"done".to_vec()));
        assert_eq!(handle.try_result(), Some(Ok(b"done".to_vec())));
    }

    #[test]
    fn test_dropped_command_reads_as_discarded() {
        let (command, handle) = PendingCommand::new(Payload::NoOp);
        drop(command);
        assert_eq!(
            handle.wait(Duration::from_millis(10)),
            Some(Err(FailReason::Discarded))
        );
    }

    #[test]
    fn test_fail_reason_display() {
        assert_eq!(FailReason::QueueFull.to_string(), "QUEUE_FULL");
        assert_eq!(FailReason::LeaderChanged.to_string(), "LEADER_CHANGED");
    }
}
