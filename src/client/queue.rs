use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};

use super::messages::{CommandHandle, FailReason, PendingCommand};
use crate::raft::types::Payload;

/// Bounded FIFO between submitters and the consensus tick.
///
/// Submitting never blocks: a full queue answers `QUEUE_FULL` right away.
pub struct CommandQueue {
    tx: Sender<PendingCommand>,
    rx: Receiver<PendingCommand>,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx }
    }

    /// Cloneable submission side
    pub fn submitter(&self) -> CommandSubmitter {
        CommandSubmitter {
            tx: self.tx.clone(),
        }
    }

    /// Take the oldest command, if any
    pub fn pop(&self) -> Option<PendingCommand> {
        match self.rx.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Fail everything still queued
    pub fn drain(&self, reason: FailReason) -> usize {
        let mut count = 0;
        while let Some(command) = self.pop() {
            command.fail(reason);
            count += 1;
        }
        count
    }
}

#[derive(Clone)]
pub struct CommandSubmitter {
    tx: Sender<PendingCommand>,
}

impl CommandSubmitter {
    pub fn submit(&self, payload: Payload) -> CommandHandle {
        let (command, handle) = PendingCommand::new(payload);

        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => {
                tracing::debug!("Command queue full, rejecting command");
                command.fail(FailReason::QueueFull);
            }
            Err(TrySendError::Disconnected(command)) => {
                tracing::debug!("Node stopped, discarding command");
                command.fail(FailReason::Discarded);
            }
        }

        handle
    }
}
