pub mod commands;
pub mod messages;
pub mod queue;

pub use messages::{CommandHandle, CommandResult, FailReason, PendingCommand, Responder};
pub use queue::{CommandQueue, CommandSubmitter};
