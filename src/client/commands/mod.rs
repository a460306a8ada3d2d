//! Console commands understood by `syncraft-node`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

mod kv_commands;
mod member_commands;
mod status_command;

pub use kv_commands::{DeleteCommand, GetCommand, SetCommand};
pub use member_commands::{AddMemberCommand, RemoveMemberCommand};
pub use status_command::StatusCommand;

use crate::application::KvReader;
use crate::client::CommandHandle;
use crate::raft::NodeHandle;

/// Result of command execution
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    Success(String),
    Error(String),
}

/// What a console command can reach
#[derive(Clone)]
pub struct ConsoleContext {
    pub node: NodeHandle,
    pub reader: KvReader,
    /// How long a replicated command may take before the console gives up
    pub timeout: Duration,
}

impl ConsoleContext {
    /// Block on a submitted command and describe its outcome
    pub fn wait(&self, handle: CommandHandle, describe: impl FnOnce(Vec<u8>) -> String) -> CommandOutput {
        match handle.wait(self.timeout) {
            Some(Ok(result)) => CommandOutput::Success(describe(result)),
            Some(Err(reason)) => CommandOutput::Error(reason.to_string()),
            None => CommandOutput::Error("timed out waiting for commit".to_string()),
        }
    }
}

/// Trait for command handlers - implement this to add new commands
pub trait CommandHandler: Send + Sync {
    /// Get the command name, e.g. "set"
    fn name(&self) -> &str;

    fn execute(&self, ctx: &ConsoleContext, args: Vec<String>) -> CommandOutput;

    /// Get help text for this command
    fn help(&self) -> String {
        format!("No help available for {}", self.name())
    }
}

/// Registry for managing command handlers
#[derive(Clone)]
pub struct CommandRegistry {
    handlers: Arc<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandRegistry {
    /// Create a new empty command registry
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(HashMap::new()),
        }
    }

    /// Create a registry with default commands
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SetCommand));
        registry.register(Arc::new(GetCommand));
        registry.register(Arc::new(DeleteCommand));
        registry.register(Arc::new(StatusCommand));
        registry.register(Arc::new(AddMemberCommand));
        registry.register(Arc::new(RemoveMemberCommand));
        registry
    }

    /// Register a command handler
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        let handlers = Arc::make_mut(&mut self.handlers);
        handlers.insert(handler.name().to_string(), handler);
    }

    /// Execute a command by name with arguments
    pub fn execute(
        &self,
        ctx: &ConsoleContext,
        command: &str,
        args: Vec<String>,
    ) -> Option<CommandOutput> {
        self.handlers
            .get(command)
            .map(|handler| handler.execute(ctx, args))
    }

    /// Get help for a specific command
    pub fn get_help(&self, command: &str) -> Option<String> {
        self.handlers.get(command).map(|handler| handler.help())
    }

    /// List all registered commands, sorted
    pub fn list_commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_command(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Split a console line into command name and arguments
/// Example: "set color blue" -> ("set", ["color", "blue"])
pub fn parse_command(text: &str) -> Option<(String, Vec<String>)> {
    let mut parts = text.split_whitespace();
    let command = parts.next()?.to_lowercase();
    let args = parts.map(|s| s.to_string()).collect();
    Some((command, args))
}
