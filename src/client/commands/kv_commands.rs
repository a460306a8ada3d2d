use super::{CommandHandler, CommandOutput, ConsoleContext};
use crate::application::KvCommand;

fn previous_value(result: Vec<u8>) -> String {
    match bincode::deserialize::<Option<String>>(&result) {
        Ok(Some(previous)) => format!("ok (was {})", previous),
        _ => "ok".to_string(),
    }
}

fn replicate(ctx: &ConsoleContext, command: KvCommand) -> CommandOutput {
    match command.encode() {
        Ok(bytes) => ctx.wait(ctx.node.submit(bytes), previous_value),
        Err(e) => CommandOutput::Error(e.to_string()),
    }
}

/// Set command - replicates a key/value write
pub struct SetCommand;

impl CommandHandler for SetCommand {
    fn name(&self) -> &str {
        "set"
    }

    fn execute(&self, ctx: &ConsoleContext, args: Vec<String>) -> CommandOutput {
        if args.len() < 2 {
            return CommandOutput::Error("Usage: set <key> <value>".to_string());
        }
        let key = args[0].clone();
        let value = args[1..].join(" ");
        replicate(ctx, KvCommand::Set { key, value })
    }

    fn help(&self) -> String {
        "Store a value on every node.\nUsage: set <key> <value>".to_string()
    }
}

pub struct DeleteCommand;

impl CommandHandler for DeleteCommand {
    fn name(&self) -> &str {
        "delete"
    }

    fn execute(&self, ctx: &ConsoleContext, args: Vec<String>) -> CommandOutput {
        match args.as_slice() {
            [key] => replicate(ctx, KvCommand::Delete { key: key.clone() }),
            _ => CommandOutput::Error("Usage: delete <key>".to_string()),
        }
    }

    fn help(&self) -> String {
        "Remove a key on every node.\nUsage: delete <key>".to_string()
    }
}

/// Get command - reads this node's applied state, which may lag the leader
pub struct GetCommand;

impl CommandHandler for GetCommand {
    fn name(&self) -> &str {
        "get"
    }

    fn execute(&self, ctx: &ConsoleContext, args: Vec<String>) -> CommandOutput {
        match args.as_slice() {
            [key] => match ctx.reader.get(key) {
                Some(value) => CommandOutput::Success(value),
                None => CommandOutput::Error(format!("{} is not set", key)),
            },
            _ => CommandOutput::Error("Usage: get <key>".to_string()),
        }
    }

    fn help(&self) -> String {
        "Read a value from the local replica.\nUsage: get <key>".to_string()
    }
}
