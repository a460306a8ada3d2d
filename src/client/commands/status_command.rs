use super::{CommandHandler, CommandOutput, ConsoleContext};

/// Status command - prints the node's status as JSON
pub struct StatusCommand;

impl CommandHandler for StatusCommand {
    fn name(&self) -> &str {
        "status"
    }

    fn execute(&self, ctx: &ConsoleContext, _args: Vec<String>) -> CommandOutput {
        let status = ctx.node.status();
        match serde_json::to_string_pretty(&status) {
            Ok(json) => CommandOutput::Success(json),
            Err(e) => CommandOutput::Error(format!("Failed to encode status: {}", e)),
        }
    }

    fn help(&self) -> String {
        "Show term, leader, log and membership of this node.\nUsage: status".to_string()
    }
}
