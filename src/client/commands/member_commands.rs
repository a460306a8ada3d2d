use super::{CommandHandler, CommandOutput, ConsoleContext};
use crate::raft::ClusterMember;

/// Add command - submits a membership change adding `host:port`
pub struct AddMemberCommand;

impl CommandHandler for AddMemberCommand {
    fn name(&self) -> &str {
        "add"
    }

    fn execute(&self, ctx: &ConsoleContext, args: Vec<String>) -> CommandOutput {
        let member = match args.as_slice() {
            [address] => ClusterMember::voter(address.clone()),
            [address, flag] if flag == "--non-voting" => ClusterMember {
                address: address.clone(),
                voting: false,
            },
            _ => return CommandOutput::Error("Usage: add <host:port> [--non-voting]".to_string()),
        };

        let address = member.address.clone();
        match ctx.node.add_member(member) {
            Ok(handle) => ctx.wait(handle, |_| format!("added {}", address)),
            Err(e) => CommandOutput::Error(e.to_string()),
        }
    }

    fn help(&self) -> String {
        "Add a node to the cluster.\nUsage: add <host:port> [--non-voting]".to_string()
    }
}

pub struct RemoveMemberCommand;

impl CommandHandler for RemoveMemberCommand {
    fn name(&self) -> &str {
        "remove"
    }

    fn execute(&self, ctx: &ConsoleContext, args: Vec<String>) -> CommandOutput {
        let address = match args.as_slice() {
            [address] => address.clone(),
            _ => return CommandOutput::Error("Usage: remove <host:port>".to_string()),
        };

        match ctx.node.remove_member(address.clone()) {
            Ok(handle) => ctx.wait(handle, |_| format!("removed {}", address)),
            Err(e) => CommandOutput::Error(e.to_string()),
        }
    }

    fn help(&self) -> String {
        "Remove a node from the cluster.\nUsage: remove <host:port>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::context;
    use super::*;

    #[test]
    fn test_static_cluster_refuses_changes() {
        let (ctx, queue) = context(false);
        let output = AddMemberCommand.execute(&ctx, vec!["b:2".into()]);
        assert!(matches!(output, CommandOutput::Error(msg) if msg.contains("dynamic")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dynamic_cluster_enqueues_change() {
        let (ctx, queue) = context(true);
        let output = RemoveMemberCommand.execute(&ctx, vec!["b:2".into()]);
        // Nothing ticks the node, so the wait times out
        assert!(matches!(output, CommandOutput::Error(_)));
        assert_eq!(queue.len(), 1);
    }
}
