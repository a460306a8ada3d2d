//! Replicated key-value console.
//!
//! Start a three node cluster on one machine:
//! ```bash
//! syncraft-node --self-address 127.0.0.1:4321 --partner 127.0.0.1:4322 --partner 127.0.0.1:4323
//! syncraft-node --self-address 127.0.0.1:4322 --partner 127.0.0.1:4321 --partner 127.0.0.1:4323
//! syncraft-node --self-address 127.0.0.1:4323 --partner 127.0.0.1:4321 --partner 127.0.0.1:4322
//! ```
//! then type `set color blue`, `get color` or `status` in any of them.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use syncraft::application::KeyValueStore;
use syncraft::client::commands::{parse_command, CommandOutput, CommandRegistry, ConsoleContext};
use syncraft::config::Config;
use syncraft::network::{TcpSettings, TcpTransport};
use syncraft::raft::{Node, NodeOptions, Scheduler};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a syncraft key-value node")]
struct Args {
    /// This node's address, host:port
    #[arg(long)]
    self_address: String,

    /// Other cluster members, host:port (repeat or comma separate)
    #[arg(long, value_delimiter = ',')]
    partner: Vec<String>,

    /// TOML file with engine settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `journal_file` from the config
    #[arg(long)]
    journal: Option<PathBuf>,

    /// Overrides `full_dump_file` from the config
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Encrypt traffic with this shared password
    #[arg(long, env = "SYNCRAFT_PASSWORD")]
    password: Option<String>,

    /// Allow `add` and `remove`
    #[arg(long)]
    dynamic: bool,

    /// Seconds a console command waits for its commit
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    if args.journal.is_some() {
        config.journal_file = args.journal.clone();
    }
    if args.dump.is_some() {
        config.full_dump_file = args.dump.clone();
    }
    if args.password.is_some() {
        config.password = args.password.clone();
    }
    config.dynamic_membership_change |= args.dynamic;
    // The console blocks on stdin, so the node needs its own tick thread
    config.auto_tick = true;

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    tracing::info!(
        "Starting node {} with partners {:?}",
        args.self_address,
        args.partner
    );

    let transport = TcpTransport::start(args.self_address.clone(), TcpSettings::from_config(&config))
        .context("starting TCP transport")?;

    let store = KeyValueStore::new();
    let reader = store.reader();
    let options = NodeOptions {
        on_ready: Some(Box::new(|| tracing::info!("Node caught up with the cluster"))),
        ..Default::default()
    };

    let node = Node::new(
        args.self_address.clone(),
        &args.partner,
        config,
        Box::new(store),
        Box::new(transport),
        options,
    )
    .context("creating node")?;

    let scheduler = Scheduler::start(node).context("starting tick thread")?;
    let ctx = ConsoleContext {
        node: scheduler.handle(),
        reader,
        timeout: Duration::from_secs(args.timeout),
    };

    run_console(&ctx, &CommandRegistry::with_defaults())?;

    tracing::info!("Shutting down...");
    scheduler.stop().context("stopping node")?;
    Ok(())
}

fn run_console(ctx: &ConsoleContext, registry: &CommandRegistry) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()?;

    for line in stdin.lock().lines() {
        let line = line?;
        if let Some((command, args)) = parse_command(&line) {
            match command.as_str() {
                "quit" | "exit" => break,
                "help" => {
                    for name in registry.list_commands() {
                        if let Some(help) = registry.get_help(&name) {
                            writeln!(stdout, "{}\n", help)?;
                        }
                    }
                }
                _ => match registry.execute(ctx, &command, args) {
                    Some(CommandOutput::Success(text)) => writeln!(stdout, "{}", text)?,
                    Some(CommandOutput::Error(text)) => writeln!(stdout, "error: {}", text)?,
                    None => writeln!(stdout, "unknown command {}, try help", command)?,
                },
            }
        }
        write!(stdout, "> ")?;
        stdout.flush()?;
    }
    Ok(())
}
