//! Recovery Agent - Main entry point

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use recovery_agent::store::{BackupKind, LATEST};
use recovery_agent::{utils, Collaborators, Command, Config, Dispatcher};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create a backup of the node data directory
    Backup {
        #[arg(value_enum, default_value_t = KindArg::Full)]
        kind: KindArg,
    },
    /// Restore the data directory from a backup
    Restore {
        #[arg(default_value = LATEST)]
        selector: String,
    },
    /// Check a backup against its recorded digest
    Verify {
        #[arg(default_value = LATEST)]
        selector: String,
    },
    /// End-to-end drill: backup, simulated corruption, restore, health check
    Test,
    /// Move the node to a standby host
    Failover { target: String },
    /// Measure recovery time against the RTO target
    TestRto,
    /// Measure data loss against the RPO target
    TestRpo,
    /// Report node health; exits non-zero when unhealthy
    Health,
    /// Prune backups past the retention window
    Clean,
    /// List known backups, newest first
    List,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Full,
    Incremental,
}

impl From<Cmd> for Command {
    fn from(cmd: Cmd) -> Self {
        match cmd {
            Cmd::Backup { kind: KindArg::Full } => Command::Backup(BackupKind::Full),
            Cmd::Backup { kind: KindArg::Incremental } => Command::Backup(BackupKind::Incremental),
            Cmd::Restore { selector } => Command::Restore(selector),
            Cmd::Verify { selector } => Command::Verify(selector),
            Cmd::Test => Command::Drill,
            Cmd::Failover { target } => Command::Failover(target),
            Cmd::TestRto => Command::TestRto,
            Cmd::TestRpo => Command::TestRpo,
            Cmd::Health => Command::Health,
            Cmd::Clean => Command::Clean,
            Cmd::List => Command::List,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    config.apply_env_overrides()?;
    config.validate()?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, config.log.file.as_deref())?;

    tracing::info!(
        "Starting recovery-agent v{} (data dir: {})",
        env!("CARGO_PKG_VERSION"),
        config.node.data_dir.display()
    );

    let dispatcher = Dispatcher::new(&config, Collaborators::from_config(&config)?)?;
    let outcome = dispatcher.run(args.command.into()).await;

    println!("{}", outcome.summary);
    std::process::exit(if outcome.success { 0 } else { 1 });
}
