use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mqc_core::ClaimConfig;
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{ClaimCommand, CommandContext, MessageCommand, QueueCommand};

#[derive(Parser, Debug)]
#[command(name = "mqc")]
#[command(about = "Message queue claims over a SQLite store", long_about = None)]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "MQC_DB")]
    db: PathBuf,
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "")]
    project: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage queues
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },
    /// Post and inspect messages
    Message {
        #[command(subcommand)]
        action: MessageCommand,
    },
    /// Take, inspect, renew and release claims
    Claim {
        #[command(subcommand)]
        action: ClaimCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = match &config_path {
        Some(path) => ClaimConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ClaimConfig::default(),
    };
    debug!(event = "config_loaded", path = ?config_path, default_limit = config.default_limit);

    let ctx = CommandContext::open(&cli.db, config, &cli.project)?;
    let output = match cli.command {
        Commands::Queue { action } => commands::handle_queue_command(&ctx, action)?,
        Commands::Message { action } => commands::handle_message_command(&ctx, action)?,
        Commands::Claim { action } => commands::handle_claim_command(&ctx, action)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_logging() {
    let level = env::var("MQC_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn resolve_config_path(flag: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(path.to_path_buf());
    }
    env::var_os("MQC_CONFIG_PATH").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_claim_create_with_globals() {
        let cli = Cli::try_parse_from([
            "mqc", "--db", "q.db", "--project", "p1", "claim", "create", "jobs", "--ttl", "30",
            "--grace", "10", "--limit", "3",
        ])
        .expect("parse");

        assert_eq!(cli.db, PathBuf::from("q.db"));
        assert_eq!(cli.project, "p1");
        match cli.command {
            Commands::Claim {
                action: ClaimCommand::Create(args),
            } => {
                assert_eq!(args.queue, "jobs");
                assert_eq!((args.ttl, args.grace, args.limit), (30, 10, Some(3)));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn explicit_config_flag_wins() {
        let path = resolve_config_path(Some(Path::new("/tmp/mqc.toml")));
        assert_eq!(path, Some(PathBuf::from("/tmp/mqc.toml")));
    }

    #[test]
    fn claim_renew_requires_ttl() {
        let result = Cli::try_parse_from(["mqc", "--db", "q.db", "claim", "renew", "jobs", "abc"]);
        assert!(result.is_err());
    }
}
