use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::prelude::*;

use condo_client::config::CondoConfig;

mod cli;

#[derive(Parser)]
#[command(name = "condo")]
#[command(about = "Department chat and resident notifications from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom config directory (defaults to ~/.condo)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow notifications (and a department chat) live
    Watch(WatchArgs),

    /// Send a message to a department chat
    Send(SendArgs),

    /// Print a department's chat history
    History(HistoryArgs),

    /// List notifications
    Notifications(NotificationsArgs),

    /// Mark notifications as read
    MarkRead(MarkReadArgs),
}

#[derive(Parser)]
struct WatchArgs {
    /// Department whose chat to follow
    #[arg(long)]
    department: Option<u64>,

    /// User whose notifications to follow (default: configured user)
    #[arg(long)]
    user: Option<u64>,
}

#[derive(Parser)]
struct SendArgs {
    /// Department to send to
    #[arg(long)]
    department: u64,

    /// Message text
    #[arg(required = true, num_args = 1..)]
    text: Vec<String>,
}

#[derive(Parser)]
struct HistoryArgs {
    #[arg(long)]
    department: u64,
}

#[derive(Parser)]
struct NotificationsArgs {
    #[arg(long)]
    user: Option<u64>,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct MarkReadArgs {
    /// Notification id
    #[arg(conflicts_with = "all", required_unless_present = "all")]
    id: Option<String>,

    /// Mark every notification of the user read
    #[arg(long)]
    all: bool,

    #[arg(long)]
    user: Option<u64>,
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "condo=debug,condo_client=debug,condo_sync=debug,info"
    } else {
        "condo=info,condo_client=info,condo_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = CondoConfig::new(cli.config_dir)?;
    debug!(config_dir = %config.config_dir.display(), "configuration loaded");

    match cli.command {
        Commands::Watch(args) => cli::watch_command(&config, args.user, args.department).await,
        Commands::Send(args) => {
            cli::send_command(&config, args.department, &args.text.join(" ")).await
        }
        Commands::History(args) => cli::history_command(&config, args.department).await,
        Commands::Notifications(args) => {
            cli::notifications_command(&config, args.user, args.json).await
        }
        Commands::MarkRead(args) => {
            cli::mark_read_command(&config, args.user, args.id, args.all).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn send_joins_words() {
        let cli = Cli::try_parse_from(["condo", "send", "--department", "2", "hola", "a", "todos"])
            .unwrap();
        match cli.command {
            Commands::Send(args) => {
                assert_eq!(args.department, 2);
                assert_eq!(args.text.join(" "), "hola a todos");
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn mark_read_needs_id_or_all() {
        assert!(Cli::try_parse_from(["condo", "mark-read"]).is_err());
        assert!(Cli::try_parse_from(["condo", "mark-read", "5", "--all"]).is_err());
        assert!(Cli::try_parse_from(["condo", "mark-read", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["condo", "mark-read", "5"]).is_ok());
    }
}
