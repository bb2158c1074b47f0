// ABOUTME: Thin CLI for the claude-squad core: daemon and admin commands
//
// The interactive TUI front-end links against the library crate; this binary
// hosts the pieces that run without it.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use claude_squad::{config, daemon, git, session, zellij};

#[derive(Parser)]
#[command(
    name = "claude-squad",
    about = "Orchestrates fleets of AI coding agents in isolated git worktrees",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the headless auto-approval daemon.
    Daemon,
    /// Kill all sessions, remove all worktrees and branches, clear stored state.
    Reset,
    /// Print version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Daemon) => {
            let config = config::Config::load();
            daemon::run_daemon(&config).await
        }
        Some(Commands::Reset) => reset().await,
        Some(Commands::Version) => {
            println!("claude-squad {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

/// Tears down everything the product created on this host.
async fn reset() -> Result<()> {
    daemon::stop_daemon()?;

    if let Err(e) = zellij::cleanup_sessions().await {
        eprintln!("warning: failed to clean up zellij sessions: {e:#}");
    }
    if let Err(e) = claude_squad::docker::cleanup_containers().await {
        eprintln!("warning: failed to clean up docker containers: {e:#}");
    }
    if let Err(e) = git::cleanup_worktrees() {
        eprintln!("warning: failed to clean up worktrees: {e:#}");
    }

    let state = config::State::load();
    let mut storage = session::Storage::new(state);
    storage.delete_all_instances()?;

    println!("reset complete: sessions killed, worktrees removed, state cleared");
    Ok(())
}
