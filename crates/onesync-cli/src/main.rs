//! onesync CLI - command-line interface for the sync engine
//!
//! Thin shell around the engine: argument parsing, tracing setup,
//! configuration loading, and adapter wiring. All synchronization logic
//! lives in the engine crates.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod wiring;

use commands::login::LoginCommand;
use commands::monitor::MonitorCommand;
use commands::status::StatusCommand;
use commands::sync::SyncCommand;

#[derive(Debug, Parser)]
#[command(name = "onesync", version, about = "Bidirectional OneDrive sync engine")]
pub struct Cli {
    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use an alternate config file
    #[arg(long, global = true)]
    config: Option<String>,

    /// Azure AD application (client) id
    #[arg(long, global = true, env = "ONESYNC_APP_ID")]
    app_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sign in to OneDrive and store the refresh token
    Login(LoginCommand),
    /// Run one synchronization cycle
    Sync(SyncCommand),
    /// Sync continuously, reacting to filesystem changes
    Monitor(MonitorCommand),
    /// Show drives, quota, and persisted sync state
    Status(StatusCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let ctx = wiring::CliContext::new(cli.config.as_deref(), cli.app_id.clone())?;

    match cli.command {
        Commands::Login(cmd) => cmd.execute(&ctx).await,
        Commands::Sync(cmd) => cmd.execute(&ctx).await,
        Commands::Monitor(cmd) => cmd.execute(&ctx).await,
        Commands::Status(cmd) => cmd.execute(&ctx).await,
    }
}
