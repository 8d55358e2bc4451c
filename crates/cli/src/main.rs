//! WgKeeper CLI - Main Entry Point
//!
//! Creates, removes and lists WireGuard peers against a mounted
//! WireGuard config tree and reloads the interface afterwards.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use wgkeeper_common::{Error, KeeperConfig};

mod commands;
mod output;

use commands::{peer, server, App};

/// WgKeeper CLI - WireGuard peer lifecycle management
#[derive(Parser)]
#[command(name = "wgkeeper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file
    #[arg(long, env = "WGKEEPER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Override the WireGuard config root from the config file
    #[arg(long, env = "WIREGUARD_PATH", global = true)]
    wireguard_path: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Peer(peer::PeerCommands),

    /// Show server key and config status
    ServerInfo,

    /// Restart the WireGuard interface now
    Reload,

    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show version information
    Version,
}

/// Exit status for library errors the operator can act on
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(Error::InvalidName(_)) => 2,
        Some(Error::NotFound { .. }) => 3,
        Some(Error::AlreadyExists { .. }) => 4,
        _ => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(wgkeeper_common::default_config_path);

    match cli.command {
        Commands::InitConfig { force } => return server::init_config(&config_path, force),
        Commands::Version => {
            println!("WgKeeper CLI v{}", wgkeeper_common::VERSION);
            return Ok(());
        }
        _ => {}
    }

    let mut config = KeeperConfig::load(&config_path)?;
    if let Some(path) = cli.wireguard_path {
        config.wireguard_path = path;
    }
    tracing::debug!("Using WireGuard root {}", config.wireguard_path.display());

    let app = App::new(&config)?;
    let result = match cli.command {
        Commands::Peer(cmd) => peer::execute(cmd, &app, cli.format).await,
        Commands::ServerInfo => server::info(&app, cli.format).await,
        Commands::Reload => server::reload(&app).await,
        Commands::InitConfig { .. } | Commands::Version => Ok(()),
    };

    // Output is already printed; queued reloads finish before exit
    app.finish().await;
    result
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(exit_code(&e));
    }
}
