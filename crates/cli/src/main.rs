//! Livefire CLI - Main Entry Point

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use livefire_cli::client::AdminClient;
use livefire_cli::commands::{revert, target};
use livefire_cli::output::{self, print_error, print_success};
use livefire_common::LivefireConfig;

/// Livefire - snapshot-based VM resets for live-fire exercises
#[derive(Parser)]
#[command(name = "livefire")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (defaults to ~/.livefire/config.toml)
    #[arg(long, env = "LIVEFIRE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Admin service address
    #[arg(long, env = "LIVEFIRE_SERVER", default_value = "http://127.0.0.1:8080", global = true)]
    server: String,

    /// Admin token for the service
    #[arg(long, env = "LIVEFIRE_ADMIN_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

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
    /// Revert a VM to a snapshot and power it on
    Revert(revert::RevertArgs),

    /// Power on a VM without reverting it
    PowerOn(revert::VmArgs),

    /// Show a VM's snapshot tree
    Snapshots(revert::SnapshotsArgs),

    /// Manage revert targets on the admin service
    #[command(subcommand)]
    Target(target::TargetCommands),

    /// Check admin service status
    Status,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
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

    let load_config = || -> anyhow::Result<LivefireConfig> {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(livefire_common::default_config_path);
        let mut config = LivefireConfig::load(&path)?;
        config.apply_env_overrides();
        Ok(config)
    };

    match cli.command {
        Commands::Revert(args) => revert::revert(args, &load_config()?, cli.format).await?,
        Commands::PowerOn(args) => revert::power_on(args, &load_config()?, cli.format).await?,
        Commands::Snapshots(args) => revert::snapshots(args, &load_config()?, cli.format).await?,
        Commands::Target(cmd) => {
            let client = AdminClient::new(&cli.server, cli.token.clone())?;
            target::execute(cmd, client, cli.format).await?
        }
        Commands::Status => {
            let client = AdminClient::new(&cli.server, None)?;
            match client.health().await {
                Ok(_) => print_success(&format!("Admin service is running at {}", client.base())),
                Err(e) => {
                    print_error(&format!("Admin service is not responding at {}: {:#}", client.base(), e));
                    std::process::exit(1);
                }
            }
        }
        Commands::Version => {
            println!("Livefire CLI v{}", livefire_common::VERSION);
        }
    }

    Ok(())
}
