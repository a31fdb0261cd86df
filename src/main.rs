//! sockstun - SOCKS5 over a compressed private tunnel
//!
//! `sockstun local` serves SOCKS5 to applications and forwards every CONNECT through
//! the remote agent; `sockstun remote` resolves and connects on their behalf.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sockstun_local::LocalConfig;
use sockstun_remote::RemoteConfig;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Two-sided SOCKS5 tunnel
#[derive(Parser, Debug)]
#[command(name = "sockstun")]
#[command(about = "SOCKS5 proxy tunnelled through a compressed private protocol", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "SOCKSTUN_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the local agent: a SOCKS5 server on the user's machine
    #[command(long_about = r#"
Run the local agent. Applications connect to it with SOCKS5 (no authentication,
CONNECT to a domain name); each connection is carried to the remote agent.

EXAMPLE CONFIG:
  {
    "server": "203.0.113.10",
    "server_port": 8388,
    "server_ipv6": false,
    "local_address": "127.0.0.1",
    "local_port": 1080,
    "password": "secret",
    "timeout": 6
  }
    "#)]
    Local {
        /// Path to the JSON config file
        #[arg(short, long, env = "SOCKSTUN_CONFIG")]
        config: PathBuf,
    },

    /// Run the remote agent: resolves targets and relays to them
    #[command(long_about = r#"
Run the remote agent. Local agents connect to it; it checks the password,
resolves the requested host and relays data to the destination.

EXAMPLE CONFIG:
  {
    "server_port": 8388,
    "server_ipv6": false,
    "password": "secret",
    "dns_timeout": 3,
    "timeout": 5
  }
    "#)]
    Remote {
        /// Path to the JSON config file
        #[arg(short, long, env = "SOCKSTUN_CONFIG")]
        config: PathBuf,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run_local(config: PathBuf) -> Result<()> {
    let config = LocalConfig::load(&config)
        .with_context(|| format!("Failed to load local agent config from {}", config.display()))?;
    let options = config.options().context("Invalid local agent config")?;

    info!("Local agent listening on {}", options.listen_addr);
    info!("Remote agent: {}", options.remote_addr);

    sockstun_local::serve(options)
        .await
        .context("Local agent stopped")
}

async fn run_remote(config: PathBuf) -> Result<()> {
    let config = RemoteConfig::load(&config)
        .with_context(|| format!("Failed to load remote agent config from {}", config.display()))?;
    let options = config.options().context("Invalid remote agent config")?;

    info!("Remote agent listening on {}", options.listen_addr);
    info!(
        "DNS timeout: {:?}, connect timeout: {:?}",
        options.dns_timeout, options.timeout
    );

    sockstun_remote::serve(options)
        .await
        .context("Remote agent stopped")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);
    info!("sockstun {} ({})", env!("GIT_TAG"), env!("GIT_HASH"));

    let agent = async move {
        match cli.command {
            Commands::Local { config } => run_local(config).await,
            Commands::Remote { config } => run_remote(config).await,
        }
    };

    tokio::select! {
        result = agent => {
            if let Err(e) = &result {
                error!("{:#}", e);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    }
}
