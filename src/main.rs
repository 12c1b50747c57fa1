#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value
)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use ircbot::{Config, ShutdownReason};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// Chat bot runtime.
#[derive(Parser, Debug)]
#[command(name = "ircbot")]
#[command(version)]
#[command(about = "Long-running chat bot with cached lookups and periodic backups.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bot until it is told to quit
    Run {
        /// Configuration file (`*.toml` or `key = value` lines)
        config: PathBuf,

        /// Log at debug level unless RUST_LOG says otherwise
        #[arg(short, long)]
        verbose: bool,
    },

    /// Load and validate a configuration file
    Check {
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Run { verbose: true, .. } => "debug",
        _ => "info",
    };
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Check { config } => {
            let config = Config::load(&config)?;
            println!("✅ {} is valid", config.server);
            println!("   nick:      {}", config.nick);
            println!("   channels:  {}", config.channels.join(", "));
            println!("   database:  {}", config.dbname.display());
            println!("   snapshot:  {}", config.snapshot_path().display());
            println!("   timeout:   {}s", config.timeout().as_secs());
            println!("   in flight: {}", config.max_in_flight());
            match config.news_url.as_deref() {
                Some(url) => println!("   news:      {url} at :{:02}", config.news_minute()),
                None => println!("   news:      disabled"),
            }
            Ok(())
        }
        Commands::Run { config, .. } => run_forever(config).await,
    }
}

/// Start runtimes until one ends for a reason that should not restart, or
/// until one ends and no restart delay is configured.
async fn run_forever(path: PathBuf) -> Result<()> {
    loop {
        let config = Config::load(&path)?;
        let delay = config.restart_delay();

        let reason = ircbot::run(config).await?;
        match (reason.should_restart(), delay) {
            (true, Some(delay)) => {
                warn!(%reason, delay_secs = delay.as_secs(), "runtime stopped; restarting");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
            }
            _ => {
                info!(%reason, "exiting");
                return exit_status(&reason);
            }
        }
    }
}

fn exit_status(reason: &ShutdownReason) -> Result<()> {
    match reason {
        ShutdownReason::AdminQuit | ShutdownReason::Signal | ShutdownReason::ConnectionClosed => {
            Ok(())
        }
        other => anyhow::bail!("runtime stopped: {other}"),
    }
}
