//! vmhost-core: Docker engine migrator and user-space network stack.

use anyhow::Result;
use clap::Parser;
use tracing::error;

mod cmd;

use vmhost_core::config::Configuration;

#[derive(Parser)]
#[command(name = "vmhost-core")]
#[command(about = "Host-side Docker engine migrator and user-space network stack")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: cmd::Commands,

    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("vmhost_core={}", log_level).into()),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => Configuration::load(path)?,
        None => Configuration::defaults(),
    };
    config.debug = config.debug || cli.debug;

    let result = match cli.command {
        cmd::Commands::Migrate(args) => cmd::migrate::run(args, &config).await,
        cmd::Commands::Serve(args) => cmd::serve::run(args, &config).await,
        cmd::Commands::Configure => cmd::configure::run().await,
        cmd::Commands::Diagnostics => cmd::diagnostics::run().await,
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }

    Ok(())
}
