//! perch: connect to every configured network and run until told to quit.
//!
//!   perch [--log-json] <config file>
//!
//! Create a configuration with `perch-wizard`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use perch_core::{Bot, Clock, Registry};

#[derive(Parser)]
#[command(name = "perch", about = "A plugin-driven IRC bot", version)]
struct Args {
    /// Configuration file written by perch-wizard
    config: PathBuf,

    /// Log as JSON lines instead of text
    #[arg(long, env = "PERCH_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "perch_core=info,perch_bot=info".into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let registry = Registry::with_core();
    registry
        .load_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    perch_bot::apply_default_providers(&registry);

    let bot = Bot::with_registry(Arc::new(registry), perch_bot::builtin_catalog(), Clock::system())?;
    tracing::info!(
        config = %args.config.display(),
        networks = bot.networks().len(),
        "Starting perch"
    );

    let shutdown = bot.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupted, shutting down");
                shutdown.trigger("Interrupted");
            }
            Err(e) => tracing::warn!(error = %e, "Cannot listen for Ctrl+C"),
        }
    });

    bot.run().await
}
