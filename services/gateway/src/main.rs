//! Conduit gateway entry point

use anyhow::{Context, Result};
use bus::BusError;
use clap::Parser;
use conduit_gateway::Gateway;
use config::ConduitConfig;
use dispatch::DispatchError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, overrides log.level from the config
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log filter '{level}'"))?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("Failed to install log subscriber")?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .context("Failed to install log subscriber")?;
    }
    Ok(())
}

/// Duplicate routers and bad pool settings cannot be fixed by retrying
fn is_setup_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(e) = cause.downcast_ref::<DispatchError>() {
            return e.is_setup_error();
        }
        matches!(
            cause.downcast_ref::<BusError>(),
            Some(BusError::Configuration { .. })
        )
    })
}

async fn run(args: Args) -> Result<()> {
    let mut config = ConduitConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if args.json_logs {
        config.log.json = true;
    }
    init_logging(&config.log.level, config.log.json)?;

    info!("Starting Conduit gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let gateway = Gateway::start(&config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("Shutdown signal received");

    gateway.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_setup_error(&e) => {
            error!("fatal setup error: {:#}", e);
            eprintln!("fatal setup error: {e:#}");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("gateway failed: {:#}", e);
            eprintln!("gateway failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
