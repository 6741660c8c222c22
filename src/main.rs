//! PMS supervisor binary.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pms_supervisor::config::Config;
use pms_supervisor::supervisor::Supervisor;

/// Power Management System supervisor for BMS/DCDC/PCS fleets.
#[derive(Debug, Parser)]
#[command(name = "pms-supervisor", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    info!(
        devices = config.devices.len(),
        broker = %config.mqtt.broker,
        location = config.location(),
        "configuration loaded"
    );

    let supervisor = Supervisor::start(config)
        .await
        .context("starting supervisor")?;
    supervisor.run_until_shutdown().await?;

    Ok(())
}
