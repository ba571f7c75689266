mod daemon;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use camflux_core::{config::Config, logging};

use daemon::CamfluxDaemon;

/// IP camera ingest and relay daemon.
#[derive(Debug, Parser)]
#[command(name = "camflux", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "CAMFLUX_CONFIG")]
    config: Option<String>,

    /// Overrides logging.level from the configuration.
    #[arg(long)]
    log_level: Option<String>,

    /// Overrides logging.format ("pretty" or "json").
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration (fail fast on misconfigurations)
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.validate()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(
        cameras = config.cameras.len(),
        publish_target = %config.publish.base_url,
        "camflux starting"
    );

    // 3. Run until a shutdown signal arrives
    CamfluxDaemon::new(config)?.run().await
}
