//! Service host - main entry point.
//!
//! Loads the host configuration, scans the services dirs, starts autostart
//! services as child-process workers and runs until interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use service_host::host::ServiceHost;
use service_host::workers::{Launchers, ProcessLauncher};
use service_host::{Config, Error};

#[derive(Debug, Parser)]
#[command(name = "service-host", version, about)]
struct Args {
    /// Host configuration file (JSON).
    #[arg(short, long, env = "SERVICE_HOST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,

    /// Do not start autostart services.
    #[arg(long)]
    no_autostart: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }
    if args.no_autostart {
        config.supervisor.auto_start = false;
    }

    service_host::observability::init_tracing_with(&config.observability);

    let launcher = ProcessLauncher::from_config(&config.workers)
        .ok_or_else(|| Error::validation("workers.program must be configured"))?;
    let launcher = Arc::new(launcher);
    let launchers = Launchers::new(launcher.clone()).with_isolated(launcher);

    let host = ServiceHost::new(&config, launchers).await?;
    host.bootstrap().await?;
    tracing::info!("service host running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    host.shutdown().await;

    Ok(())
}
