// src/main.rs

use clap::Parser;
use color_eyre::eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use nextscan::config::{Cli, ScanConfig};
use nextscan::logging::initialize_logging;
use nextscan::runner;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    initialize_logging(cli.verbose)?;

    let config = match ScanConfig::from_cli(cli) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Invalid configuration.");
            return Err(err.into());
        }
    };

    // First Ctrl-C stops admissions; in-flight probes finish and a final
    // checkpoint is written.
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight probes.");
            interrupt.cancel();
        }
    });

    let report = match runner::run(&config, cancel).await {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "Scan failed.");
            return Err(err.into());
        }
    };

    if config.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
