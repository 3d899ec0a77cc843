use anyhow::Result;
use clap::Parser;

use portwarden_daemon::cli::DaemonCli;
use portwarden_daemon::logging;
use portwarden_daemon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();
    let config = cli.resolve_config().await?;

    if cli.validate {
        println!("configuration is valid");
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "portwarden-daemon starting");

    let mut orchestrator = Orchestrator::build_from_config(config)?;
    if let Err(e) = orchestrator.run().await {
        tracing::error!(error = %e, "portwarden-daemon failed");
        return Err(e);
    }

    tracing::info!("portwarden-daemon shut down");
    Ok(())
}
