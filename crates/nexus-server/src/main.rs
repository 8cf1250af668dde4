//! Main entry point for the Banco Nexus ledger server.

use anyhow::Context;
use clap::Parser;
use nexus_server::{
    model::{Cli, load_configuration},
    startup::{self, LoggingConfig},
};
use tracing::{error, info};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = load_configuration(&cli).context("loading configuration")?;

    let logging_config = LoggingConfig::from_configuration(&configuration);
    let _logging_guard = startup::init_logging(&logging_config)
        .map_err(|e| anyhow::anyhow!("initializing logging: {}", e))?;

    nexus_server::metrics::init_metrics();

    let server_address = configuration.server_address();
    let server_port = configuration.server_port();

    let app_state = startup::build_app_state(configuration)
        .await
        .context("starting ledger components")?;
    app_state.scheduler.start();

    let shutdown_signal = startup::wait_for_shutdown_signal();
    let mut shutdown_rx = shutdown_signal.subscribe();

    info!(
        "Starting Nexus ledger server on {}:{}",
        server_address, server_port
    );
    let server = startup::main_server(app_state.clone(), server_address, server_port)?;
    let server_handle = server.handle();

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        }
        _ = shutdown_rx.recv() => {
            info!("HTTP server shutting down gracefully");
            server_handle.stop(true).await;
        }
    }

    app_state.shutdown();
    info!("Nexus ledger server shutdown complete");
    Ok(())
}
