//! Worker entry point.

use std::process::ExitCode;
use std::sync::Arc;

use runtime::{Config, Platform, telemetry};
use saga::InMemoryStockReservations;
use tokio::signal;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::warn!(%error, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

async fn run(config: Config) -> runtime::Result<()> {
    telemetry::init_metrics(&config)?;

    let stock = Arc::new(InMemoryStockReservations::new());
    let platform = Platform::connect(config, stock).await?;
    platform.start().await?;

    shutdown_signal().await;
    platform.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();
    if let Err(error) = telemetry::init_tracing(&config) {
        eprintln!("{error}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "platform failed");
            ExitCode::FAILURE
        }
    }
}
