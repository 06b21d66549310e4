//! qscaled — the qscale daemon.
//!
//! Single binary serving the external-scaler gRPC protocol. Scaling knobs
//! and backend selection come from the environment; workload addressing
//! arrives as scaler metadata on the first poll.
//!
//! # Usage
//!
//! ```text
//! qscaled serve --port 6000
//! ```

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tracing::info;

use qscale_server::{ScalerService, Settings};

#[derive(Parser)]
#[command(name = "qscaled", about = "qscale external-scaler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the external-scaler gRPC endpoint.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "6000")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,qscaled=debug,qscale=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port } => serve(port).await,
    }
}

async fn serve(port: u16) -> anyhow::Result<()> {
    info!("qscale daemon starting");

    let settings = Settings::from_env()?;

    info!(
        target_per_replica = settings.target_per_replica,
        error_rate_threshold = settings.error_rate_threshold,
        scale_down_cooldown = ?settings.scale_down_cooldown,
        queue_length_metric = %settings.queue_length_metric,
        error_rate_metric = %settings.error_rate_metric,
        metrics_backend = ?settings.metrics_backend,
        compute_backend = ?settings.compute_backend,
        "settings loaded"
    );

    let service = ScalerService::new(settings);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "external scaler listening");

    tonic::transport::Server::builder()
        .add_service(service.into_service())
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
        })
        .await?;

    info!("qscale daemon stopped");
    Ok(())
}
