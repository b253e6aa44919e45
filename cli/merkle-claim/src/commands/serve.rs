use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use merkle_claim::api;

use super::Service;

#[derive(Parser, Debug)]
#[command(name = "serve")]
#[command(about = "Run the claim API and the periodic reconciler", long_about = None)]
pub struct Cli {
    /// Service configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,
}

async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub async fn run(cli: Cli) -> Result<()> {
    let service = Service::start(&cli.config).await?;
    service.check_published_roots().await?;

    let listener = TcpListener::bind(service.config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", service.config.listen))?;

    let (shutdown, shutdown_rx) = watch::channel(false);

    let reconciler = service.config.reconcile_interval().map(|interval| {
        let reconciler = service.reconciler();
        let event_ids = service.campaigns.event_ids().collect();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            reconciler
                .run_periodic(event_ids, interval, stopped(shutdown_rx))
                .await
        })
    });

    let coordinator = Arc::new(service.coordinator());
    let server = tokio::spawn(api::serve(listener, coordinator, stopped(shutdown_rx)));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    let _ = shutdown.send(true);

    server.await.context("API task panicked")??;
    if let Some(reconciler) = reconciler {
        reconciler.await.context("Reconciler task panicked")?;
    }
    info!("Stopped");
    Ok(())
}
