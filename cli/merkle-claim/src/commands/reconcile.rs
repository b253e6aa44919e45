use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use merkle_claim::eligibility::EventId;

use super::Service;

#[derive(Parser, Debug)]
#[command(name = "reconcile")]
#[command(about = "Compare the ledger with the distributors' claimed state", long_about = None)]
pub struct Cli {
    /// Service configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Only this campaign (default: every configured campaign)
    #[arg(short, long)]
    event_id: Option<EventId>,
}

pub async fn run(cli: Cli) -> Result<()> {
    let service = Service::start(&cli.config).await?;
    let reconciler = service.reconciler();

    let event_ids: Vec<EventId> = match cli.event_id {
        Some(event_id) => {
            if service.campaigns.get(event_id).is_none() {
                anyhow::bail!("Event {} is not a configured campaign", event_id);
            }
            vec![event_id]
        }
        None => service.campaigns.event_ids().collect(),
    };

    let mut divergent = 0;
    for event_id in event_ids {
        let report = reconciler
            .reconcile(event_id)
            .await
            .with_context(|| format!("Failed to reconcile event {}", event_id))?;
        divergent += report.divergences.len();
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize JSON")?;
        println!("{json}");
    }

    if divergent > 0 {
        anyhow::bail!("{} divergent entries found", divergent);
    }
    println!("Ledger and distributors agree.");
    Ok(())
}
