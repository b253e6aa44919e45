use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;

use merkle_claim::campaign::Campaigns;
use merkle_claim::config::Config;
use merkle_claim::eligibility::load_records;
use merkle_claim::hex_encode;
use merkle_claim::ledger::EligibilityLedger;

use super::open_ledger;

#[derive(Parser, Debug)]
#[command(name = "import")]
#[command(about = "Seed the eligibility ledger from a JSON list", long_about = None)]
pub struct Cli {
    /// Service configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Eligibility JSON file: array of {wallet, eventId, amount}
    #[arg(short, long)]
    input: PathBuf,
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;

    println!("Reading eligibility records from {:?}...", cli.input);
    let records = load_records(&cli.input)?;

    let configured: BTreeSet<_> = config.campaigns.iter().map(|c| c.event_id).collect();
    let unconfigured: BTreeSet<_> = records
        .iter()
        .map(|r| r.event_id)
        .filter(|id| !configured.contains(id))
        .collect();
    for event_id in &unconfigured {
        warn!(event_id, "Importing records for an event with no configured campaign");
    }

    let ledger = open_ledger(&config).await?;
    let report = ledger
        .seed(&records)
        .await
        .context("Failed to seed eligibility ledger")?;
    println!(
        "Imported {} records ({} new, {} already present)",
        records.len(),
        report.inserted,
        report.unchanged
    );

    let campaigns = Campaigns::load(&ledger, &config.campaign_specs()).await?;
    for event_id in campaigns.event_ids() {
        if let Some(campaign) = campaigns.get(event_id) {
            println!(
                "Event {}: {} leaves, {} root {}",
                event_id,
                campaign.leaf_count(),
                campaign.scheme(),
                hex_encode(campaign.root())
            );
        }
    }

    println!("Done!");
    Ok(())
}
