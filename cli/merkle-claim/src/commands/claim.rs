use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use merkle_claim::coordinator::{ClaimRequest, Settlement};
use merkle_claim::eligibility::{EventId, Wallet};

use super::Service;

#[derive(Parser, Debug)]
#[command(name = "claim")]
#[command(about = "Settle one claim through the coordinator", long_about = None)]
pub struct Cli {
    /// Service configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    #[arg(short, long)]
    wallet: Wallet,

    #[arg(short, long)]
    event_id: EventId,
}

pub async fn run(cli: Cli) -> Result<()> {
    let service = Service::start(&cli.config).await?;
    let coordinator = service.coordinator();

    println!("Claiming event {} for {}...", cli.event_id, cli.wallet);
    let receipt = coordinator
        .claim(ClaimRequest::new(cli.wallet, cli.event_id))
        .await?;

    match receipt.settlement {
        Settlement::Confirmed => println!("\nClaim confirmed!"),
        Settlement::AlreadyClaimed => println!("\nAlready claimed earlier."),
    }
    println!("Amount: {}", receipt.amount);
    println!("Transaction: {}", receipt.tx_hash);
    Ok(())
}
