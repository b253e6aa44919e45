use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use merkle_claim::distribution::Distribution;
use merkle_claim::eligibility::{load_records, EventId};
use merkle_claim::merkle::HashScheme;
use merkle_claim::write_file_atomic;

#[derive(Parser, Debug)]
#[command(name = "build-tree")]
#[command(about = "Build the Merkle tree of a campaign from its eligibility list", long_about = None)]
pub struct Cli {
    /// Eligibility JSON file: array of {wallet, eventId, amount}
    #[arg(short, long)]
    input: PathBuf,

    /// Campaign whose records go into the tree
    #[arg(short, long)]
    event_id: EventId,

    /// Digest used by the campaign's distributor
    #[arg(long, value_enum, default_value_t = HashScheme::Keccak256)]
    hash: HashScheme,

    /// Output file for the Merkle root
    #[arg(short, long)]
    root_output: PathBuf,

    /// Output file for the distribution (every claimant's amount, leaf and proof)
    #[arg(short, long)]
    distribution_output: Option<PathBuf>,
}

pub fn run(cli: Cli) -> Result<()> {
    println!("Reading eligibility records from {:?}...", cli.input);
    let records = load_records(&cli.input)?;
    println!("Total records: {}", records.len());

    println!("Building {} Merkle tree for event {}...", cli.hash, cli.event_id);
    let distribution = Distribution::build(cli.event_id, cli.hash, &records)
        .context("Failed to build Merkle tree")?;

    println!("Claimants: {}", distribution.claims.len());
    println!("Total amount: {}", distribution.total);
    println!("Merkle root: {}", distribution.root);

    write_file_atomic(&cli.root_output, &format!("{}\n", distribution.root))
        .context("Failed to write root file")?;

    if let Some(path) = cli.distribution_output {
        println!("Writing distribution to {:?}...", path);
        let json =
            serde_json::to_string_pretty(&distribution).context("Failed to serialize JSON")?;
        write_file_atomic(&path, &json).context("Failed to write distribution file")?;
    }

    println!("Done!");
    Ok(())
}
