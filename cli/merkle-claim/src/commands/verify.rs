use anyhow::{Context, Result};
use clap::Parser;

use merkle_claim::eligibility::{EventId, Wallet};
use merkle_claim::merkle::{self, HashScheme};
use merkle_claim::{hex_encode, parse_hash32, validate_merkle_root};

#[derive(Parser, Debug)]
#[command(name = "verify")]
#[command(about = "Check a Merkle proof against a published root", long_about = None)]
pub struct Cli {
    /// Merkle root (hex format)
    #[arg(short, long)]
    root: String,

    #[arg(short, long)]
    wallet: Wallet,

    #[arg(short, long)]
    event_id: EventId,

    /// Amount in the token's smallest unit
    #[arg(short, long)]
    amount: u128,

    /// Sibling hashes, leaf level first (comma separated or repeated)
    #[arg(short, long, value_delimiter = ',')]
    proof: Vec<String>,

    #[arg(long, value_enum, default_value_t = HashScheme::Keccak256)]
    hash: HashScheme,
}

pub fn run(cli: &Cli) -> Result<()> {
    let root = validate_merkle_root(&cli.root).context("Invalid Merkle root")?;
    let proof = cli
        .proof
        .iter()
        .map(|node| parse_hash32(node).with_context(|| format!("Invalid proof node {node}")))
        .collect::<Result<Vec<_>>>()?;

    let leaf = cli.hash.leaf(&cli.wallet, cli.event_id, cli.amount);
    println!("Leaf: {}", hex_encode(leaf));

    if !merkle::verify(cli.hash, &leaf, &proof, &root) {
        anyhow::bail!(
            "Proof does not verify: {} is not entitled to {} in event {} under root {}",
            cli.wallet,
            cli.amount,
            cli.event_id,
            hex_encode(root)
        );
    }
    println!("Proof valid ({} nodes)", proof.len());
    Ok(())
}
