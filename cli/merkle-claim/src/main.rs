#![forbid(unsafe_code)]
#![allow(unreachable_pub)]

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{build_tree, claim, import, reconcile, serve, verify};

#[derive(Parser, Debug)]
#[command(name = "merkle-claim")]
#[command(about = "Merkle distributor claim tools and service", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    BuildTree(build_tree::Cli),
    Verify(verify::Cli),
    Import(import::Cli),
    Serve(serve::Cli),
    Claim(claim::Cli),
    Reconcile(reconcile::Cli),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::BuildTree(args) => build_tree::run(args)?,
        Commands::Verify(args) => verify::run(&args)?,
        Commands::Import(args) => import::run(args).await?,
        Commands::Serve(args) => serve::run(args).await?,
        Commands::Claim(args) => claim::run(args).await?,
        Commands::Reconcile(args) => reconcile::run(args).await?,
    }

    Ok(())
}
