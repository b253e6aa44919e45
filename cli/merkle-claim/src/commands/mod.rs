pub mod build_tree;
pub mod claim;
pub mod import;
pub mod reconcile;
pub mod serve;
pub mod verify;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use merkle_claim::campaign::Campaigns;
use merkle_claim::chain::EvmSubmitter;
use merkle_claim::config::{AdminKey, Config};
use merkle_claim::coordinator::ClaimCoordinator;
use merkle_claim::hex_encode;
use merkle_claim::ledger::SqliteLedger;
use merkle_claim::reconcile::Reconciler;

pub async fn open_ledger(config: &Config) -> Result<SqliteLedger> {
    SqliteLedger::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open ledger at {}", config.database_url))
}

/// Everything needed to settle claims: ledger, chain client and the campaign
/// trees rebuilt from the ledger.
pub struct Service {
    pub config: Config,
    pub ledger: Arc<SqliteLedger>,
    pub chain: Arc<EvmSubmitter>,
    pub campaigns: Arc<Campaigns>,
}

impl Service {
    pub async fn start(config_path: &Path) -> Result<Self> {
        let config = Config::load(config_path)?;

        let admin_key = AdminKey::load(&config.admin_key_file).context("Failed to load admin key")?;
        info!(address = %admin_key.address(), "Admin key loaded");

        let ledger = open_ledger(&config).await?;
        let campaigns = Campaigns::load(&ledger, &config.campaign_specs()).await?;
        let chain = EvmSubmitter::new(
            &config.rpc_url,
            admin_key.into_signer(),
            config.distributors(),
            config.confirmations,
            config.tx_timeout(),
        )?;

        Ok(Self {
            config,
            ledger: Arc::new(ledger),
            chain: Arc::new(chain),
            campaigns: Arc::new(campaigns),
        })
    }

    /// Compares each campaign root with the one stored in its distributor. A
    /// mismatch is fatal; an unreachable node only warns so the service can
    /// start while the RPC endpoint recovers.
    pub async fn check_published_roots(&self) -> Result<()> {
        for event_id in self.campaigns.event_ids() {
            let Some(campaign) = self.campaigns.get(event_id) else {
                continue;
            };
            match self.chain.merkle_root(event_id).await {
                Ok(published) if published == campaign.root() => {
                    info!(event_id, root = %hex_encode(published), "Distributor root matches");
                }
                Ok(published) => anyhow::bail!(
                    "Distributor for event {} publishes root {}, ledger builds {}",
                    event_id,
                    hex_encode(published),
                    hex_encode(campaign.root())
                ),
                Err(err) => warn!(event_id, "Could not read distributor root: {err}"),
            }
        }
        Ok(())
    }

    pub fn coordinator(&self) -> ClaimCoordinator {
        ClaimCoordinator::new(
            self.ledger.clone(),
            self.chain.clone(),
            self.campaigns.clone(),
            self.config.retry,
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.ledger.clone(), self.chain.clone())
    }
}
