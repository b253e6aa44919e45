//! Per-event campaign registry: hash scheme and the Merkle tree rebuilt from
//! the ledger, checked against the root published in the distributor.

use std::collections::BTreeMap;

use anyhow::Context;
use tracing::info;

use crate::common::hex_encode;
use crate::eligibility::{EligibilityEntry, EventId, Wallet};
use crate::ledger::EligibilityLedger;
use crate::merkle::{self, Hash, HashScheme, MerkleError, MerkleTree};

#[derive(Debug, Clone)]
pub struct Campaign {
    event_id: EventId,
    tree: MerkleTree,
}

impl Campaign {
    pub fn from_entries(
        event_id: EventId,
        scheme: HashScheme,
        entries: &[EligibilityEntry],
    ) -> Result<Self, MerkleError> {
        let leaves = entries
            .iter()
            .filter(|e| e.event_id == event_id)
            .map(|e| scheme.leaf(&e.wallet, event_id, e.amount))
            .collect();
        Ok(Self {
            event_id,
            tree: MerkleTree::from_leaves(scheme, leaves)?,
        })
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn scheme(&self) -> HashScheme {
        self.tree.scheme()
    }

    pub fn root(&self) -> Hash {
        self.tree.root()
    }

    pub fn leaf_count(&self) -> usize {
        self.tree.leaf_count()
    }

    pub fn leaf(&self, wallet: &Wallet, amount: u128) -> Hash {
        self.scheme().leaf(wallet, self.event_id, amount)
    }

    pub fn proof_for(&self, wallet: &Wallet, amount: u128) -> Option<Vec<Hash>> {
        self.tree.proof(&self.leaf(wallet, amount))
    }

    pub fn verify(&self, wallet: &Wallet, amount: u128, proof: &[Hash]) -> bool {
        merkle::verify(self.scheme(), &self.leaf(wallet, amount), proof, &self.root())
    }
}

/// What the operator pinned for a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignSpec {
    pub event_id: EventId,
    pub scheme: HashScheme,
    pub root: Option<Hash>,
}

#[derive(Debug, Clone, Default)]
pub struct Campaigns {
    by_event: BTreeMap<EventId, Campaign>,
}

impl Campaigns {
    pub fn new(campaigns: impl IntoIterator<Item = Campaign>) -> Self {
        Self {
            by_event: campaigns.into_iter().map(|c| (c.event_id, c)).collect(),
        }
    }

    /// Rebuilds every campaign's tree from the ledger. A pinned root that does
    /// not match the ledger contents aborts: the service would otherwise hand
    /// out proofs the distributor rejects.
    pub async fn load(
        ledger: &dyn EligibilityLedger,
        specs: &[CampaignSpec],
    ) -> anyhow::Result<Self> {
        let mut campaigns = Vec::with_capacity(specs.len());
        for spec in specs {
            let entries = ledger
                .entries(spec.event_id)
                .await
                .with_context(|| format!("Failed to load entries for event {}", spec.event_id))?;
            let campaign = Campaign::from_entries(spec.event_id, spec.scheme, &entries)
                .with_context(|| format!("Failed to build tree for event {}", spec.event_id))?;

            if let Some(pinned) = spec.root {
                if pinned != campaign.root() {
                    anyhow::bail!(
                        "Merkle root mismatch for event {}: configured {}, ledger builds {}",
                        spec.event_id,
                        hex_encode(pinned),
                        hex_encode(campaign.root())
                    );
                }
            }
            info!(
                event_id = spec.event_id,
                scheme = %spec.scheme,
                leaves = campaign.leaf_count(),
                root = %hex_encode(campaign.root()),
                "Campaign loaded"
            );
            campaigns.push(campaign);
        }
        Ok(Self::new(campaigns))
    }

    pub fn get(&self, event_id: EventId) -> Option<&Campaign> {
        self.by_event.get(&event_id)
    }

    pub fn event_ids(&self) -> impl Iterator<Item = EventId> + '_ {
        self.by_event.keys().copied()
    }
}
