//! Consistency check between the ledger and the distributors' claimed state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::chain::{ChainSubmitter, SubmitError};
use crate::eligibility::{EventId, TxHash, Wallet};
use crate::ledger::{EligibilityLedger, LedgerError};

/// Concurrent `isClaimed` queries per campaign.
const QUERY_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Divergence {
    /// Paid on-chain but not recorded off-chain.
    ChainOnly { wallet: Wallet },
    /// Recorded off-chain but the distributor has no such payout.
    LedgerOnly { wallet: Wallet, tx_hash: TxHash },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub event_id: EventId,
    pub checked: usize,
    pub divergences: Vec<Divergence>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.divergences.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("distributor query failed: {0}")]
    Chain(#[from] SubmitError),
}

pub struct Reconciler {
    ledger: Arc<dyn EligibilityLedger>,
    chain: Arc<dyn ChainSubmitter>,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn EligibilityLedger>, chain: Arc<dyn ChainSubmitter>) -> Self {
        Self { ledger, chain }
    }

    /// Compares every ledger entry of `event_id` with the distributor. Only
    /// reports; neither side is modified.
    pub async fn reconcile(
        &self,
        event_id: EventId,
    ) -> Result<ReconciliationReport, ReconcileError> {
        let entries = self.ledger.entries(event_id).await?;
        let checked = entries.len();

        let divergences: Vec<Divergence> = stream::iter(entries)
            .map(|entry| async move {
                let on_chain = self.chain.is_claimed(event_id, &entry.wallet).await?;
                let divergence = match (on_chain, entry.claimed, entry.tx_hash) {
                    (true, false, _) => Some(Divergence::ChainOnly {
                        wallet: entry.wallet,
                    }),
                    (false, true, Some(tx_hash)) => Some(Divergence::LedgerOnly {
                        wallet: entry.wallet,
                        tx_hash,
                    }),
                    _ => None,
                };
                Ok::<_, ReconcileError>(divergence)
            })
            .buffered(QUERY_CONCURRENCY)
            .try_filter_map(|divergence| async move { Ok(divergence) })
            .try_collect()
            .await?;

        for divergence in &divergences {
            warn!(event_id, ?divergence, "Ledger and distributor disagree");
        }
        info!(
            event_id,
            checked,
            divergent = divergences.len(),
            "Reconciliation finished"
        );
        Ok(ReconciliationReport {
            event_id,
            checked,
            divergences,
        })
    }

    /// Reconciles every campaign each `interval` until `shutdown` resolves.
    pub async fn run_periodic(
        &self,
        event_ids: Vec<EventId>,
        interval: Duration,
        shutdown: impl Future<Output = ()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    for &event_id in &event_ids {
                        if let Err(err) = self.reconcile(event_id).await {
                            error!(event_id, "Reconciliation failed: {err}");
                        }
                    }
                }
            }
        }
        info!("Periodic reconciliation stopped");
    }
}
