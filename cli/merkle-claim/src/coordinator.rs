//! End-to-end claim processing.
//!
//! ```text
//! Received -> EligibilityChecked -> ProofVerified -> Submitted -> Confirmed
//!     |               |                                  |
//!     +---------------+------------> Rejected            +------> Failed
//! ```
//!
//! No lock is held while a transaction is in flight. Exactly-once payout rests
//! on the ledger's compare-and-set and the distributor's own claimed guard.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{debug, error, info, instrument, warn};

use crate::campaign::Campaigns;
use crate::chain::{ChainSubmitter, ClaimCall, SubmitError};
use crate::eligibility::{EligibilityEntry, EventId, TxHash, Wallet};
use crate::ledger::{EligibilityLedger, LedgerError};
use crate::merkle::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClaimState {
    Received,
    EligibilityChecked,
    ProofVerified,
    Submitted,
    Confirmed,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub wallet: Wallet,
    pub event_id: EventId,
    /// Sibling path supplied by the caller; fetched from the campaign tree
    /// when absent.
    pub proof: Option<Vec<Hash>>,
}

impl ClaimRequest {
    pub fn new(wallet: Wallet, event_id: EventId) -> Self {
        Self {
            wallet,
            event_id,
            proof: None,
        }
    }
}

/// How a successful request was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Settlement {
    /// This request's transaction paid out.
    Confirmed,
    /// An earlier or concurrent request already paid out.
    AlreadyClaimed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimReceipt {
    pub wallet: Wallet,
    pub event_id: EventId,
    pub amount: u128,
    pub tx_hash: TxHash,
    pub settlement: Settlement,
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("{wallet} is not eligible in event {event_id}")]
    NotEligible { wallet: Wallet, event_id: EventId },
    /// The distributor already paid this wallet but the settling transaction
    /// is not recorded yet.
    #[error("{wallet} has already claimed in event {event_id}")]
    AlreadyClaimed { wallet: Wallet, event_id: EventId },
    #[error("proof for {wallet} in event {event_id} does not match the campaign root")]
    InvalidProof { wallet: Wallet, event_id: EventId },
    #[error("event {0} has no configured campaign")]
    UnknownCampaign(EventId),
    #[error("claim transaction reverted: {0}")]
    Reverted(String),
    #[error("distributor cannot pay out: {0}")]
    InsufficientFunds(String),
    #[error("network error after {attempts} attempt(s): {message}")]
    Network { attempts: usize, message: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ClaimError {
    /// Stable name reported to API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            ClaimError::NotEligible { .. } => "NotEligible",
            ClaimError::AlreadyClaimed { .. } => "AlreadyClaimed",
            ClaimError::InvalidProof { .. } => "InvalidProof",
            ClaimError::UnknownCampaign(_) => "UnknownCampaign",
            ClaimError::Reverted(_) => "Reverted",
            ClaimError::InsufficientFunds(_) => "InsufficientFunds",
            ClaimError::Network { .. } => "NetworkError",
            ClaimError::Ledger(_) => "LedgerError",
        }
    }

    /// Whether the caller may usefully send the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClaimError::Network { .. } | ClaimError::Ledger(_))
    }

    pub fn state(&self) -> ClaimState {
        match self {
            ClaimError::NotEligible { .. }
            | ClaimError::AlreadyClaimed { .. }
            | ClaimError::InvalidProof { .. }
            | ClaimError::UnknownCampaign(_) => ClaimState::Rejected,
            ClaimError::Reverted(_)
            | ClaimError::InsufficientFunds(_)
            | ClaimError::Network { .. }
            | ClaimError::Ledger(_) => ClaimState::Failed,
        }
    }
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delays between attempts: `initial, 2*initial, 4*initial, ...` capped
    /// at `max_delay_ms`, one fewer than `max_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor((self.initial_delay_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .take(self.max_attempts.saturating_sub(1))
    }
}

pub struct ClaimCoordinator {
    ledger: Arc<dyn EligibilityLedger>,
    submitter: Arc<dyn ChainSubmitter>,
    campaigns: Arc<Campaigns>,
    retry: RetryPolicy,
}

fn transition(state: ClaimState) {
    debug!(?state, "Claim state");
}

impl ClaimCoordinator {
    pub fn new(
        ledger: Arc<dyn EligibilityLedger>,
        submitter: Arc<dyn ChainSubmitter>,
        campaigns: Arc<Campaigns>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            submitter,
            campaigns,
            retry,
        }
    }

    pub fn campaigns(&self) -> &Campaigns {
        &self.campaigns
    }

    #[instrument(skip_all, fields(wallet = %request.wallet, event_id = request.event_id))]
    pub async fn claim(&self, request: ClaimRequest) -> Result<ClaimReceipt, ClaimError> {
        let result = self.process(&request).await;
        match &result {
            Ok(receipt) => info!(
                state = ?ClaimState::Confirmed,
                settlement = ?receipt.settlement,
                tx_hash = %receipt.tx_hash,
                "Claim settled"
            ),
            Err(err @ (ClaimError::Reverted(_) | ClaimError::InsufficientFunds(_))) => error!(
                state = ?err.state(),
                kind = err.kind(),
                "Claim failed, needs operator attention: {err}"
            ),
            Err(err) if err.state() == ClaimState::Failed => {
                warn!(state = ?err.state(), kind = err.kind(), "Claim failed: {err}")
            }
            Err(err) => info!(state = ?err.state(), kind = err.kind(), "Claim rejected: {err}"),
        }
        result
    }

    async fn process(&self, request: &ClaimRequest) -> Result<ClaimReceipt, ClaimError> {
        transition(ClaimState::Received);
        let entry = self
            .ledger
            .lookup(&request.wallet, request.event_id)
            .await?
            .ok_or(ClaimError::NotEligible {
                wallet: request.wallet,
                event_id: request.event_id,
            })?;
        if let Some(receipt) = already_settled(&entry) {
            return Ok(receipt);
        }
        transition(ClaimState::EligibilityChecked);

        let campaign = self
            .campaigns
            .get(entry.event_id)
            .ok_or(ClaimError::UnknownCampaign(entry.event_id))?;
        let invalid = || ClaimError::InvalidProof {
            wallet: entry.wallet,
            event_id: entry.event_id,
        };
        let proof = match &request.proof {
            Some(proof) => proof.clone(),
            None => campaign
                .proof_for(&entry.wallet, entry.amount)
                .ok_or_else(invalid)?,
        };
        if !campaign.verify(&entry.wallet, entry.amount, &proof) {
            return Err(invalid());
        }
        transition(ClaimState::ProofVerified);

        let call = ClaimCall {
            event_id: entry.event_id,
            wallet: entry.wallet,
            amount: entry.amount,
            proof,
        };
        transition(ClaimState::Submitted);
        let (submitted, attempts) = self.submit_with_retry(&call).await;
        match submitted {
            Ok(tx_hash) => self.finalize(&entry, tx_hash, Settlement::Confirmed).await,
            Err(SubmitError::Reverted(message)) => self.resolve_revert(&entry, message).await,
            Err(SubmitError::InsufficientFunds(message)) => {
                Err(ClaimError::InsufficientFunds(message))
            }
            Err(err @ (SubmitError::Network(_) | SubmitError::Unconfirmed { .. })) => {
                Err(ClaimError::Network {
                    attempts,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Sends the claim, retrying transient failures. Once a transaction has
    /// been sent, later attempts poll that transaction instead of sending a
    /// second one.
    async fn submit_with_retry(&self, call: &ClaimCall) -> (Result<TxHash, SubmitError>, usize) {
        let attempts = &AtomicUsize::new(0);
        let sent: &Mutex<Option<TxHash>> = &Mutex::new(None);
        let result = RetryIf::start(
            self.retry.delays(),
            || async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let pending = *sent.lock();
                let outcome = match pending {
                    Some(tx_hash) => {
                        debug!(attempt, %tx_hash, "Polling sent claim transaction");
                        self.submitter.confirm(tx_hash).await
                    }
                    None => {
                        debug!(attempt, "Submitting claim transaction");
                        self.submitter.submit(call).await
                    }
                };
                if let Err(SubmitError::Unconfirmed { tx_hash, .. }) = &outcome {
                    *sent.lock() = Some(*tx_hash);
                }
                outcome
            },
            |err: &SubmitError| {
                let transient = err.is_transient();
                if transient {
                    warn!("Transient submission failure, backing off: {err}");
                }
                transient
            },
        )
        .await;
        (result, attempts.load(Ordering::SeqCst))
    }

    /// Records a confirmed payout. Losing the compare-and-set means another
    /// request already recorded it, which is success for this caller too.
    async fn finalize(
        &self,
        entry: &EligibilityEntry,
        tx_hash: TxHash,
        settlement: Settlement,
    ) -> Result<ClaimReceipt, ClaimError> {
        let marked = RetryIf::start(
            self.retry.delays(),
            || self.ledger.mark_claimed(&entry.wallet, entry.event_id, tx_hash),
            |err: &LedgerError| matches!(err, LedgerError::Storage(_)),
        )
        .await;

        match marked {
            Ok(()) => {
                transition(ClaimState::Confirmed);
                Ok(receipt(entry, tx_hash, settlement))
            }
            // Another request recorded this same transaction after finding it
            // in the distributor's events.
            Err(LedgerError::Conflict { existing, .. }) if existing == tx_hash => {
                Ok(receipt(entry, tx_hash, settlement))
            }
            Err(LedgerError::Conflict { existing, .. }) => {
                warn!(
                    recorded = %existing,
                    confirmed = %tx_hash,
                    "Ledger already settled with a different transaction"
                );
                Ok(receipt(entry, existing, Settlement::AlreadyClaimed))
            }
            Err(err) => {
                error!(
                    tx_hash = %tx_hash,
                    "Payout confirmed on-chain but not recorded in the ledger: {err}"
                );
                Err(err.into())
            }
        }
    }

    /// A revert is either a lost race against a concurrent claim for the same
    /// wallet, or a real failure the operator must look at.
    async fn resolve_revert(
        &self,
        entry: &EligibilityEntry,
        message: String,
    ) -> Result<ClaimReceipt, ClaimError> {
        match self.submitter.is_claimed(entry.event_id, &entry.wallet).await {
            Ok(true) => {
                debug!("Distributor reports wallet already paid");
                self.recover_settlement(entry).await
            }
            Ok(false) => Err(ClaimError::Reverted(message)),
            Err(err) => {
                warn!("Could not query distributor claim status: {err}");
                Err(ClaimError::Reverted(message))
            }
        }
    }

    /// The distributor has paid the wallet. Records the settling transaction
    /// from the distributor's events if the ledger lacks it; otherwise waits a
    /// bounded time for a concurrent request to record its own.
    async fn recover_settlement(
        &self,
        entry: &EligibilityEntry,
    ) -> Result<ClaimReceipt, ClaimError> {
        if let Some(settled) = self.settled_in_ledger(entry).await? {
            return Ok(settled);
        }

        match self.submitter.settling_tx(entry.event_id, &entry.wallet).await {
            Ok(Some(tx_hash)) => {
                info!(%tx_hash, "Recording payout found in distributor events");
                return self
                    .finalize(entry, tx_hash, Settlement::AlreadyClaimed)
                    .await;
            }
            Ok(None) => debug!("No Claimed event found for wallet"),
            Err(err) => warn!("Could not read distributor events: {err}"),
        }

        for delay in self.retry.delays() {
            tokio::time::sleep(delay).await;
            if let Some(settled) = self.settled_in_ledger(entry).await? {
                return Ok(settled);
            }
        }
        Err(ClaimError::AlreadyClaimed {
            wallet: entry.wallet,
            event_id: entry.event_id,
        })
    }

    async fn settled_in_ledger(
        &self,
        entry: &EligibilityEntry,
    ) -> Result<Option<ClaimReceipt>, ClaimError> {
        let current = self.ledger.lookup(&entry.wallet, entry.event_id).await?;
        Ok(current.as_ref().and_then(already_settled))
    }
}

fn receipt(entry: &EligibilityEntry, tx_hash: TxHash, settlement: Settlement) -> ClaimReceipt {
    ClaimReceipt {
        wallet: entry.wallet,
        event_id: entry.event_id,
        amount: entry.amount,
        tx_hash,
        settlement,
    }
}

fn already_settled(entry: &EligibilityEntry) -> Option<ClaimReceipt> {
    match (entry.claimed, entry.tx_hash) {
        (true, Some(tx_hash)) => Some(receipt(entry, tx_hash, Settlement::AlreadyClaimed)),
        _ => None,
    }
}
