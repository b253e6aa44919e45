//! Off-chain eligibility ledger: the authoritative record of who may claim
//! and whether they already have.
//!
//! `mark_claimed` is a compare-and-set on `claimed = false` and is the only
//! synchronization point between concurrent claims.

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use async_trait::async_trait;

use crate::eligibility::{EligibilityEntry, EligibilityRecord, EventId, TxHash, Wallet};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("no eligibility entry for {wallet} in event {event_id}")]
    NotFound { wallet: Wallet, event_id: EventId },
    /// The row was already transitioned to claimed by someone else.
    #[error("entry for {wallet} in event {event_id} already claimed in {existing}")]
    Conflict {
        wallet: Wallet,
        event_id: EventId,
        existing: TxHash,
    },
    #[error("{wallet} in event {event_id} is already eligible for {stored}, import says {imported}")]
    AmountMismatch {
        wallet: Wallet,
        event_id: EventId,
        stored: u128,
        imported: u128,
    },
    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

/// Outcome of an idempotent batch import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub inserted: usize,
    pub unchanged: usize,
}

#[async_trait]
pub trait EligibilityLedger: Send + Sync {
    async fn lookup(
        &self,
        wallet: &Wallet,
        event_id: EventId,
    ) -> Result<Option<EligibilityEntry>, LedgerError>;

    /// Atomically flips `claimed` from false to true and stores `tx_hash`.
    ///
    /// Fails with [`LedgerError::Conflict`] if the entry is already claimed and
    /// [`LedgerError::NotFound`] if it does not exist.
    async fn mark_claimed(
        &self,
        wallet: &Wallet,
        event_id: EventId,
        tx_hash: TxHash,
    ) -> Result<(), LedgerError>;

    /// Inserts new records as unclaimed. Re-importing an identical record is a
    /// no-op; a record whose amount differs from the stored one aborts the
    /// whole batch.
    async fn seed(&self, records: &[EligibilityRecord]) -> Result<SeedReport, LedgerError>;

    /// All entries of a campaign, ordered by wallet.
    async fn entries(&self, event_id: EventId) -> Result<Vec<EligibilityEntry>, LedgerError>;
}
