use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{EligibilityLedger, LedgerError, SeedReport};
use crate::eligibility::{EligibilityEntry, EligibilityRecord, EventId, TxHash, Wallet};

/// Process-local ledger, keyed by `(event, wallet)` so a campaign's entries
/// are contiguous and wallet-ordered.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<BTreeMap<(EventId, Wallet), EligibilityEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EligibilityLedger for MemoryLedger {
    async fn lookup(
        &self,
        wallet: &Wallet,
        event_id: EventId,
    ) -> Result<Option<EligibilityEntry>, LedgerError> {
        Ok(self.entries.lock().get(&(event_id, *wallet)).cloned())
    }

    async fn mark_claimed(
        &self,
        wallet: &Wallet,
        event_id: EventId,
        tx_hash: TxHash,
    ) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&(event_id, *wallet))
            .ok_or(LedgerError::NotFound {
                wallet: *wallet,
                event_id,
            })?;

        match (entry.claimed, entry.tx_hash) {
            (true, Some(existing)) => Err(LedgerError::Conflict {
                wallet: *wallet,
                event_id,
                existing,
            }),
            (true, None) => Err(LedgerError::Storage(format!(
                "claimed entry for {wallet} in event {event_id} has no transaction hash"
            ))),
            (false, _) => {
                entry.claimed = true;
                entry.tx_hash = Some(tx_hash);
                Ok(())
            }
        }
    }

    async fn seed(&self, records: &[EligibilityRecord]) -> Result<SeedReport, LedgerError> {
        let mut entries = self.entries.lock();

        let mut report = SeedReport::default();
        for record in records {
            if let Some(stored) = entries.get(&(record.event_id, record.wallet)) {
                if stored.amount != record.amount {
                    return Err(LedgerError::AmountMismatch {
                        wallet: record.wallet,
                        event_id: record.event_id,
                        stored: stored.amount,
                        imported: record.amount,
                    });
                }
                report.unchanged += 1;
            } else {
                report.inserted += 1;
            }
        }

        for record in records {
            entries
                .entry((record.event_id, record.wallet))
                .or_insert_with(|| EligibilityEntry::unclaimed(record));
        }
        Ok(report)
    }

    async fn entries(&self, event_id: EventId) -> Result<Vec<EligibilityEntry>, LedgerError> {
        let first = (event_id, Wallet::from_bytes([0u8; 20]));
        let last = (event_id, Wallet::from_bytes([0xff; 20]));
        let entries = self.entries.lock();
        Ok(entries
            .range(first..=last)
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}
