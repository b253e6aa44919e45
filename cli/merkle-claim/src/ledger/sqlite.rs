use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::{EligibilityLedger, LedgerError, SeedReport};
use crate::eligibility::{EligibilityEntry, EligibilityRecord, EventId, TxHash, Wallet};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS eligibility (
    wallet   TEXT    NOT NULL,
    event_id INTEGER NOT NULL,
    amount   TEXT    NOT NULL,
    claimed  INTEGER NOT NULL DEFAULT 0,
    tx_hash  TEXT,
    PRIMARY KEY (wallet, event_id),
    CHECK (claimed IN (0, 1)),
    CHECK (claimed = 0 OR tx_hash IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS eligibility_by_event ON eligibility (event_id, wallet);

CREATE TRIGGER IF NOT EXISTS eligibility_claimed_immutable
BEFORE UPDATE ON eligibility
WHEN OLD.claimed = 1
BEGIN
    SELECT RAISE(ABORT, 'claimed eligibility entries are immutable');
END;

CREATE TRIGGER IF NOT EXISTS eligibility_retained
BEFORE DELETE ON eligibility
BEGIN
    SELECT RAISE(ABORT, 'eligibility entries are retained for audit');
END;
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Ledger persisted in SQLite. Wallets are stored as lower-case hex so text
/// ordering matches byte ordering; amounts as decimal text.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Connects to a `sqlite:` URL, creating the database file if needed.
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(url)?;
        Self::connect_with(options, 8).await
    }

    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        Self::connect_with(SqliteConnectOptions::new().filename(path), 8).await
    }

    /// Private in-memory database. A single pinned connection keeps the
    /// database alive for the lifetime of the pool.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;
        Self::from_pool(pool).await
    }

    async fn connect_with(
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> Result<Self, LedgerError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, LedgerError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

fn event_key(event_id: EventId) -> Result<i64, LedgerError> {
    i64::try_from(event_id)
        .map_err(|_| LedgerError::Storage(format!("event id {event_id} exceeds storage range")))
}

fn decode_entry(row: &SqliteRow) -> Result<EligibilityEntry, LedgerError> {
    let wallet: String = row.try_get("wallet")?;
    let event_id: i64 = row.try_get("event_id")?;
    let amount: String = row.try_get("amount")?;
    let claimed: bool = row.try_get("claimed")?;
    let tx_hash: Option<String> = row.try_get("tx_hash")?;

    let corrupt = |what: &str, err: &dyn std::fmt::Display| {
        LedgerError::Storage(format!("corrupt {what} in ledger row: {err}"))
    };
    Ok(EligibilityEntry {
        wallet: wallet.parse().map_err(|e| corrupt("wallet", &e))?,
        event_id: EventId::try_from(event_id).map_err(|e| corrupt("event id", &e))?,
        amount: amount.parse().map_err(|e| corrupt("amount", &e))?,
        claimed,
        tx_hash: tx_hash
            .map(|h| h.parse::<TxHash>())
            .transpose()
            .map_err(|e| corrupt("tx hash", &e))?,
    })
}

#[async_trait]
impl EligibilityLedger for SqliteLedger {
    async fn lookup(
        &self,
        wallet: &Wallet,
        event_id: EventId,
    ) -> Result<Option<EligibilityEntry>, LedgerError> {
        let row = sqlx::query(
            "SELECT wallet, event_id, amount, claimed, tx_hash FROM eligibility \
             WHERE wallet = ? AND event_id = ?",
        )
        .bind(wallet.to_string())
        .bind(event_key(event_id)?)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_entry).transpose()
    }

    async fn mark_claimed(
        &self,
        wallet: &Wallet,
        event_id: EventId,
        tx_hash: TxHash,
    ) -> Result<(), LedgerError> {
        let updated = sqlx::query(
            "UPDATE eligibility SET claimed = 1, tx_hash = ? \
             WHERE wallet = ? AND event_id = ? AND claimed = 0",
        )
        .bind(tx_hash.to_string())
        .bind(wallet.to_string())
        .bind(event_key(event_id)?)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(());
        }

        debug!(%wallet, event_id, "compare-and-set on claimed lost");
        match self.lookup(wallet, event_id).await? {
            None => Err(LedgerError::NotFound {
                wallet: *wallet,
                event_id,
            }),
            Some(EligibilityEntry {
                tx_hash: Some(existing),
                ..
            }) => Err(LedgerError::Conflict {
                wallet: *wallet,
                event_id,
                existing,
            }),
            Some(_) => Err(LedgerError::Storage(format!(
                "entry for {wallet} in event {event_id} is unclaimed but refused the update"
            ))),
        }
    }

    async fn seed(&self, records: &[EligibilityRecord]) -> Result<SeedReport, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let mut report = SeedReport::default();

        for record in records {
            let wallet = record.wallet.to_string();
            let event_id = event_key(record.event_id)?;
            let stored: Option<String> =
                sqlx::query_scalar("SELECT amount FROM eligibility WHERE wallet = ? AND event_id = ?")
                    .bind(&wallet)
                    .bind(event_id)
                    .fetch_optional(&mut *tx)
                    .await?;

            match stored {
                Some(stored) => {
                    let stored: u128 = stored.parse().map_err(|e| {
                        LedgerError::Storage(format!("corrupt amount in ledger row: {e}"))
                    })?;
                    if stored != record.amount {
                        // Dropping `tx` rolls the batch back.
                        return Err(LedgerError::AmountMismatch {
                            wallet: record.wallet,
                            event_id: record.event_id,
                            stored,
                            imported: record.amount,
                        });
                    }
                    report.unchanged += 1;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO eligibility (wallet, event_id, amount, claimed) \
                         VALUES (?, ?, ?, 0)",
                    )
                    .bind(&wallet)
                    .bind(event_id)
                    .bind(record.amount.to_string())
                    .execute(&mut *tx)
                    .await?;
                    report.inserted += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn entries(&self, event_id: EventId) -> Result<Vec<EligibilityEntry>, LedgerError> {
        let rows = sqlx::query(
            "SELECT wallet, event_id, amount, claimed, tx_hash FROM eligibility \
             WHERE event_id = ? ORDER BY wallet",
        )
        .bind(event_key(event_id)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_entry).collect()
    }
}
