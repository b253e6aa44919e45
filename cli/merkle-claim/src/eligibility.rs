//! Eligibility records and the identifiers shared by every component.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::{hex_encode, parse_address, parse_hash32};

/// Airdrop / POAP campaign identifier.
pub type EventId = u64;

/// Normalized 20-byte account identifier. Always rendered as lower-case hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Wallet([u8; 20]);

impl Wallet {
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for Wallet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_address(s).map(Self)
    }
}

impl fmt::Display for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_encode(self.0))
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Wallet({self})")
    }
}

impl Serialize for Wallet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Wallet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Hash of a confirmed claim transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash([u8; 32]);

impl TxHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for TxHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hash32(s).map(Self)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// One line of the eligibility import: who may claim how much in which campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityRecord {
    pub wallet: Wallet,
    pub event_id: EventId,
    #[serde(with = "amount")]
    pub amount: u128,
}

/// Ledger row for a (wallet, event) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityEntry {
    pub wallet: Wallet,
    pub event_id: EventId,
    #[serde(with = "amount")]
    pub amount: u128,
    pub claimed: bool,
    pub tx_hash: Option<TxHash>,
}

impl EligibilityEntry {
    pub fn unclaimed(record: &EligibilityRecord) -> Self {
        Self {
            wallet: record.wallet,
            event_id: record.event_id,
            amount: record.amount,
            claimed: false,
            tx_hash: None,
        }
    }
}

/// Loads and validates a JSON array of eligibility records.
///
/// Rejects zero amounts and repeated (wallet, eventId) pairs, since the
/// ledger and the Merkle tree must be seeded from the exact same set.
pub fn load_records(path: &Path) -> anyhow::Result<Vec<EligibilityRecord>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read eligibility file {:?}", path))?;
    parse_records(&contents)
}

pub fn parse_records(contents: &str) -> anyhow::Result<Vec<EligibilityRecord>> {
    let records: Vec<EligibilityRecord> =
        serde_json::from_str(contents).context("Failed to parse eligibility JSON")?;
    validate_records(&records)?;
    Ok(records)
}

pub fn validate_records(records: &[EligibilityRecord]) -> anyhow::Result<()> {
    let mut seen = HashSet::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        if record.amount == 0 {
            anyhow::bail!(
                "Record {} ({} / event {}) has zero amount",
                i,
                record.wallet,
                record.event_id
            );
        }
        if !seen.insert((record.wallet, record.event_id)) {
            anyhow::bail!(
                "Duplicate eligibility for {} in event {} at record {}",
                record.wallet,
                record.event_id,
                i
            );
        }
    }
    Ok(())
}

/// Token amounts travel as decimal strings so they survive JSON consumers
/// without 128-bit integers; plain numbers are accepted on input.
pub(crate) mod amount {
    use super::*;

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        deserializer.deserialize_any(AmountVisitor)
    }

    struct AmountVisitor;

    impl<'de> Visitor<'de> for AmountVisitor {
        type Value = u128;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a non-negative integer or decimal string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u128, E> {
            Ok(v.into())
        }

        fn visit_u128<E: de::Error>(self, v: u128) -> Result<u128, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u128, E> {
            u128::try_from(v).map_err(|_| E::custom("amount must not be negative"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u128, E> {
            v.trim()
                .parse()
                .map_err(|e| E::custom(format!("invalid amount {v:?}: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AAA: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn test_wallet_normalized_display() {
        let wallet: Wallet = "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".parse().unwrap();
        assert_eq!(wallet.to_string(), AAA);
    }

    #[test]
    fn test_parse_records_accepts_number_and_string_amounts() {
        let json = format!(
            r#"[{{"wallet":"{AAA}","eventId":1,"amount":100}},
                {{"wallet":"{AAA}","eventId":2,"amount":"340282366920938463463374607431768211455"}}]"#
        );
        let records = parse_records(&json).unwrap();
        assert_eq!(records[0].amount, 100);
        assert_eq!(records[1].amount, u128::MAX);
    }

    #[test]
    fn test_parse_records_rejects_duplicates() {
        let json = format!(
            r#"[{{"wallet":"{AAA}","eventId":1,"amount":1}},
                {{"wallet":"{}","eventId":1,"amount":2}}]"#,
            AAA.to_uppercase().replace("0X", "0x")
        );
        assert!(parse_records(&json).is_err());
    }

    #[test]
    fn test_parse_records_rejects_zero_amount() {
        let json = format!(r#"[{{"wallet":"{AAA}","eventId":1,"amount":0}}]"#);
        assert!(parse_records(&json).is_err());
    }

    #[test]
    fn test_parse_records_rejects_negative_amount() {
        let json = format!(r#"[{{"wallet":"{AAA}","eventId":1,"amount":-5}}]"#);
        assert!(parse_records(&json).is_err());
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let record = EligibilityRecord {
            wallet: AAA.parse().unwrap(),
            event_id: 7,
            amount: 42,
        };
        let value = serde_json::to_value(EligibilityEntry::unclaimed(&record)).unwrap();
        assert_eq!(value["eventId"], 7);
        assert_eq!(value["amount"], "42");
        assert_eq!(value["txHash"], serde_json::Value::Null);
    }
}
