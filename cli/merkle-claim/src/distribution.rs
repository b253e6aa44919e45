//! Published form of a campaign: root plus every claimant's leaf and proof,
//! handed to frontends so users can claim without querying the service.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::common::hex_encode;
use crate::eligibility::{EligibilityRecord, EventId, Wallet};
use crate::merkle::{build_tree, HashScheme, MerkleError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub event_id: EventId,
    pub hash: HashScheme,
    pub root: String,
    /// Sum of all amounts, as a decimal string.
    pub total: String,
    pub claims: BTreeMap<Wallet, DistributionClaim>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistributionClaim {
    pub amount: String,
    pub leaf: String,
    pub proof: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    #[error("no eligibility records for event {0}")]
    NoRecords(EventId),
    #[error("total amount of event {0} overflows u128")]
    TotalOverflow(EventId),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
}

impl Distribution {
    /// Builds the distribution for the records of `event_id`; records of other
    /// events are skipped.
    pub fn build(
        event_id: EventId,
        scheme: HashScheme,
        records: &[EligibilityRecord],
    ) -> Result<Self, DistributionError> {
        let records: Vec<EligibilityRecord> = records
            .iter()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect();
        if records.is_empty() {
            return Err(DistributionError::NoRecords(event_id));
        }

        let total = records
            .iter()
            .try_fold(0u128, |sum, r| sum.checked_add(r.amount))
            .ok_or(DistributionError::TotalOverflow(event_id))?;

        let built = build_tree(scheme, &records)?;
        let mut claims = BTreeMap::new();
        for record in &records {
            let leaf = scheme.leaf(&record.wallet, event_id, record.amount);
            let proof = built
                .proofs_by_leaf
                .get(&leaf)
                .map(|proof| proof.iter().map(hex_encode).collect())
                .unwrap_or_default();
            claims.insert(
                record.wallet,
                DistributionClaim {
                    amount: record.amount.to_string(),
                    leaf: hex_encode(leaf),
                    proof,
                },
            );
        }

        Ok(Self {
            event_id,
            hash: scheme,
            root: hex_encode(built.root),
            total: total.to_string(),
            claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::parse_hash32;
    use crate::merkle::verify;

    fn record(byte: u8, event_id: EventId, amount: u128) -> EligibilityRecord {
        EligibilityRecord {
            wallet: Wallet::from_bytes([byte; 20]),
            event_id,
            amount,
        }
    }

    #[test]
    fn test_distribution_proofs_verify() {
        let records = [record(0xaa, 1, 100), record(0xbb, 1, 200), record(0xcc, 2, 5)];
        let distribution = Distribution::build(1, HashScheme::Keccak256, &records).unwrap();

        assert_eq!(distribution.total, "300");
        assert_eq!(distribution.claims.len(), 2);
        let root = parse_hash32(&distribution.root).unwrap();
        for (wallet, claim) in &distribution.claims {
            let amount: u128 = claim.amount.parse().unwrap();
            let leaf = HashScheme::Keccak256.leaf(wallet, 1, amount);
            assert_eq!(claim.leaf, hex_encode(leaf));
            let proof: Vec<_> = claim.proof.iter().map(|p| parse_hash32(p).unwrap()).collect();
            assert!(verify(HashScheme::Keccak256, &leaf, &proof, &root));
        }
    }

    #[test]
    fn test_distribution_json_shape() {
        let distribution =
            Distribution::build(7, HashScheme::Sha256, &[record(0xaa, 7, 1)]).unwrap();
        let json = serde_json::to_value(&distribution).unwrap();
        assert_eq!(json["eventId"], 7);
        assert_eq!(json["hash"], "sha256");
        assert_eq!(json["root"], json["claims"][format!("0x{}", "aa".repeat(20))]["leaf"]);
        assert_eq!(
            json["claims"][format!("0x{}", "aa".repeat(20))]["proof"],
            serde_json::json!([])
        );
    }

    #[test]
    fn test_distribution_rejects_empty_and_overflow() {
        assert!(matches!(
            Distribution::build(1, HashScheme::Keccak256, &[record(0xaa, 2, 1)]),
            Err(DistributionError::NoRecords(1))
        ));
        assert!(matches!(
            Distribution::build(
                1,
                HashScheme::Keccak256,
                &[record(0xaa, 1, u128::MAX), record(0xbb, 1, 1)]
            ),
            Err(DistributionError::TotalOverflow(1))
        ));
    }
}
