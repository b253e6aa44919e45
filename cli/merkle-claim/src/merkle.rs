//! Merkle tree construction and proof verification for distributor campaigns.
//!
//! Leaves are `hash(wallet ‖ uint256(eventId) ‖ uint256(amount))` and interior
//! nodes hash the *sorted* pair of children, so a proof is an index-free list
//! of siblings that the on-chain verifier folds in the same way. An unpaired
//! node at the end of a level is hashed with itself.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sha3::{Digest, Keccak256};

use crate::eligibility::{EligibilityRecord, EventId, Wallet};

pub type Hash = [u8; 32];

/// Digest used by a campaign's distributor contract.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum HashScheme {
    #[default]
    Keccak256,
    Sha256,
}

impl HashScheme {
    pub fn digest(self, parts: &[&[u8]]) -> Hash {
        match self {
            HashScheme::Keccak256 => {
                let mut hasher = Keccak256::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().into()
            }
            HashScheme::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().into()
            }
        }
    }

    /// Commutative node hash: `hash(min(a, b) ‖ max(a, b))`.
    pub fn hash_pair(self, a: &Hash, b: &Hash) -> Hash {
        if a <= b {
            self.digest(&[a.as_slice(), b.as_slice()])
        } else {
            self.digest(&[b.as_slice(), a.as_slice()])
        }
    }

    /// Leaf for a (wallet, event, amount) triple, packed like Solidity's
    /// `abi.encodePacked(address, uint256, uint256)`.
    pub fn leaf(self, wallet: &Wallet, event_id: EventId, amount: u128) -> Hash {
        let mut event_word = [0u8; 32];
        event_word[24..].copy_from_slice(&event_id.to_be_bytes());
        let mut amount_word = [0u8; 32];
        amount_word[16..].copy_from_slice(&amount.to_be_bytes());
        self.digest(&[
            wallet.as_bytes().as_slice(),
            event_word.as_slice(),
            amount_word.as_slice(),
        ])
    }
}

impl fmt::Display for HashScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashScheme::Keccak256 => f.write_str("keccak256"),
            HashScheme::Sha256 => f.write_str("sha256"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("cannot build a Merkle tree from an empty set")]
    Empty,
    #[error("duplicate leaf 0x{}", hex::encode(.0))]
    DuplicateLeaf(Hash),
    #[error("leaf index {index} is out of bounds for tree with {leaves} leaves")]
    IndexOutOfBounds { index: usize, leaves: usize },
}

/// Fully materialized tree: `levels[0]` holds the sorted leaves, the last
/// level holds the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    scheme: HashScheme,
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Builds the tree over the sorted leaf set.
    pub fn from_leaves(scheme: HashScheme, mut leaves: Vec<Hash>) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::Empty);
        }
        leaves.sort_unstable();
        if let Some(pair) = leaves.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(MerkleError::DuplicateLeaf(pair[0]));
        }

        let mut levels = vec![leaves];
        while let Some(level) = levels.last().filter(|level| level.len() > 1) {
            let next_level = level
                .chunks(2)
                .map(|chunk| {
                    let left = &chunk[0];
                    let right = chunk.get(1).unwrap_or(left);
                    scheme.hash_pair(left, right)
                })
                .collect();
            levels.push(next_level);
        }

        Ok(Self { scheme, levels })
    }

    pub fn scheme(&self) -> HashScheme {
        self.scheme
    }

    pub fn root(&self) -> Hash {
        // Never empty: construction rejects an empty leaf set.
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or_default()
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn levels(&self) -> &[Vec<Hash>] {
        &self.levels
    }

    pub fn index_of(&self, leaf: &Hash) -> Option<usize> {
        self.levels[0].binary_search(leaf).ok()
    }

    /// Sibling path for the leaf at `leaf_index`, bottom-up.
    pub fn proof_at(&self, leaf_index: usize) -> Result<Vec<Hash>, MerkleError> {
        if leaf_index >= self.leaf_count() {
            return Err(MerkleError::IndexOutOfBounds {
                index: leaf_index,
                leaves: self.leaf_count(),
            });
        }

        let mut proof = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut current_index = leaf_index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = current_index ^ 1;
            // Unpaired last node is hashed with itself.
            let sibling = level.get(sibling_index).unwrap_or(&level[current_index]);
            proof.push(*sibling);
            current_index /= 2;
        }

        Ok(proof)
    }

    pub fn proof(&self, leaf: &Hash) -> Option<Vec<Hash>> {
        self.index_of(leaf).and_then(|index| self.proof_at(index).ok())
    }
}

/// Folds `proof` into `leaf` and compares the result with `root`.
pub fn verify(scheme: HashScheme, leaf: &Hash, proof: &[Hash], root: &Hash) -> bool {
    let computed = proof
        .iter()
        .fold(*leaf, |computed, sibling| scheme.hash_pair(&computed, sibling));
    &computed == root
}

/// Output of [`build_tree`]: the root to publish and every leaf's proof.
#[derive(Debug, Clone)]
pub struct BuiltTree {
    pub tree: MerkleTree,
    pub root: Hash,
    pub proofs_by_leaf: HashMap<Hash, Vec<Hash>>,
}

/// Offline construction step run once a campaign's eligibility set is final.
pub fn build_tree(
    scheme: HashScheme,
    entries: &[EligibilityRecord],
) -> Result<BuiltTree, MerkleError> {
    let leaves: Vec<Hash> = entries
        .iter()
        .map(|e| scheme.leaf(&e.wallet, e.event_id, e.amount))
        .collect();
    let tree = MerkleTree::from_leaves(scheme, leaves)?;

    let mut proofs_by_leaf = HashMap::with_capacity(tree.leaf_count());
    for (index, leaf) in tree.levels()[0].iter().enumerate() {
        proofs_by_leaf.insert(*leaf, tree.proof_at(index)?);
    }

    Ok(BuiltTree {
        root: tree.root(),
        tree,
        proofs_by_leaf,
    })
}
