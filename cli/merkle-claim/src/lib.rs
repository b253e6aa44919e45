pub mod api;
pub mod campaign;
pub mod chain;
pub mod common;
pub mod config;
pub mod coordinator;
pub mod distribution;
pub mod eligibility;
pub mod ledger;
pub mod merkle;
pub mod reconcile;

pub use common::{hex_encode, parse_address, parse_hash32, validate_merkle_root, write_file_atomic};
pub use coordinator::{ClaimCoordinator, ClaimError, ClaimReceipt, ClaimRequest, Settlement};
pub use eligibility::{EligibilityEntry, EligibilityRecord, EventId, TxHash, Wallet};
pub use merkle::{build_tree, verify, Hash, HashScheme, MerkleTree};
