//! Submission of distributor `claim` transactions.
//!
//! A submitter sends exactly one transaction per call and reports once it has
//! the configured number of confirmations. Retrying is the caller's business.

use std::collections::HashMap;
use std::time::Duration;

use alloy::network::{Ethereum, EthereumWallet};
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::transports::http::reqwest::Url;
use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::eligibility::{EventId, TxHash, Wallet};
use crate::merkle::Hash;

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IMerkleDistributor {
        event Claimed(address account, uint256 amount);

        function merkleRoot() external view returns (bytes32);

        function isClaimed(address account) external view returns (bool);

        function claim(address account, uint256 amount, bytes32[] calldata merkleProof) external;
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    /// Deterministic rejection by the contract; retrying cannot help.
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    /// Transport failure before anything was sent; safe to resend.
    #[error("network error: {0}")]
    Network(String),
    /// Sent, but not confirmed within the timeout. The transaction may still
    /// land, so it is polled again and never resent.
    #[error("transaction {tx_hash} not confirmed: {message}")]
    Unconfirmed { tx_hash: TxHash, message: String },
}

impl SubmitError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SubmitError::Network(_) | SubmitError::Unconfirmed { .. }
        )
    }

    /// Buckets an RPC / node error message. Nodes report contract and balance
    /// failures only as text, so this is necessarily string based.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("insufficient funds")
            || lower.contains("insufficient balance")
            || lower.contains("exceeds balance")
        {
            SubmitError::InsufficientFunds(message)
        } else if lower.contains("revert") {
            SubmitError::Reverted(message)
        } else {
            SubmitError::Network(message)
        }
    }
}

/// Arguments of a distributor `claim` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimCall {
    pub event_id: EventId,
    pub wallet: Wallet,
    pub amount: u128,
    pub proof: Vec<Hash>,
}

#[async_trait]
pub trait ChainSubmitter: Send + Sync {
    /// Sends the claim and waits for confirmation.
    async fn submit(&self, call: &ClaimCall) -> Result<TxHash, SubmitError>;

    /// Waits again for a transaction that `submit` sent but could not confirm.
    async fn confirm(&self, tx_hash: TxHash) -> Result<TxHash, SubmitError>;

    /// The distributor's own double-claim guard.
    async fn is_claimed(&self, event_id: EventId, wallet: &Wallet) -> Result<bool, SubmitError>;

    /// Transaction that paid `wallet`, from the distributor's `Claimed` events.
    async fn settling_tx(
        &self,
        event_id: EventId,
        wallet: &Wallet,
    ) -> Result<Option<TxHash>, SubmitError>;
}

/// EVM distributor client signing with the admin key. Each campaign has its
/// own distributor contract because a published root is immutable.
pub struct EvmSubmitter {
    provider: DynProvider,
    distributors: HashMap<EventId, Address>,
    confirmations: u64,
    timeout: Duration,
}

impl EvmSubmitter {
    pub fn new(
        rpc_url: &str,
        signer: PrivateKeySigner,
        distributors: HashMap<EventId, Address>,
        confirmations: u64,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let url: Url = rpc_url.parse().context("Invalid RPC URL")?;
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();
        Ok(Self {
            provider,
            distributors,
            // Never report on a transaction that is not yet in a block.
            confirmations: confirmations.max(1),
            timeout,
        })
    }

    fn distributor(&self, event_id: EventId) -> Result<Address, SubmitError> {
        self.distributors.get(&event_id).copied().ok_or_else(|| {
            SubmitError::Reverted(format!("no distributor configured for event {event_id}"))
        })
    }

    /// Root stored in the campaign's distributor.
    pub async fn merkle_root(&self, event_id: EventId) -> Result<Hash, SubmitError> {
        let contract = IMerkleDistributor::new(self.distributor(event_id)?, self.provider.clone());
        let root = contract
            .merkleRoot()
            .call()
            .await
            .map_err(|e| SubmitError::classify(e.to_string()))?;
        Ok(root.0)
    }

    async fn await_receipt(
        &self,
        pending: PendingTransactionBuilder<Ethereum>,
    ) -> Result<TxHash, SubmitError> {
        let sent = *pending.tx_hash();
        let receipt = pending
            .with_required_confirmations(self.confirmations)
            .with_timeout(Some(self.timeout))
            .get_receipt()
            .await
            .map_err(|e| SubmitError::Unconfirmed {
                tx_hash: TxHash::from_bytes(sent.0),
                message: e.to_string(),
            })?;

        if !receipt.status() {
            return Err(SubmitError::Reverted(format!(
                "transaction {} reverted on-chain",
                receipt.transaction_hash
            )));
        }
        debug!(tx_hash = %receipt.transaction_hash, "Claim transaction confirmed");
        Ok(TxHash::from_bytes(receipt.transaction_hash.0))
    }
}

#[async_trait]
impl ChainSubmitter for EvmSubmitter {
    async fn submit(&self, call: &ClaimCall) -> Result<TxHash, SubmitError> {
        let address = self.distributor(call.event_id)?;
        let contract = IMerkleDistributor::new(address, self.provider.clone());
        let proof: Vec<B256> = call.proof.iter().copied().map(B256::from).collect();

        let pending = contract
            .claim(
                Address::from(*call.wallet.as_bytes()),
                U256::from(call.amount),
                proof,
            )
            .send()
            .await
            .map_err(|e| SubmitError::classify(e.to_string()))?;

        info!(
            event_id = call.event_id,
            wallet = %call.wallet,
            tx_hash = %pending.tx_hash(),
            confirmations = self.confirmations,
            "Claim transaction sent, waiting for confirmation"
        );
        self.await_receipt(pending).await
    }

    async fn confirm(&self, tx_hash: TxHash) -> Result<TxHash, SubmitError> {
        debug!(%tx_hash, "Waiting again for claim transaction");
        let pending = PendingTransactionBuilder::new(
            self.provider.root().clone(),
            B256::from(*tx_hash.as_bytes()),
        );
        self.await_receipt(pending).await
    }

    async fn is_claimed(&self, event_id: EventId, wallet: &Wallet) -> Result<bool, SubmitError> {
        let contract = IMerkleDistributor::new(self.distributor(event_id)?, self.provider.clone());
        contract
            .isClaimed(Address::from(*wallet.as_bytes()))
            .call()
            .await
            .map_err(|e| SubmitError::classify(e.to_string()))
    }

    async fn settling_tx(
        &self,
        event_id: EventId,
        wallet: &Wallet,
    ) -> Result<Option<TxHash>, SubmitError> {
        let contract = IMerkleDistributor::new(self.distributor(event_id)?, self.provider.clone());
        let account = Address::from(*wallet.as_bytes());
        // `account` is not indexed, so every Claimed event is scanned.
        let events = contract
            .Claimed_filter()
            .from_block(0u64)
            .query()
            .await
            .map_err(|e| SubmitError::Network(e.to_string()))?;
        Ok(events
            .into_iter()
            .find(|(event, _)| event.account == account)
            .and_then(|(_, log)| log.transaction_hash)
            .map(|hash| TxHash::from_bytes(hash.0)))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-process distributor with the same double-claim guard as the contract.

    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct State {
        claimed: HashMap<(EventId, Wallet), TxHash>,
        scripted: VecDeque<SubmitError>,
        unconfirmed: usize,
        logs_hidden: bool,
        submissions: usize,
        confirms: usize,
        transfers: usize,
    }

    #[derive(Default)]
    pub struct MockChain {
        state: Mutex<State>,
        latency: Duration,
    }

    impl MockChain {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Self::default()
            }
        }

        /// Failures returned, in order, by the next submissions.
        pub fn fail_next(&self, errors: impl IntoIterator<Item = SubmitError>) {
            self.state.lock().scripted.extend(errors);
        }

        /// The next `count` sends or polls land (or have landed) on-chain but
        /// report `Unconfirmed`.
        pub fn time_out_next(&self, count: usize) {
            self.state.lock().unconfirmed += count;
        }

        /// `settling_tx` finds nothing, as for a node that pruned old logs.
        pub fn hide_logs(&self) {
            self.state.lock().logs_hidden = true;
        }

        pub fn submissions(&self) -> usize {
            self.state.lock().submissions
        }

        pub fn confirms(&self) -> usize {
            self.state.lock().confirms
        }

        pub fn transfers(&self) -> usize {
            self.state.lock().transfers
        }

        /// Records a payout that happened outside this service.
        pub fn set_claimed(&self, event_id: EventId, wallet: Wallet) {
            self.state
                .lock()
                .claimed
                .insert((event_id, wallet), TxHash::from_bytes([0xee; 32]));
        }
    }

    #[async_trait]
    impl ChainSubmitter for MockChain {
        async fn submit(&self, call: &ClaimCall) -> Result<TxHash, SubmitError> {
            tokio::time::sleep(self.latency).await;

            let mut state = self.state.lock();
            state.submissions += 1;
            if let Some(err) = state.scripted.pop_front() {
                return Err(err);
            }
            if state.claimed.contains_key(&(call.event_id, call.wallet)) {
                return Err(SubmitError::Reverted("execution reverted: already claimed".into()));
            }
            state.transfers += 1;
            let mut hash = [0u8; 32];
            hash[24..].copy_from_slice(&(state.transfers as u64).to_be_bytes());
            let tx_hash = TxHash::from_bytes(hash);
            state.claimed.insert((call.event_id, call.wallet), tx_hash);
            if state.unconfirmed > 0 {
                state.unconfirmed -= 1;
                return Err(SubmitError::Unconfirmed {
                    tx_hash,
                    message: "timed out waiting for receipt".into(),
                });
            }
            Ok(tx_hash)
        }

        async fn confirm(&self, tx_hash: TxHash) -> Result<TxHash, SubmitError> {
            tokio::time::sleep(self.latency).await;

            let mut state = self.state.lock();
            state.confirms += 1;
            if state.unconfirmed > 0 {
                state.unconfirmed -= 1;
                return Err(SubmitError::Unconfirmed {
                    tx_hash,
                    message: "timed out waiting for receipt".into(),
                });
            }
            if state.claimed.values().any(|landed| *landed == tx_hash) {
                Ok(tx_hash)
            } else {
                Err(SubmitError::Network(format!("unknown transaction {tx_hash}")))
            }
        }

        async fn is_claimed(
            &self,
            event_id: EventId,
            wallet: &Wallet,
        ) -> Result<bool, SubmitError> {
            Ok(self.state.lock().claimed.contains_key(&(event_id, *wallet)))
        }

        async fn settling_tx(
            &self,
            event_id: EventId,
            wallet: &Wallet,
        ) -> Result<Option<TxHash>, SubmitError> {
            let state = self.state.lock();
            if state.logs_hidden {
                return Ok(None);
            }
            Ok(state.claimed.get(&(event_id, *wallet)).copied())
        }
    }
}
