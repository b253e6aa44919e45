//! Service configuration, loaded once at startup and passed down explicitly.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use anyhow::Context;
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Deserializer};
use sha3::{Digest, Keccak256};
use zeroize::Zeroize;

use crate::campaign::CampaignSpec;
use crate::common::{parse_address, validate_merkle_root};
use crate::coordinator::RetryPolicy;
use crate::eligibility::{EventId, Wallet};
use crate::merkle::{Hash, HashScheme};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// JSON-RPC endpoint of the chain the distributors live on.
    pub rpc_url: String,
    /// Hex private key of the account paying gas; `-` reads it from stdin.
    pub admin_key_file: PathBuf,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_tx_timeout_secs")]
    pub tx_timeout_secs: u64,
    /// Zero disables the periodic reconciliation.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub campaigns: Vec<CampaignConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    pub event_id: EventId,
    #[serde(deserialize_with = "deserialize_address")]
    pub distributor: Address,
    #[serde(default)]
    pub hash: HashScheme,
    /// Root published in the distributor, if already deployed.
    #[serde(default, deserialize_with = "deserialize_root")]
    pub root: Option<Hash>,
}

fn default_database_url() -> String {
    "sqlite://claims.db".to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_confirmations() -> u64 {
    1
}

fn default_tx_timeout_secs() -> u64 {
    120
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn deserialize_address<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Address, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_address(&raw)
        .map(Address::from)
        .map_err(serde::de::Error::custom)
}

fn deserialize_root<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Hash>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    validate_merkle_root(&raw)
        .map(Some)
        .map_err(serde::de::Error::custom)
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.campaigns.is_empty() {
            anyhow::bail!("At least one [[campaigns]] entry is required");
        }
        let mut seen = HashSet::new();
        for campaign in &self.campaigns {
            if !seen.insert(campaign.event_id) {
                anyhow::bail!("Campaign for event {} configured twice", campaign.event_id);
            }
        }
        if self.confirmations == 0 {
            anyhow::bail!("confirmations must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            anyhow::bail!("retry.max_delay_ms must not be below retry.initial_delay_ms");
        }
        Ok(())
    }

    pub fn campaign_specs(&self) -> Vec<CampaignSpec> {
        self.campaigns
            .iter()
            .map(|c| CampaignSpec {
                event_id: c.event_id,
                scheme: c.hash,
                root: c.root,
            })
            .collect()
    }

    pub fn distributors(&self) -> HashMap<EventId, Address> {
        self.campaigns
            .iter()
            .map(|c| (c.event_id, c.distributor))
            .collect()
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0)
            .then(|| Duration::from_secs(self.reconcile_interval_secs))
    }
}

/// Signing key of the account that submits claim transactions.
pub struct AdminKey {
    signing_key: SigningKey,
}

impl AdminKey {
    /// Reads a hex key from `path`, or from stdin when `path` is `-`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut raw = if path == Path::new("-") {
            let mut buffer = String::new();
            std::io::stdin()
                .read_line(&mut buffer)
                .context("Failed to read private key from stdin")?;
            buffer
        } else {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read admin key file {:?}", path))?
        };
        let key = Self::from_hex(&raw);
        raw.zeroize();
        key
    }

    pub fn from_hex(key_str: &str) -> anyhow::Result<Self> {
        let key_str = key_str.trim();
        let key_str = key_str.strip_prefix("0x").unwrap_or(key_str);
        if key_str.is_empty() {
            anyhow::bail!("Private key is empty");
        }
        let mut key_bytes = hex::decode(key_str).context("Invalid private key format")?;
        if key_bytes.len() != 32 {
            let len = key_bytes.len();
            key_bytes.zeroize();
            anyhow::bail!("Invalid private key length: expected 32 bytes, got {}", len);
        }
        let signing_key = SigningKey::from_slice(&key_bytes).context("Invalid private key");
        key_bytes.zeroize();
        Ok(Self {
            signing_key: signing_key?,
        })
    }

    /// Account address: last 20 bytes of keccak256 of the uncompressed public key.
    pub fn address(&self) -> Wallet {
        let public_key = self.signing_key.verifying_key();
        let encoded = public_key.to_encoded_point(false);
        let hash = Keccak256::digest(&encoded.as_bytes()[1..]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&hash[12..32]);
        Wallet::from_bytes(address)
    }

    pub fn into_signer(self) -> PrivateKeySigner {
        PrivateKeySigner::from_signing_key(self.signing_key)
    }
}

impl fmt::Debug for AdminKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
rpc_url = "http://127.0.0.1:8545"
admin_key_file = "admin.key"

[[campaigns]]
event_id = 1
distributor = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.database_url, "sqlite://claims.db");
        assert_eq!(config.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.confirmations, 1);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.reconcile_interval(), Some(Duration::from_secs(300)));

        let specs = config.campaign_specs();
        assert_eq!(specs[0].scheme, HashScheme::Keccak256);
        assert_eq!(specs[0].root, None);
        assert_eq!(
            config.distributors()[&1],
            Address::from(parse_address("0x5fbdb2315678afecb367f032d93f642f64180aa3").unwrap())
        );
    }

    #[test]
    fn test_full_config() {
        let contents = format!(
            r#"
rpc_url = "http://127.0.0.1:8545"
admin_key_file = "-"
database_url = "sqlite::memory:"
listen = "0.0.0.0:9000"
confirmations = 3
reconcile_interval_secs = 0

[retry]
max_attempts = 5

[[campaigns]]
event_id = 1
distributor = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
hash = "sha256"
root = "0x{}"
"#,
            "ab".repeat(32)
        );
        let config = Config::parse(&contents).unwrap();
        assert_eq!(config.confirmations, 3);
        assert_eq!(config.reconcile_interval(), None);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 500);
        assert_eq!(config.campaigns[0].hash, HashScheme::Sha256);
        assert_eq!(config.campaigns[0].root, Some([0xab; 32]));
    }

    #[test]
    fn test_invalid_configs() {
        let duplicate = format!(
            "{MINIMAL}\n[[campaigns]]\nevent_id = 1\n\
             distributor = \"0x5FbDB2315678afecb367f032d93F642f64180aa3\"\n"
        );
        assert!(Config::parse(&duplicate).is_err());

        let no_campaigns = "rpc_url = \"x\"\nadmin_key_file = \"k\"\ncampaigns = []\n";
        assert!(Config::parse(no_campaigns).is_err());

        let zero_address = MINIMAL.replace(
            "0x5FbDB2315678afecb367f032d93F642f64180aa3",
            "0x0000000000000000000000000000000000000000",
        );
        assert!(Config::parse(&zero_address).is_err());

        let unknown_field = format!("{MINIMAL}\nsurprise = 1\n");
        assert!(Config::parse(&unknown_field).is_err());

        let zero_confirmations = MINIMAL.replace(
            "admin_key_file = \"admin.key\"",
            "admin_key_file = \"admin.key\"\nconfirmations = 0",
        );
        assert!(Config::parse(&zero_confirmations).is_err());
    }

    #[test]
    fn test_admin_key_address() {
        // Well-known development key #0.
        let key = AdminKey::from_hex(
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        )
        .unwrap();
        assert_eq!(
            key.address().to_string(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
        let signer = key.into_signer();
        assert_eq!(
            signer.address(),
            Address::from(parse_address("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266").unwrap())
        );
    }

    #[test]
    fn test_admin_key_rejects_bad_input() {
        assert!(AdminKey::from_hex("").is_err());
        assert!(AdminKey::from_hex("0x1234").is_err());
        assert!(AdminKey::from_hex(&"zz".repeat(32)).is_err());
        assert!(AdminKey::from_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn test_admin_key_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin.key");
        std::fs::write(
            &path,
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80\n",
        )
        .unwrap();
        let key = AdminKey::load(&path).unwrap();
        assert!(format!("{key:?}").contains("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"));
    }
}
