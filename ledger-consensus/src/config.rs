//! Node configuration

use crate::dynasty::{DEFAULT_MAX_PRODUCERS, DEFAULT_SLICE_SECS};
use crate::producer::DEFAULT_BLOCK_SIZE_LIMIT;
use crate::proof::pow::DEFAULT_TARGET_BITS;
use crate::txpool::DEFAULT_SEEN_CACHE_SIZE;
use crate::{constants, ConsensusError, Result};
use ledger_core::{Amount, KeyPair, OwnerId};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Complete node configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub genesis: GenesisConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusKind {
    Pow,
    Dpos,
}

/// Sealing strategy and finality settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub kind: ConsensusKind,
    /// Proof-of-work difficulty in leading zero bits
    pub target_bits: u32,
    /// DPoS slice length in seconds
    pub slice_secs: u64,
    pub max_producers: usize,
    /// DPoS producers as hex owner ids, in schedule order
    pub producers: Vec<String>,
    pub lib_quorum_numerator: usize,
    pub lib_quorum_denominator: usize,
    /// Give up on an unanswered sync after this many seconds
    pub sync_timeout_secs: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            kind: ConsensusKind::Dpos,
            target_bits: DEFAULT_TARGET_BITS,
            slice_secs: DEFAULT_SLICE_SECS,
            max_producers: DEFAULT_MAX_PRODUCERS,
            producers: Vec::new(),
            lib_quorum_numerator: 2,
            lib_quorum_denominator: 3,
            sync_timeout_secs: 30,
        }
    }
}

impl ConsensusConfig {
    pub fn producer_ids(&self) -> Result<Vec<OwnerId>> {
        self.producers
            .iter()
            .map(|p| OwnerId::from_str(p).map_err(|e| ConsensusError::Config(format!("producer {}: {}", p, e))))
            .collect()
    }
}

/// Local block production
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Byte budget for a block's transactions
    pub block_size_limit: usize,
    /// Fixed block subsidy, decimal or 0x-prefixed hex
    pub subsidy: String,
    /// Hex private key; without one the node only validates
    pub private_key: Option<String>,
    /// Assembly deadline in milliseconds
    pub deadline_ms: Option<u64>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            block_size_limit: DEFAULT_BLOCK_SIZE_LIMIT,
            subsidy: constants::DEFAULT_SUBSIDY.to_string(),
            private_key: None,
            deadline_ms: None,
        }
    }
}

impl ProducerConfig {
    pub fn subsidy_amount(&self) -> Result<Amount> {
        Amount::from_string(&self.subsidy).map_err(|e| ConsensusError::Config(format!("subsidy: {}", e)))
    }

    pub fn keypair(&self) -> Result<Option<KeyPair>> {
        self.private_key
            .as_deref()
            .map(|key| KeyPair::from_private_key_hex(key).map_err(|e| ConsensusError::Config(format!("private key: {}", e))))
            .transpose()
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// Transaction pool limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Byte budget for pending transactions
    pub size_limit: usize,
    pub seen_cache_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size_limit: 16 * 1024 * 1024,
            seen_cache_size: DEFAULT_SEEN_CACHE_SIZE,
        }
    }
}

/// One initial allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub owner: String,
    pub amount: String,
}

/// Initial distribution paid by the genesis block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub allocations: Vec<Allocation>,
}

impl GenesisConfig {
    pub fn allocations(&self) -> Result<Vec<(OwnerId, Amount)>> {
        self.allocations
            .iter()
            .map(|a| -> Result<(OwnerId, Amount)> {
                let owner = OwnerId::from_str(&a.owner)
                    .map_err(|e| ConsensusError::Config(format!("allocation owner {}: {}", a.owner, e)))?;
                let amount = Amount::from_string(&a.amount)
                    .map_err(|e| ConsensusError::Config(format!("allocation amount {}: {}", a.amount, e)))?;
                Ok((owner, amount))
            })
            .collect()
    }
}

fn is_json(path: &Path) -> bool {
    path.extension() == Some(OsStr::new("json"))
}

impl NodeConfig {
    /// Load configuration from a TOML or (by extension) JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConsensusError::Config(format!("Failed to read config file: {}", e)))?;

        let config: NodeConfig = if is_json(path) {
            serde_json::from_str(&content)
                .map_err(|e| ConsensusError::Config(format!("Failed to parse JSON config: {}", e)))?
        } else {
            toml::from_str(&content).map_err(|e| ConsensusError::Config(format!("Failed to parse TOML config: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)
                .map_err(|e| ConsensusError::Config(format!("Failed to serialize JSON: {}", e)))?
        } else {
            toml::to_string_pretty(self).map_err(|e| ConsensusError::Config(format!("Failed to serialize TOML: {}", e)))?
        };

        std::fs::write(path, content).map_err(|e| ConsensusError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.consensus.target_bits > 256 {
            return Err(ConsensusError::Config("Target bits must be at most 256".to_string()));
        }

        if self.consensus.slice_secs == 0 {
            return Err(ConsensusError::Config("Slice length must be greater than 0".to_string()));
        }

        if self.consensus.lib_quorum_denominator == 0 {
            return Err(ConsensusError::Config("LIB quorum denominator must be greater than 0".to_string()));
        }

        let producers = self.consensus.producer_ids()?;
        if self.consensus.kind == ConsensusKind::Dpos && producers.len() > self.consensus.max_producers {
            return Err(ConsensusError::Config(format!(
                "{} producers configured but only {} seats",
                producers.len(),
                self.consensus.max_producers
            )));
        }

        self.producer.subsidy_amount()?;
        self.producer.keypair()?;

        if self.pool.size_limit == 0 {
            return Err(ConsensusError::Config("Pool size limit must be greater than 0".to_string()));
        }

        self.genesis.allocations()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validation_failures() {
        let mut config = NodeConfig::default();
        config.consensus.target_bits = 257;
        assert!(matches!(config.validate(), Err(ConsensusError::Config(_))));

        let mut config = NodeConfig::default();
        config.consensus.slice_secs = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.consensus.producers = vec!["not hex".to_string()];
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.producer.subsidy = "ten".to_string();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.pool.size_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_sections_are_optional() {
        let config: NodeConfig = toml::from_str(
            r#"
            [consensus]
            kind = "pow"
            target_bits = 8

            [producer]
            subsidy = "0x0a"
            "#,
        )
        .unwrap();
        assert_eq!(config.consensus.kind, ConsensusKind::Pow);
        assert_eq!(config.consensus.slice_secs, DEFAULT_SLICE_SECS);
        assert_eq!(config.producer.subsidy_amount().unwrap(), Amount::from_u64(10));
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let owner = OwnerId::from_public_key(b"alice");
        let mut config = NodeConfig::default();
        config.consensus.producers = vec![owner.to_string()];
        config.genesis.allocations = vec![Allocation {
            owner: owner.to_string(),
            amount: "1000".to_string(),
        }];

        let dir = std::env::temp_dir();
        for name in ["ledger-node-config-test.toml", "ledger-node-config-test.json"] {
            let path = dir.join(name);
            config.save_to_file(&path).unwrap();
            let loaded = NodeConfig::from_file(&path).unwrap();
            std::fs::remove_file(&path).unwrap();
            assert_eq!(loaded, config);
            assert_eq!(loaded.genesis.allocations().unwrap(), vec![(owner, Amount::from_u64(1000))]);
        }
    }
}
