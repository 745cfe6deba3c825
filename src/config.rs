use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, HashAlgorithm};
use crate::election::{ElectionConstraints, DEFAULT_MIN_VALIDATORS, DEFAULT_REPLICATION_FACTOR};
use crate::errors::{ChainError, ChainResult};
use crate::mining::WorkflowConfig;
use crate::validation::{
    DEFAULT_MAX_CONTENT_SIZE, DEFAULT_ORACLE_INTERVAL, DEFAULT_SHARED_SECRETS_INTERVAL,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub listen: SocketAddr,
    pub geo_patch: String,
    #[serde(default = "default_min_validators")]
    pub min_validators: usize,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default = "default_context_timeout_ms")]
    pub context_timeout_ms: u64,
    #[serde(default = "default_cross_validation_timeout_ms")]
    pub cross_validation_timeout_ms: u64,
    #[serde(default = "default_replication_timeout_ms")]
    pub replication_timeout_ms: u64,
    #[serde(default = "default_fallback_interval_ms")]
    pub fallback_interval_ms: u64,
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    #[serde(default = "default_max_content_size")]
    pub max_content_size: usize,
    #[serde(default = "default_shared_secrets_interval")]
    pub shared_secrets_interval: u64,
    #[serde(default = "default_oracle_interval")]
    pub oracle_interval: u64,
    /// Seed of the current daily node-shared-secret key.
    pub daily_seed: String,
    /// Seed of the long-lived storage nonce.
    pub storage_nonce_seed: String,
    pub genesis: GenesisConfig,
}

fn default_min_validators() -> usize {
    DEFAULT_MIN_VALIDATORS
}

fn default_replication_factor() -> usize {
    DEFAULT_REPLICATION_FACTOR
}

fn default_context_timeout_ms() -> u64 {
    2_000
}

fn default_cross_validation_timeout_ms() -> u64 {
    3_000
}

fn default_replication_timeout_ms() -> u64 {
    5_000
}

fn default_fallback_interval_ms() -> u64 {
    500
}

fn default_reply_timeout_ms() -> u64 {
    1_000
}

fn default_max_content_size() -> usize {
    DEFAULT_MAX_CONTENT_SIZE
}

fn default_shared_secrets_interval() -> u64 {
    DEFAULT_SHARED_SECRETS_INTERVAL
}

fn default_oracle_interval() -> u64 {
    DEFAULT_ORACLE_INTERVAL
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn constraints(&self) -> ElectionConstraints {
        ElectionConstraints {
            min_validators: self.min_validators,
            replication_factor: self.replication_factor,
        }
    }

    pub fn workflow_config(&self) -> WorkflowConfig {
        WorkflowConfig {
            context_timeout: Duration::from_millis(self.context_timeout_ms),
            cross_validation_timeout: Duration::from_millis(self.cross_validation_timeout_ms),
            replication_timeout: Duration::from_millis(self.replication_timeout_ms),
            fallback_interval: Duration::from_millis(self.fallback_interval_ms),
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// 32-byte storage nonce derived from the configured seed.
    pub fn storage_nonce(&self) -> [u8; 32] {
        let digest = crypto::hash(HashAlgorithm::Sha256, self.storage_nonce_seed.as_bytes());
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&digest);
        nonce
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.key"),
            listen: "127.0.0.1:30002".parse().expect("valid socket addr"),
            geo_patch: "F3A".to_string(),
            min_validators: default_min_validators(),
            replication_factor: default_replication_factor(),
            context_timeout_ms: default_context_timeout_ms(),
            cross_validation_timeout_ms: default_cross_validation_timeout_ms(),
            replication_timeout_ms: default_replication_timeout_ms(),
            fallback_interval_ms: default_fallback_interval_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            max_content_size: default_max_content_size(),
            shared_secrets_interval: default_shared_secrets_interval(),
            oracle_interval: default_oracle_interval(),
            daily_seed: "arch-local-daily".to_string(),
            storage_nonce_seed: "arch-local-storage".to_string(),
            genesis: GenesisConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub network_id: String,
    pub uco_price_usd: f64,
    pub allocations: Vec<GenesisAllocation>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            network_id: "arch-local".to_string(),
            uco_price_usd: 0.05,
            allocations: Vec::new(),
        }
    }
}

/// Pre-mined balance granted to an address at bootstrap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub address: String,
    pub amount: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let config = NodeConfig::default();
        config.save(&path).unwrap();
        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.listen, config.listen);
        assert_eq!(loaded.min_validators, config.min_validators);
        assert_eq!(loaded.daily_seed, config.daily_seed);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let minimal = r#"
data_dir = "./data"
key_path = "./keys/node.toml"
listen = "127.0.0.1:30002"
geo_patch = "AAA"
daily_seed = "seed"
storage_nonce_seed = "nonce"

[genesis]
network_id = "test"
uco_price_usd = 0.1
allocations = []
"#;
        let config: NodeConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.min_validators, DEFAULT_MIN_VALIDATORS);
        assert_eq!(config.replication_factor, DEFAULT_REPLICATION_FACTOR);
        assert_eq!(config.max_content_size, DEFAULT_MAX_CONTENT_SIZE);
    }

    #[test]
    fn storage_nonce_is_deterministic() {
        let config = NodeConfig::default();
        assert_eq!(config.storage_nonce(), config.storage_nonce());
    }
}
