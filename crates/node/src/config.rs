//! Node configuration.
//!
//! Loaded from a TOML file; the local node is selected by `--node-index`.
//! Example:
//!
//! ```toml
//! [network]
//! timeout_ms = 3000
//!
//! [[network.nodes]]
//! address = "127.0.0.1:4500"
//! public_key = "ab..ef"
//! private_key = "12..34"   # only for the local node
//!
//! [[network.nodes]]
//! address = "127.0.0.1:4501"
//! public_key = "cd..01"
//!
//! [consensus]
//! min_timeout_ms = 2000
//! max_timeout_ms = 30000
//! timeout_factor = 2.0
//!
//! [db]
//! path = "./data"
//! state_history_size = 100
//! block_history_size = 1000
//! prune_interval_ms = 60000
//!
//! [model]
//! max_row = 20
//! max_col = 20
//! simulated_decision_time_ms = 1000
//! ```

use gridbot_consensus::ConsensusConfig;
use gridbot_types::{Federation, FederationEntry, GridLimits, KeyPair, PeerAddress, PeerKey};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration problems; all fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("network.nodes must not be empty")]
    EmptyFederation,

    #[error("node index {index} out of range, {nodes} nodes configured")]
    NodeIndexOutOfRange { index: usize, nodes: usize },

    #[error("node {index} has no private key but was selected as local")]
    MissingPrivateKey { index: usize },

    #[error("invalid key for node {index}: {reason}")]
    InvalidKey { index: usize, reason: String },

    #[error("private key of node {index} does not match its public key")]
    KeyMismatch { index: usize },

    #[error("invalid address {address:?} for node {index}")]
    InvalidAddress { index: usize, address: String },
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub network: NetworkSection,
    #[serde(default)]
    pub consensus: ConsensusSection,
    pub db: DbSection,
    #[serde(default)]
    pub model: ModelSection,
}

/// Federation table and application-level network settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    pub nodes: Vec<NodeEntry>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// One federation member as configured.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    /// `host:port` the member's server listens on.
    pub address: String,
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
    /// Hex-encoded 32-byte seed; present only for the local node.
    #[serde(default)]
    pub private_key: Option<String>,
}

/// View timeout policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusSection {
    #[serde(default = "default_min_timeout_ms")]
    pub min_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_timeout_factor")]
    pub timeout_factor: f64,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        ConsensusSection {
            min_timeout_ms: default_min_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            timeout_factor: default_timeout_factor(),
        }
    }
}

/// Storage locations and retention windows.
#[derive(Debug, Clone, Deserialize)]
pub struct DbSection {
    /// Base directory; each node appends its index.
    pub path: PathBuf,
    #[serde(default = "default_state_history_size")]
    pub state_history_size: usize,
    #[serde(default = "default_block_history_size")]
    pub block_history_size: usize,
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,
}

/// Robot application model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_max_row")]
    pub max_row: u32,
    #[serde(default = "default_max_col")]
    pub max_col: u32,
    #[serde(default = "default_simulated_decision_time_ms")]
    pub simulated_decision_time_ms: u64,
}

impl Default for ModelSection {
    fn default() -> Self {
        ModelSection {
            max_row: default_max_row(),
            max_col: default_max_col(),
            simulated_decision_time_ms: default_simulated_decision_time_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    3_000
}

fn default_min_timeout_ms() -> u64 {
    2_000
}

fn default_max_timeout_ms() -> u64 {
    30_000
}

fn default_timeout_factor() -> f64 {
    2.0
}

fn default_state_history_size() -> usize {
    100
}

fn default_block_history_size() -> usize {
    1_000
}

fn default_prune_interval_ms() -> u64 {
    60_000
}

fn default_max_row() -> u32 {
    20
}

fn default_max_col() -> u32 {
    20
}

fn default_simulated_decision_time_ms() -> u64 {
    1_000
}

impl Config {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Validate and resolve the configuration for one local node.
    pub fn resolve(&self, node_index: usize) -> Result<ResolvedConfig, ConfigError> {
        if self.network.nodes.is_empty() {
            return Err(ConfigError::EmptyFederation);
        }
        if node_index >= self.network.nodes.len() {
            return Err(ConfigError::NodeIndexOutOfRange {
                index: node_index,
                nodes: self.network.nodes.len(),
            });
        }

        let mut entries = Vec::with_capacity(self.network.nodes.len());
        for (index, node) in self.network.nodes.iter().enumerate() {
            let key =
                PeerKey::from_hex(&node.public_key).map_err(|e| ConfigError::InvalidKey {
                    index,
                    reason: e.to_string(),
                })?;
            let address = parse_address(index, &node.address)?;
            entries.push(FederationEntry { key, address });
        }

        let local = &self.network.nodes[node_index];
        let seed_hex = local
            .private_key
            .as_deref()
            .ok_or(ConfigError::MissingPrivateKey { index: node_index })?;
        let seed = hex::decode(seed_hex).map_err(|e| ConfigError::InvalidKey {
            index: node_index,
            reason: e.to_string(),
        })?;
        let seed: [u8; 32] = seed.try_into().map_err(|_| ConfigError::InvalidKey {
            index: node_index,
            reason: "private key must be a 32-byte seed".into(),
        })?;
        let keypair = KeyPair::from_seed(&seed);
        if keypair.peer_key() != entries[node_index].key {
            return Err(ConfigError::KeyMismatch { index: node_index });
        }

        Ok(ResolvedConfig {
            federation: Federation::new(entries.clone()),
            local_index: node_index,
            local_address: entries[node_index].address.clone(),
            keypair,
            request_timeout: Duration::from_millis(self.network.timeout_ms),
            consensus: ConsensusConfig::new()
                .with_min_timeout(Duration::from_millis(self.consensus.min_timeout_ms))
                .with_max_timeout(Duration::from_millis(self.consensus.max_timeout_ms))
                .with_timeout_factor(self.consensus.timeout_factor),
            limits: GridLimits {
                max_row: self.model.max_row,
                max_col: self.model.max_col,
            },
            decision_interval: Duration::from_millis(self.model.simulated_decision_time_ms),
            db_dir: self.db.path.join(node_index.to_string()),
            state_history_size: self.db.state_history_size,
            block_history_size: self.db.block_history_size,
            prune_interval: Duration::from_millis(self.db.prune_interval_ms),
        })
    }
}

fn parse_address(index: usize, address: &str) -> Result<PeerAddress, ConfigError> {
    let invalid = || ConfigError::InvalidAddress {
        index,
        address: address.to_string(),
    };
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    Ok(PeerAddress::new(host, port))
}

/// The validated runtime configuration of one node.
pub struct ResolvedConfig {
    pub federation: Federation,
    pub local_index: usize,
    pub local_address: PeerAddress,
    pub keypair: KeyPair,
    pub request_timeout: Duration,
    pub consensus: ConsensusConfig,
    pub limits: GridLimits,
    pub decision_interval: Duration,
    pub db_dir: PathBuf,
    pub state_history_size: usize,
    pub block_history_size: usize,
    pub prune_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(local_has_key: bool) -> Config {
        let a = KeyPair::from_seed(&[1; 32]);
        let b = KeyPair::from_seed(&[2; 32]);
        Config {
            network: NetworkSection {
                nodes: vec![
                    NodeEntry {
                        address: "127.0.0.1:4500".into(),
                        public_key: a.peer_key().to_hex(),
                        private_key: local_has_key.then(|| hex::encode([1u8; 32])),
                    },
                    NodeEntry {
                        address: "127.0.0.1:4501".into(),
                        public_key: b.peer_key().to_hex(),
                        private_key: None,
                    },
                ],
                timeout_ms: default_timeout_ms(),
            },
            consensus: ConsensusSection::default(),
            db: DbSection {
                path: PathBuf::from("/tmp/gridbot"),
                state_history_size: 10,
                block_history_size: 100,
                prune_interval_ms: 1_000,
            },
            model: ModelSection::default(),
        }
    }

    #[test]
    fn resolves_a_valid_local_node() {
        let resolved = sample_config(true).resolve(0).unwrap();
        assert_eq!(resolved.federation.len(), 2);
        assert_eq!(resolved.local_index, 0);
        assert_eq!(resolved.local_address.port, 4500);
        assert_eq!(resolved.db_dir, PathBuf::from("/tmp/gridbot/0"));
        assert_eq!(
            resolved.keypair.peer_key(),
            resolved.federation.entries()[0].key
        );
    }

    #[test]
    fn rejects_out_of_range_index() {
        let err = sample_config(true).resolve(2).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NodeIndexOutOfRange { index: 2, nodes: 2 }
        ));
    }

    #[test]
    fn rejects_missing_private_key() {
        let err = sample_config(false).resolve(0).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPrivateKey { index: 0 }));
        // Selecting a node that never carries a key also fails.
        let err = sample_config(true).resolve(1).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPrivateKey { index: 1 }));
    }

    #[test]
    fn rejects_mismatched_private_key() {
        let mut config = sample_config(true);
        config.network.nodes[0].private_key = Some(hex::encode([9u8; 32]));
        let err = config.resolve(0).unwrap_err();
        assert!(matches!(err, ConfigError::KeyMismatch { index: 0 }));
    }

    #[test]
    fn rejects_malformed_keys_and_addresses() {
        let mut config = sample_config(true);
        config.network.nodes[1].public_key = "not hex".into();
        assert!(matches!(
            config.resolve(0).unwrap_err(),
            ConfigError::InvalidKey { index: 1, .. }
        ));

        let mut config = sample_config(true);
        config.network.nodes[1].address = "no-port".into();
        assert!(matches!(
            config.resolve(0).unwrap_err(),
            ConfigError::InvalidAddress { index: 1, .. }
        ));
    }

    #[test]
    fn parses_a_toml_document() {
        let a = KeyPair::from_seed(&[1; 32]);
        let toml_doc = format!(
            r#"
            [network]
            [[network.nodes]]
            address = "127.0.0.1:4500"
            public_key = "{}"
            private_key = "{}"

            [db]
            path = "./data"
            "#,
            a.peer_key().to_hex(),
            hex::encode([1u8; 32]),
        );
        let config: Config = toml::from_str(&toml_doc).unwrap();
        let resolved = config.resolve(0).unwrap();
        assert_eq!(resolved.state_history_size, default_state_history_size());
        assert_eq!(resolved.prune_interval, Duration::from_secs(60));
        assert_eq!(resolved.limits.max_row, 20);
    }
}
