// Chain and node configuration

use crate::error::{Error, Result};
use std::time::Duration;

/// Leading zero bits required of a block hash
pub const DEFAULT_TARGET_BITS: u32 = 16;

/// Coinbase reward
pub const DEFAULT_SUBSIDY: u64 = 100;

/// Consensus parameters (fixed difficulty, no retargeting)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainConfig {
    pub target_bits: u32,
    pub subsidy: u64,
}

impl ChainConfig {
    pub fn new(target_bits: u32, subsidy: u64) -> Result<Self> {
        let config = Self { target_bits, subsidy };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_bits == 0 || self.target_bits > 255 {
            return Err(Error::Config(format!(
                "target_bits must be in 1..=255, got {}",
                self.target_bits
            )));
        }
        Ok(())
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            target_bits: DEFAULT_TARGET_BITS,
            subsidy: DEFAULT_SUBSIDY,
        }
    }
}

/// Peer-to-peer node settings
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address this node listens on and announces to peers
    pub listen_addr: String,
    /// Known peers; the first one is the bootstrap node
    pub bootstrap: Vec<String>,
    /// Applied to every connect, read and write
    pub io_timeout: Duration,
    /// Upper bound on a single inbound request
    pub max_message_size: usize,
}

impl NodeConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    /// Node address derived from a node id (port)
    pub fn for_node_id(node_id: &str) -> Self {
        Self::new(format!("localhost:{}", node_id))
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap.first().is_some_and(|b| *b == self.listen_addr)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "localhost:3000".to_string(),
            bootstrap: vec!["localhost:3000".to_string()],
            io_timeout: Duration::from_secs(10),
            max_message_size: 32 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chain_config() {
        let config = ChainConfig::default();
        assert_eq!(config.target_bits, 16);
        assert_eq!(config.subsidy, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_target_bits_bounds() {
        assert!(ChainConfig::new(0, 100).is_err());
        assert!(ChainConfig::new(256, 100).is_err());
        assert!(ChainConfig::new(255, 100).is_ok());
    }

    #[test]
    fn test_node_config_bootstrap() {
        assert!(NodeConfig::for_node_id("3000").is_bootstrap());
        assert!(!NodeConfig::for_node_id("3001").is_bootstrap());
    }
}
