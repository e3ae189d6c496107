//! Consensus configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use ballot_core::{DEFAULT_MAX_ROUNDS, DEFAULT_REPLICATION_FACTOR, DEFAULT_REQUIRED_CONFIRMATIONS};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Quorum threshold assigned to every new vote.
    pub required_confirmations: u32,

    /// Confirmation rounds before a vote is permanently failed.
    pub max_rounds: u32,

    /// Election nodes seeded per election.
    pub replication_factor: usize,

    /// Expected interval between node heartbeats.
    pub heartbeat_interval_secs: u64,

    /// Nodes silent longer than this are marked unreachable.
    pub heartbeat_timeout_secs: u64,

    /// Rounds older than this have their pending entries timed out.
    pub round_timeout_secs: u64,

    /// Retries for a failed background evaluation before dead-lettering.
    pub task_max_retries: u32,

    /// Base backoff between background retries.
    pub task_backoff_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            required_confirmations: DEFAULT_REQUIRED_CONFIRMATIONS,
            max_rounds: DEFAULT_MAX_ROUNDS,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 120,
            round_timeout_secs: 60,
            task_max_retries: 3,
            task_backoff_ms: 200,
        }
    }
}

impl ConsensusConfig {
    /// Load from a TOML file; missing keys fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: ConsensusConfig =
            toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.required_confirmations == 0 {
            return Err(ConfigError::Invalid(
                "required_confirmations must be at least 1".to_string(),
            ));
        }
        if self.max_rounds == 0 {
            return Err(ConfigError::Invalid(
                "max_rounds must be at least 1".to_string(),
            ));
        }
        if self.replication_factor == 0 {
            return Err(ConfigError::Invalid(
                "replication_factor must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_secs must exceed heartbeat_interval_secs".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConsensusConfig::default();
        config.validate().unwrap();
        assert_eq!(config.required_confirmations, 3);
        assert_eq!(config.max_rounds, 3);
    }

    #[test]
    fn test_rejects_zero_quorum() {
        let config = ConsensusConfig {
            required_confirmations: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_timeout_below_interval() {
        let config = ConsensusConfig {
            heartbeat_interval_secs: 60,
            heartbeat_timeout_secs: 30,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consensus.toml");
        std::fs::write(&path, "required_confirmations = 5\nmax_rounds = 2\n").unwrap();

        let config = ConsensusConfig::load(&path).unwrap();
        assert_eq!(config.required_confirmations, 5);
        assert_eq!(config.max_rounds, 2);
        // untouched keys keep their defaults
        assert_eq!(config.heartbeat_interval_secs, 30);
    }
}
