//! Configuration management for duochain

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::blockchain::{AdmissionPolicy, DEFAULT_DIFFICULTY, MAX_DIFFICULTY};
use crate::error::{ChainError, Result};
use crate::staking::{DEFAULT_ROUND_INTERVAL, DEFAULT_STAKE_PENALTY};
use crate::sync::DEFAULT_RECONCILE_INTERVAL;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub validators: Vec<ValidatorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            p2p_port: default_p2p_port(),
            api_port: default_api_port(),
            bootstrap_peers: Vec::new(),
            reconcile_interval_secs: default_reconcile_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    #[default]
    Pow,
    Pos,
}

impl std::str::FromStr for ConsensusMode {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pow" | "work" => Ok(ConsensusMode::Pow),
            "pos" | "stake" => Ok(ConsensusMode::Pos),
            other => Err(ChainError::ConfigError(format!("unknown consensus mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default)]
    pub mode: ConsensusMode,
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default = "default_round_interval")]
    pub round_interval_secs: u64,
    #[serde(default = "default_stake_penalty")]
    pub stake_penalty: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            mode: ConsensusMode::default(),
            difficulty: default_difficulty(),
            round_interval_secs: default_round_interval(),
            stake_penalty: default_stake_penalty(),
        }
    }
}

/// A validator registered at startup on a stake chain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ValidatorConfig {
    pub id: String,
    #[serde(default)]
    pub balance: u64,
}

impl Config {
    pub fn policy(&self) -> AdmissionPolicy {
        match self.consensus.mode {
            ConsensusMode::Pow => AdmissionPolicy::ProofOfWork {
                difficulty: self.consensus.difficulty,
            },
            ConsensusMode::Pos => AdmissionPolicy::ProofOfStake,
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.network.reconcile_interval_secs)
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_secs(self.consensus.round_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let difficulty = self.consensus.difficulty;
        if difficulty == 0 || difficulty > MAX_DIFFICULTY {
            return Err(ChainError::ConfigError(format!(
                "consensus.difficulty must be between 1 and {}, got {}",
                MAX_DIFFICULTY, difficulty
            )));
        }
        if self.network.reconcile_interval_secs == 0 {
            return Err(ChainError::ConfigError(
                "network.reconcile_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.consensus.round_interval_secs == 0 {
            return Err(ChainError::ConfigError(
                "consensus.round_interval_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(v) = self.validators.iter().find(|v| v.id.trim().is_empty()) {
            return Err(ChainError::ConfigError(format!(
                "validator with balance {} has an empty id",
                v.balance
            )));
        }
        Ok(())
    }
}

/// Load and validate a config file. A missing or empty file yields defaults.
pub fn load_config_from<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config_str = fs::read_to_string(path.as_ref()).unwrap_or_default();
    let config: Config = if config_str.trim().is_empty() {
        Config::default()
    } else {
        toml::from_str(&config_str)?
    };
    config.validate()?;
    Ok(config)
}

fn default_p2p_port() -> u16 {
    9000
}

fn default_api_port() -> u16 {
    8080
}

fn default_reconcile_interval() -> u64 {
    DEFAULT_RECONCILE_INTERVAL.as_secs()
}

fn default_difficulty() -> u32 {
    DEFAULT_DIFFICULTY
}

fn default_round_interval() -> u64 {
    DEFAULT_ROUND_INTERVAL.as_secs()
}

fn default_stake_penalty() -> u64 {
    DEFAULT_STAKE_PENALTY
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.network.p2p_port, 9000);
        assert_eq!(config.network.api_port, 8080);
        assert_eq!(config.consensus.mode, ConsensusMode::Pow);
        assert_eq!(config.policy(), AdmissionPolicy::ProofOfWork { difficulty: 3 });
        assert_eq!(config.reconcile_interval(), DEFAULT_RECONCILE_INTERVAL);
        assert_eq!(config.round_interval(), DEFAULT_ROUND_INTERVAL);
    }

    #[test]
    fn test_stake_config_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[network]
p2p_port = 9100
bootstrap_peers = ["127.0.0.1:9000"]

[consensus]
mode = "pos"
stake_penalty = 2

[[validators]]
id = "alice"
balance = 10

[[validators]]
id = "bob"
"#
        )
        .unwrap();

        let config = load_config_from(file.path()).unwrap();
        assert_eq!(config.network.p2p_port, 9100);
        assert_eq!(config.network.api_port, 8080);
        assert_eq!(config.network.bootstrap_peers, vec!["127.0.0.1:9000".to_string()]);
        assert_eq!(config.policy(), AdmissionPolicy::ProofOfStake);
        assert_eq!(config.consensus.stake_penalty, 2);
        assert_eq!(config.validators.len(), 2);
        assert_eq!(config.validators[1], ValidatorConfig { id: "bob".into(), balance: 0 });
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[consensus]\ndifficulty = 65").unwrap();
        assert!(matches!(load_config_from(file.path()), Err(ChainError::ConfigError(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nreconcile_interval_secs = 0").unwrap();
        assert!(matches!(load_config_from(file.path()), Err(ChainError::ConfigError(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[consensus\nmode = ").unwrap();
        assert!(matches!(load_config_from(file.path()), Err(ChainError::ConfigError(_))));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("PoS".parse::<ConsensusMode>().unwrap(), ConsensusMode::Pos);
        assert_eq!("work".parse::<ConsensusMode>().unwrap(), ConsensusMode::Pow);
        assert!("lottery".parse::<ConsensusMode>().is_err());
    }
}
