//! Configuration for the loan ledger

use crate::types::{AccountId, Amount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Actor configuration
    pub actor: ActorConfig,

    /// Event fan-out configuration
    pub events: EventsConfig,

    /// Logging configuration
    pub log: LogConfig,

    /// Metrics reporting configuration
    pub metrics: MetricsConfig,

    /// Balances allocated when the data directory is first created.
    ///
    /// TOML integers are signed 64-bit, so values are read as `u64` and
    /// widened to [`Amount`] on allocation.
    pub genesis: BTreeMap<String, u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/loan-ledger"),
            service_name: "loan-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            actor: ActorConfig::default(),
            events: EventsConfig::default(),
            log: LogConfig::default(),
            metrics: MetricsConfig::default(),
            genesis: BTreeMap::new(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 2,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Bounded mailbox size (backpressure on callers)
    pub mailbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
        }
    }
}

/// Event fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events buffered per subscriber before it starts lagging
    pub broadcast_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

/// Metrics reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Seconds between metrics snapshots in the node log (0 disables)
    pub log_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_interval_secs: 60,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LOAN_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(capacity) = std::env::var("LOAN_LEDGER_MAILBOX_CAPACITY") {
            config.actor.mailbox_capacity = capacity.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LOAN_LEDGER_MAILBOX_CAPACITY: {}", e))
            })?;
        }

        if let Ok(json) = std::env::var("LOAN_LEDGER_LOG_JSON") {
            config.log.json = matches!(json.as_str(), "1" | "true" | "yes");
        }

        if let Ok(genesis) = std::env::var("LOAN_LEDGER_GENESIS") {
            config.genesis = parse_genesis(&genesis)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the actor cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.actor.mailbox_capacity == 0 {
            return Err(crate::Error::Config(
                "actor.mailbox_capacity must be greater than zero".to_string(),
            ));
        }
        if self.events.broadcast_capacity == 0 {
            return Err(crate::Error::Config(
                "events.broadcast_capacity must be greater than zero".to_string(),
            ));
        }
        if let Some(account) = self.genesis.keys().find(|account| account.is_empty()) {
            return Err(crate::Error::Config(format!(
                "genesis account id must not be empty: {:?}",
                account
            )));
        }
        Ok(())
    }

    /// Genesis allocation as typed accounts
    pub fn genesis_accounts(&self) -> impl Iterator<Item = (AccountId, Amount)> + '_ {
        self.genesis
            .iter()
            .map(|(account, balance)| (AccountId::new(account.clone()), Amount::from(*balance)))
    }
}

/// Parse a genesis table written as `alice=100,bob=50`
pub fn parse_genesis(input: &str) -> crate::Result<BTreeMap<String, u64>> {
    let mut genesis = BTreeMap::new();

    for entry in input.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (account, balance) = entry.split_once('=').ok_or_else(|| {
            crate::Error::Config(format!("Invalid genesis entry {:?}: expected account=balance", entry))
        })?;

        let balance: u64 = balance.trim().parse().map_err(|e| {
            crate::Error::Config(format!("Invalid genesis balance for {:?}: {}", account.trim(), e))
        })?;

        let account = account.trim().to_string();
        if genesis.insert(account.clone(), balance).is_some() {
            return Err(crate::Error::Config(format!(
                "genesis account {:?} listed twice",
                account
            )));
        }
    }

    Ok(genesis)
}
