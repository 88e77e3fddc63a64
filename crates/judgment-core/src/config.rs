//! Engine configuration.
//!
//! Configuration is loaded once at startup from a TOML file and handed by
//! reference into each component; nothing reads ambient globals. Prices and
//! deposit bounds are written as strings in the file (`"0.03"`) so no float
//! ever touches a monetary value.

use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pricing::{PricingError, PricingTable, Tier};

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The tier table violates the pricing partition invariants.
    #[error("invalid tier table: {0}")]
    InvalidTiers(#[from] PricingError),

    /// Deposit bounds are inconsistent.
    #[error("invalid deposit bounds: min {min} exceeds max {max}")]
    InvalidDepositBounds {
        /// Configured minimum deposit.
        min: Decimal,
        /// Configured maximum deposit.
        max: Decimal,
    },
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Anchor transport settings.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Proof-upgrade worker settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Billing settings: deposit bounds and the tier table.
    #[serde(default)]
    pub billing: BillingConfig,
}

impl EngineConfig {
    /// Loads configuration from a TOML file and validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string and validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, the tier table violates the
    /// pricing invariants, or the deposit bounds are inconsistent.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the tier table and deposit bounds.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid tier partition or inverted deposit
    /// bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.billing.pricing_table()?;
        if self.billing.min_deposit > self.billing.max_deposit {
            return Err(ConfigError::InvalidDepositBounds {
                min: self.billing.min_deposit,
                max: self.billing.max_deposit,
            });
        }
        Ok(())
    }
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the `SQLite` database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("judgmentd.db")
}

/// Anchor transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Explicit path to the `ots` binary. When absent, `ots` is resolved
    /// through `PATH`.
    #[serde(default)]
    pub ots_binary: Option<PathBuf>,

    /// Bound on every transport call, in seconds. Expiry is treated exactly
    /// as a transport failure.
    #[serde(default = "default_transport_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ots_binary: None,
            timeout_secs: default_transport_timeout_secs(),
        }
    }
}

const fn default_transport_timeout_secs() -> u64 {
    30
}

/// Proof-upgrade worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between upgrade cycles.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Per-candidate timeout, so one slow external call cannot stall a cycle.
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,

    /// Maximum candidates fetched per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            item_timeout_secs: default_item_timeout_secs(),
            batch_size: default_batch_size(),
        }
    }
}

const fn default_poll_interval_secs() -> u64 {
    3600
}

const fn default_item_timeout_secs() -> u64 {
    60
}

const fn default_batch_size() -> u32 {
    100
}

/// Billing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Minimum accepted deposit.
    #[serde(default = "default_min_deposit")]
    pub min_deposit: Decimal,

    /// Maximum accepted single deposit.
    #[serde(default = "default_max_deposit")]
    pub max_deposit: Decimal,

    /// Tier table; defaults to the standard four-tier table.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<Tier>,
}

impl BillingConfig {
    /// Builds the validated pricing table from the configured tiers.
    ///
    /// # Errors
    ///
    /// Returns [`PricingError`] when the tiers violate the partition
    /// invariants.
    pub fn pricing_table(&self) -> Result<PricingTable, PricingError> {
        PricingTable::new(self.tiers.clone())
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            min_deposit: default_min_deposit(),
            max_deposit: default_max_deposit(),
            tiers: default_tiers(),
        }
    }
}

fn default_min_deposit() -> Decimal {
    dec!(10)
}

fn default_max_deposit() -> Decimal {
    dec!(10000)
}

fn default_tiers() -> Vec<Tier> {
    PricingTable::default_table().tiers().to_vec()
}
