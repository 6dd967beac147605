//! Configuration for the ledger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::types::Currency;

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

    /// Optimistic-lock retry policy
    pub retry: RetryConfig,

    /// Transaction-log partitioning
    pub partitions: PartitionConfig,

    /// Wallet and account policies
    pub accounts: AccountsConfig,

    /// Read-side settings
    pub query: QueryConfig,

    /// Record signing
    pub signing: SigningConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/wallet-ledger"),
            service_name: "wallet-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            retry: RetryConfig::default(),
            partitions: PartitionConfig::default(),
            accounts: AccountsConfig::default(),
            query: QueryConfig::default(),
            signing: SigningConfig::default(),
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

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Sync the WAL on every commit
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            target_file_size_mb: 64,
            max_background_jobs: 4,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

/// Retry policy for optimistic-lock conflicts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before surfacing `ConcurrencyExhausted`
    pub max_attempts: u32,

    /// Backoff floor (milliseconds)
    pub base_backoff_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 2,
            max_backoff_ms: 50,
        }
    }
}

/// Partition time granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One partition per calendar month
    Monthly,
    /// One partition per calendar day
    Daily,
}

/// Partitioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Partition width
    pub granularity: Granularity,

    /// Periods provisioned ahead of the current one
    pub horizon: u32,

    /// Run the background maintenance task
    pub maintenance_enabled: bool,

    /// Maintenance interval (seconds)
    pub maintenance_interval_secs: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::Monthly,
            horizon: 3,
            maintenance_enabled: true,
            maintenance_interval_secs: 3600,
        }
    }
}

/// Overdraft policy for one account type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OverdraftPolicy {
    /// Allow the balance to go below zero
    pub allowed: bool,

    /// Most negative balance permitted (absolute value); unlimited when unset
    pub limit: Option<Decimal>,
}

impl OverdraftPolicy {
    /// Lowest balance this policy accepts, `None` when unbounded
    pub fn floor(&self) -> Option<Decimal> {
        if !self.allowed {
            return Some(Decimal::ZERO);
        }
        self.limit.map(|limit| -limit.abs())
    }
}

/// Wallet and account configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Currency of newly created wallets
    pub default_currency: Currency,

    /// Account types created together with every wallet
    pub default_account_types: Vec<String>,

    /// Overdraft policies by account type (absent: overdraft disallowed)
    pub overdraft: HashMap<String, OverdraftPolicy>,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            default_currency: Currency::INR,
            default_account_types: vec!["credits".to_string()],
            overdraft: HashMap::new(),
        }
    }
}

impl AccountsConfig {
    /// Policy for an account type
    pub fn overdraft_for(&self, account_type: &str) -> OverdraftPolicy {
        self.overdraft.get(account_type).cloned().unwrap_or_default()
    }
}

/// Query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Transactions per page
    pub page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { page_size: 100 }
    }
}

/// Ed25519 signing of transaction hashes
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Hex-encoded 32-byte seed; records are unsigned when unset
    pub seed_hex: Option<String>,
}

impl std::fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningConfig")
            .field("seed_hex", &self.seed_hex.as_ref().map(|_| "<redacted>"))
            .finish()
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

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(horizon) = std::env::var("LEDGER_PARTITION_HORIZON") {
            config.partitions.horizon = parse_env("LEDGER_PARTITION_HORIZON", &horizon)?;
        }

        if let Ok(attempts) = std::env::var("LEDGER_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_env("LEDGER_RETRY_MAX_ATTEMPTS", &attempts)?;
        }

        if let Ok(page_size) = std::env::var("LEDGER_PAGE_SIZE") {
            config.query.page_size = parse_env("LEDGER_PAGE_SIZE", &page_size)?;
        }

        if let Ok(code) = std::env::var("LEDGER_DEFAULT_CURRENCY") {
            config.accounts.default_currency = Currency::from_code(&code).ok_or_else(|| {
                crate::Error::Config(format!("Invalid value for LEDGER_DEFAULT_CURRENCY: {}", code))
            })?;
        }

        if let Ok(seed_hex) = std::env::var("LEDGER_SIGNING_SEED") {
            config.signing.seed_hex = Some(seed_hex);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(crate::Error::Config(
                "retry.base_backoff_ms exceeds retry.max_backoff_ms".to_string(),
            ));
        }
        if self.query.page_size == 0 {
            return Err(crate::Error::Config(
                "query.page_size must be at least 1".to_string(),
            ));
        }
        if self.partitions.maintenance_interval_secs == 0 {
            return Err(crate::Error::Config(
                "partitions.maintenance_interval_secs must be at least 1".to_string(),
            ));
        }
        if let Some(seed_hex) = &self.signing.seed_hex {
            crate::crypto::KeyPair::from_seed_hex(seed_hex)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("Invalid value for {}: {}", name, value)))
}
