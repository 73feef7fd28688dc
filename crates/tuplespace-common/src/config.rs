//! Configuration types for the entry store
//!
//! All sections deserialize from TOML with per-field defaults, so a partial
//! file only overrides what it names.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Disk provider configuration
    pub storage: StorageConfig,
    /// Sleeve cache configuration
    pub cache: CacheConfig,
    /// Write scheduler configuration
    pub writer: WriterConfig,
    /// Lease reaping configuration
    pub lease: LeaseConfig,
    /// Per-type entry behaviour
    pub entry: EntryConfig,
    /// Op log configuration
    pub log: LogConfig,
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache.cache_size == 0 {
            return Err(Error::Configuration("cache.cache_size must be > 0".into()));
        }
        if self.cache.entries_per_partition == 0 {
            return Err(Error::Configuration(
                "cache.entries_per_partition must be > 0".into(),
            ));
        }
        if self.writer.threads == 0 {
            return Err(Error::Configuration("writer.threads must be > 0".into()));
        }
        if self.storage.retry_attempts == 0 {
            return Err(Error::Configuration(
                "storage.retry_attempts must be > 0".into(),
            ));
        }
        if self.storage.scan_page_size == 0 {
            return Err(Error::Configuration(
                "storage.scan_page_size must be > 0".into(),
            ));
        }
        if self.entry.oid_zones == 0 {
            return Err(Error::Configuration("entry.oid_zones must be > 0".into()));
        }
        Ok(())
    }
}

/// Which key-value provider backs the storage tables
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Volatile in-memory tables
    Memory,
    /// redb database file under `data_dir`
    #[default]
    Redb,
}

/// Disk provider configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the database and the op log
    pub data_dir: PathBuf,
    /// Provider implementation
    pub backend: Backend,
    /// Attempts made for an operation that hits lock contention
    pub retry_attempts: u32,
    /// First backoff delay after contention
    pub retry_base_delay_ms: u64,
    /// Backoff ceiling
    pub retry_max_delay_ms: u64,
    /// Keys fetched per cursor page
    pub scan_page_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./tuplespace"),
            backend: Backend::default(),
            retry_attempts: 16,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 200,
            scan_page_size: 256,
        }
    }
}

impl StorageConfig {
    /// First backoff delay
    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Backoff ceiling
    #[must_use]
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

/// Sleeve cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Desired number of cache-resident sleeves per type
    pub cache_size: usize,
    /// Target sleeves per ARC partition
    pub entries_per_partition: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 4096,
            entries_per_partition: 512,
        }
    }
}

impl CacheConfig {
    /// Number of partitions: next power of two >= size / per-partition
    #[must_use]
    pub fn partitions(&self) -> usize {
        let wanted = self.cache_size / self.entries_per_partition.max(1);
        wanted.max(1).next_power_of_two()
    }

    /// Capacity of each partition
    #[must_use]
    pub fn partition_capacity(&self) -> usize {
        (self.cache_size / self.partitions()).max(1)
    }
}

/// Write scheduler configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Background flush threads per type
    pub threads: usize,
    /// Attempts before a failing write-behind is dropped
    pub max_flush_attempts: u32,
    /// Delay before a failed write-behind is retried
    pub retry_delay_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            max_flush_attempts: 5,
            retry_delay_ms: 50,
        }
    }
}

impl WriterConfig {
    /// Delay before a failed write-behind is retried
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Lease reaping configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Track leases and reap expired entries
    pub reaping_enabled: bool,
    /// Interval between background reaps
    pub reap_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            reaping_enabled: true,
            reap_interval_ms: 5_000,
        }
    }
}

impl LeaseConfig {
    /// Interval between background reaps
    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Per-type entry behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    /// Types whose searches must return entries in write order
    pub fifo_types: Vec<String>,
    /// Push a taken sleeve to disk immediately if it was already on disk
    pub early_flush_on_take: bool,
    /// OID allocation zones for non-FIFO types
    pub oid_zones: u32,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            fifo_types: Vec::new(),
            early_flush_on_take: false,
            oid_zones: 1,
        }
    }
}

impl EntryConfig {
    /// Whether a type is searched in FIFO mode
    #[must_use]
    pub fn is_fifo(&self, type_name: &str) -> bool {
        self.fifo_types.iter().any(|t| t == type_name)
    }
}

/// Op log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Record operations to the op log
    pub enabled: bool,
    /// Log file, relative paths resolve against `storage.data_dir`
    pub path: PathBuf,
    /// fsync after every record
    pub sync_on_write: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("ops.log"),
            sync_on_write: true,
        }
    }
}
