//! # hoard-config
//!
//! Configuration management for Hoard.
//!
//! Loads configuration from:
//! 1. `~/.hoard/config.toml` (global)
//! 2. `.hoard/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)
//!
//! The loaded [`Config`] is a plain value. Components receive the section they
//! need through their constructors; nothing here is process-global.

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Base port of the storage server.
pub const DEFAULT_PORT: u16 = 1345;
/// Port used by a storage proxy (base + 1).
pub const DEFAULT_STORAGE_PROXY_PORT: u16 = DEFAULT_PORT + 1;
/// Port used by the cache server (base + 2).
pub const DEFAULT_CACHE_PORT: u16 = DEFAULT_PORT + 2;
/// Largest payload put in flight in one message.
pub const DEFAULT_SEND_CHUNK_SIZE: u32 = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub work: WorkConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        Self::load_from(global.as_deref(), Some(Path::new(".hoard/config.toml")))
    }

    /// Load config from explicit global/project files, then apply env overrides.
    ///
    /// Missing files are skipped. Keys present in the project file replace the
    /// global ones; tables are merged recursively.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        for path in [global, project].into_iter().flatten() {
            if path.exists() {
                debug!("Loading config from {:?}", path);
                let contents = std::fs::read_to_string(path)?;
                let value: toml::Value = toml::from_str(&contents)?;
                merge_values(&mut merged, value);
            }
        }

        let mut config: Config = merged.try_into()?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Global config path: ~/.hoard/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".hoard/config.toml"))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(path) = std::env::var("HOARD_STORAGE_DIR") {
            self.storage.root_dir = PathBuf::from(path);
        }
        if let Ok(port) = std::env::var("HOARD_PORT") {
            self.network.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "HOARD_PORT",
                value: port,
            })?;
        }
        if let Ok(workers) = std::env::var("HOARD_WORKERS") {
            self.work.worker_count = workers.parse().map_err(|_| ConfigError::InvalidValue {
                key: "HOARD_WORKERS",
                value: workers,
            })?;
        }
        if let Ok(capacity) = std::env::var("HOARD_CAPACITY") {
            self.storage.capacity = capacity.parse().map_err(|_| ConfigError::InvalidValue {
                key: "HOARD_CAPACITY",
                value: capacity,
            })?;
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Storage (CAS) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding blobs and the cas table
    pub root_dir: PathBuf,
    /// Capacity budget in bytes for live blobs
    pub capacity: u64,
    /// Store new blobs compressed
    pub store_compressed: bool,
    /// Compressor id (0 = none, 1 = deflate)
    pub compressor: u8,
    /// Compression level handed to the compressor
    pub compression_level: u8,
    /// Return eviction candidates instead of deleting them
    pub manually_handle_overflow: bool,
    /// Keep retrieved mappings cached on the entry
    pub keep_mapping_in_memory: bool,
    /// Size of one pooled scratch buffer
    pub buffer_slot_size: usize,
    /// Maximum number of pooled scratch buffers
    pub buffer_slot_count: usize,
    /// Fold path case when computing path keys
    pub case_insensitive_paths: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".hoard/storage"),
            capacity: 20 * 1024 * 1024 * 1024,
            store_compressed: true,
            compressor: 1,
            compression_level: 6,
            manually_handle_overflow: false,
            keep_mapping_in_memory: false,
            buffer_slot_size: 1024 * 1024,
            buffer_slot_count: 16,
            case_insensitive_paths: cfg!(windows),
        }
    }
}

/// Network server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_ip: IpAddr,
    pub port: u16,
    /// Require the crypto handshake on accepted connections
    pub requires_crypto: bool,
    /// Hex-encoded 16-byte key registered at startup
    pub crypto_key: Option<String>,
    /// Seconds without inbound traffic before a connection is dropped
    pub receive_timeout_secs: u64,
    pub send_chunk_size: u32,
    /// Worker contexts available for message servicing
    pub max_workers: usize,
    /// Transport-level retries for outbound connections
    pub connect_retries: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            requires_crypto: false,
            crypto_key: None,
            receive_timeout_secs: 60,
            send_chunk_size: DEFAULT_SEND_CHUNK_SIZE,
            max_workers: 32,
            connect_retries: 5,
        }
    }
}

impl NetworkConfig {
    /// Decode `crypto_key` into raw key bytes.
    pub fn crypto_key_bytes(&self) -> Result<Option<[u8; 16]>, ConfigError> {
        let Some(key) = &self.crypto_key else {
            return Ok(None);
        };
        let invalid = || ConfigError::InvalidValue {
            key: "network.crypto_key",
            value: key.clone(),
        };
        let bytes = hex::decode(key).map_err(|_| invalid())?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Some(bytes))
    }
}

/// Work scheduler configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkConfig {
    /// Number of worker threads (0 = logical core count)
    pub worker_count: usize,
}
