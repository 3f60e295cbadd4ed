//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Temporary storage roots
//! - A scratch source tree for files to be stored
//! - Configs pointing at both
//!
//! # Usage
//!
//! ```ignore
//! use hoard_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.storage_config(1024 * 1024);
//!     // config.root_dir lives inside env and is removed on drop
//! }
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::{Config, NetworkConfig, StorageConfig};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated storage root directory
    pub storage_root: PathBuf,
    /// Directory for source files handed to the store
    pub source_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let storage_root = root.join("storage");
        let source_root = root.join("source");

        std::fs::create_dir_all(&storage_root)?;
        std::fs::create_dir_all(&source_root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            storage_root,
            source_root,
            test_id,
        })
    }

    /// Storage config rooted in this environment, uncompressed by default.
    pub fn storage_config(&self, capacity: u64) -> StorageConfig {
        StorageConfig {
            root_dir: self.storage_root.clone(),
            capacity,
            store_compressed: false,
            buffer_slot_size: 64 * 1024,
            buffer_slot_count: 4,
            ..StorageConfig::default()
        }
    }

    /// Network config bound to loopback on an ephemeral port.
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            receive_timeout_secs: 10,
            connect_retries: 2,
            ..NetworkConfig::default()
        }
    }

    /// Full config combining the sections above.
    pub fn config(&self, capacity: u64) -> Config {
        Config {
            storage: self.storage_config(capacity),
            network: self.network_config(),
            ..Config::default()
        }
    }

    /// Create a source file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.source_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.storage_root.exists());
        assert!(env.source_root.exists());
    }

    #[test]
    fn test_environment_ids_unique() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.test_id, env2.test_id);
        assert_ne!(env1.storage_root, env2.storage_root);
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("obj/main.o", b"\x7fELF").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"\x7fELF");
    }

    #[test]
    fn test_storage_config_points_into_env() {
        let env = TestEnvironment::new().unwrap();
        let config = env.config(100);
        assert_eq!(config.storage.root_dir, env.storage_root);
        assert_eq!(config.storage.capacity, 100);
        assert_eq!(config.network.port, 0);
    }
}
