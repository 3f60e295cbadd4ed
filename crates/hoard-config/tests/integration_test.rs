//! Integration tests for hoard-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use std::path::PathBuf;
use tempfile::tempdir;

/// Test config loading from real global config file
#[test]
fn test_load_global_config_from_file() {
    let temp = tempdir().unwrap();
    let hoard_dir = temp.path().join(".hoard");
    std::fs::create_dir_all(&hoard_dir).unwrap();

    let config_content = r#"
[storage]
root_dir = "/custom/storage"
capacity = 1048576
store_compressed = false

[network]
port = 2345
requires_crypto = true

[work]
worker_count = 4
"#;
    let global = hoard_dir.join("config.toml");
    std::fs::write(&global, config_content).unwrap();

    let config = hoard_config::Config::load_from(Some(&global), None).unwrap();

    assert_eq!(config.storage.root_dir, PathBuf::from("/custom/storage"));
    assert_eq!(config.storage.capacity, 1048576);
    assert!(!config.storage.store_compressed);
    assert_eq!(config.network.port, 2345);
    assert!(config.network.requires_crypto);
    assert_eq!(config.work.worker_count, 4);
    // Untouched keys keep their defaults
    assert_eq!(config.network.send_chunk_size, 256 * 1024);
}

/// Test config hierarchy: project config overrides global key by key
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let temp = tempdir().unwrap();

    let global = temp.path().join("global.toml");
    std::fs::write(
        &global,
        r#"
[storage]
capacity = 1000
compression_level = 3

[network]
port = 4000
"#,
    )
    .unwrap();

    let project = temp.path().join("project.toml");
    std::fs::write(
        &project,
        r#"
[storage]
capacity = 5000
"#,
    )
    .unwrap();

    let config = hoard_config::Config::load_from(Some(&global), Some(&project)).unwrap();

    assert_eq!(config.storage.capacity, 5000);
    assert_eq!(config.storage.compression_level, 3);
    assert_eq!(config.network.port, 4000);
}

/// Missing files are not an error
#[test]
fn test_missing_files_yield_defaults() {
    let temp = tempdir().unwrap();
    let config = hoard_config::Config::load_from(
        Some(&temp.path().join("nope.toml")),
        Some(&temp.path().join("also-nope.toml")),
    )
    .unwrap();
    assert_eq!(config.network.port, hoard_config::DEFAULT_PORT);
}

/// Malformed TOML surfaces as a parse error
#[test]
fn test_invalid_toml_is_error() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("bad.toml");
    std::fs::write(&global, "[storage\ncapacity = ").unwrap();

    let result = hoard_config::Config::load_from(Some(&global), None);
    assert!(matches!(result, Err(hoard_config::ConfigError::Toml(_))));
}
