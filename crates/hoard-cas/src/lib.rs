//! # hoard-cas
//!
//! Content-addressable storage for Hoard build artifacts.
//!
//! Blobs are keyed by their BLAKE3 hash ([`CasKey`]) and laid out with a
//! 2-level fan-out below the storage root:
//!
//! ```text
//! <root>/
//! ├── cas/
//! │   └── ab/
//! │       └── cd/
//! │           └── abcd1234...   # raw or block-compressed content
//! ├── temp/                     # in-flight writes, wiped on open
//! ├── cas_table.bin             # LRU order + path info
//! └── hoard.lock                # held by the process that has the storage open
//! ```
//!
//! [`Storage`] adds a path -> key fast path, deferred blob creation, LRU
//! eviction under a byte budget, and integrity checking on top of that layout.

mod access_list;
mod buffer_slots;
mod cas_table;
pub mod compression;
mod key;
mod storage;

pub use buffer_slots::{BufferSlot, BufferSlots};
pub use compression::Compressor;
pub use key::{calculate_cas_key, CasKey, StringKey};
pub use storage::{last_written_of, CasView, CheckReport, FileEntry, Storage, StorageStats};

use std::io;

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Cas entry not found: {key}")]
    NotFound { key: CasKey },

    #[error("Cas entry failed verification and is disallowed: {key}")]
    Disallowed { key: CasKey },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: CasKey, actual: CasKey },

    #[error("Cas blob missing on disk: {key}")]
    MissingBlob { key: CasKey },

    #[error("Storage at {} is in use by another process", root.display())]
    Locked { root: std::path::PathBuf },

    #[error("Cas table error: {0}")]
    Table(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
