//! On-disk snapshot of the CAS and path tables.
//!
//! The table is written with `bincode` next to the blob directory, entries in
//! LRU order (oldest first), so recency survives restarts. Entries whose blob
//! disappeared or changed size are dropped on load, and blobs written after
//! the last save are found by scanning the blob directory.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use hoard_config::{log_storage_debug, log_storage_info, log_storage_warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::compression::read_compressed_header;
use crate::key::{CasKey, StringKey};
use crate::storage::{FileEntry, Storage};
use crate::Result;

const CAS_TABLE_VERSION: u32 = 1;
const CAS_TABLE_FILE: &str = "cas_table.bin";

#[derive(Serialize, Deserialize)]
struct SavedCasEntry {
    key: CasKey,
    size: u64,
    content_size: u64,
}

#[derive(Serialize, Deserialize)]
struct SavedFileEntry {
    name: StringKey,
    cas_key: CasKey,
    size: u64,
    last_written: u64,
}

#[derive(Clone, Copy)]
struct ScannedBlob {
    key: CasKey,
    size: u64,
    content_size: u64,
}

#[derive(Serialize, Deserialize)]
struct CasTableFile {
    version: u32,
    cas_entries: Vec<SavedCasEntry>,
    file_entries: Vec<SavedFileEntry>,
}

impl Storage {
    fn cas_table_path(&self) -> PathBuf {
        self.config.root_dir.join(CAS_TABLE_FILE)
    }

    /// Persist live entries (LRU order) and path info.
    pub fn save_cas_table(&self) -> Result<()> {
        let order = self.access_list.lock().snapshot();
        let mut cas_entries = Vec::with_capacity(order.len());
        for key in order {
            let Some(entry) = self.lookup(&key) else {
                continue;
            };
            let state = entry.state.lock();
            if state.exists && !state.dropped {
                cas_entries.push(SavedCasEntry {
                    key,
                    size: state.size,
                    content_size: state.content_size,
                });
            }
        }

        let file_entries: Vec<SavedFileEntry> = self
            .file_table
            .iter()
            .map(|item| SavedFileEntry {
                name: *item.key(),
                cas_key: item.cas_key,
                size: item.size,
                last_written: item.last_written,
            })
            .collect();

        let table = CasTableFile {
            version: CAS_TABLE_VERSION,
            cas_entries,
            file_entries,
        };

        let path = self.cas_table_path();
        let temp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&temp)?);
            bincode::serialize_into(&mut writer, &table)?;
            writer.flush()?;
        }
        fs::rename(&temp, &path)?;

        log_storage_info!(
            "Saved cas table",
            cas_entries = table.cas_entries.len(),
            file_entries = table.file_entries.len(),
        );
        Ok(())
    }

    /// Rebuild the in-memory tables on open.
    ///
    /// The blob directory is always scanned. With a readable table, its
    /// entries keep their saved order and blobs it does not list (written
    /// after the last save) are restored as the oldest.
    pub(crate) fn load_or_scan(&self) -> Result<()> {
        let on_disk = self.scan_cas_dir()?;
        let path = self.cas_table_path();
        let table = if path.exists() {
            match read_cas_table(&path) {
                Ok(table) => Some(table),
                Err(e) => {
                    log_storage_warn!("Cas table unreadable, using scan order", error = e.to_string());
                    None
                }
            }
        } else {
            None
        };

        match table {
            Some(table) => self.restore_from_table(table, on_disk),
            None => {
                for blob in &on_disk {
                    self.restore_entry(blob.key, blob.size, blob.content_size);
                }
                if !on_disk.is_empty() {
                    log_storage_info!("Scanned cas directory", blobs = on_disk.len());
                }
            }
        }
        Ok(())
    }

    fn restore_from_table(&self, table: CasTableFile, on_disk: Vec<ScannedBlob>) {
        let mut unindexed: HashMap<CasKey, ScannedBlob> =
            on_disk.iter().map(|blob| (blob.key, *blob)).collect();

        let mut indexed = Vec::with_capacity(table.cas_entries.len());
        let mut vanished = 0usize;
        for saved in table.cas_entries {
            match unindexed.get(&saved.key) {
                Some(blob) if blob.size == saved.size => {
                    unindexed.remove(&saved.key);
                    indexed.push(saved);
                }
                _ => vanished += 1,
            }
        }

        // Scan order is oldest modification first.
        let mut newer = 0usize;
        for blob in &on_disk {
            if unindexed.contains_key(&blob.key) {
                self.restore_entry(blob.key, blob.size, blob.content_size);
                newer += 1;
            }
        }
        for saved in &indexed {
            self.restore_entry(saved.key, saved.size, saved.content_size);
        }

        for saved in table.file_entries {
            self.file_table.insert(
                saved.name,
                FileEntry {
                    cas_key: saved.cas_key,
                    size: saved.size,
                    last_written: saved.last_written,
                    verified: false,
                },
            );
        }

        if newer > 0 {
            log_storage_info!("Adopted blobs missing from cas table", count = newer);
        }
        log_storage_debug!("Loaded cas table", restored = indexed.len(), vanished = vanished);
    }

    /// Every blob in the blob directory, oldest modification first.
    fn scan_cas_dir(&self) -> Result<Vec<ScannedBlob>> {
        let mut found: Vec<(SystemTime, ScannedBlob)> = Vec::new();

        for item in WalkDir::new(&self.cas_dir).min_depth(3).max_depth(3) {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    log_storage_warn!("Skipping unreadable cas dir entry", error = e.to_string());
                    continue;
                }
            };
            if !item.file_type().is_file() {
                continue;
            }
            let Some(key) = item.file_name().to_str().and_then(CasKey::from_hex) else {
                continue;
            };
            let meta = item.metadata().map_err(std::io::Error::from)?;
            let size = meta.len();
            let content_size = if key.is_compressed() {
                match read_compressed_header(item.path()) {
                    Ok(header) => header.uncompressed_size,
                    Err(_) => {
                        log_storage_warn!("Ignoring damaged compressed blob", key = key.to_hex());
                        continue;
                    }
                }
            } else {
                size
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((
                modified,
                ScannedBlob {
                    key,
                    size,
                    content_size,
                },
            ));
        }

        found.sort_by_key(|(modified, _)| *modified);
        Ok(found.into_iter().map(|(_, blob)| blob).collect())
    }
}

fn read_cas_table(path: &Path) -> Result<CasTableFile> {
    let reader = BufReader::new(File::open(path)?);
    let table: CasTableFile = bincode::deserialize_from(reader)?;
    if table.version != CAS_TABLE_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("cas table version {}", table.version),
        )
        .into());
    }
    Ok(table)
}
