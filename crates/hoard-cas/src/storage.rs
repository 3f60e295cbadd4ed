//! Deduplicated blob storage with a path fast path and LRU eviction.
//!
//! Lock order: `cas_table` -> entry `state` -> `deferred` / `pending_deletes`
//! -> `access_list`. The access list lock is a leaf and is never held while
//! taking any other lock.
//!
//! One process at a time owns a storage root; [`Storage::open`] takes an
//! exclusive lock on `hoard.lock` and holds it until the storage is dropped.

use std::collections::HashMap;
use std::fs::{self, File, Metadata};
use std::io::{self, BufWriter, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use fs2::FileExt;
use hoard_config::{log_storage_debug, log_storage_error, log_storage_info, log_storage_warn};
use hoard_config::StorageConfig;
use hoard_work::{parallel_for, WorkManager};
use memmap2::{Mmap, MmapMut};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::Serialize;
use tracing::instrument;

use crate::access_list::AccessList;
use crate::buffer_slots::BufferSlots;
use crate::compression::{decompress_file_to_memory, read_compressed_header, write_compressed, Compressor};
use crate::key::{calculate_cas_key, CasKey, StringKey};
use crate::{Result, StorageError};

/// Last known content key of a source path.
#[derive(Debug, Clone, Copy)]
pub struct FileEntry {
    pub cas_key: CasKey,
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub last_written: u64,
    pub verified: bool,
}

/// Blob whose bytes are written on first use instead of at store time.
#[derive(Debug, Clone)]
pub(crate) struct DeferredCasCreation {
    pub source: PathBuf,
    pub file_name_key: Option<StringKey>,
    pub hint: String,
}

#[derive(Default)]
pub(crate) struct CasEntryState {
    /// Bytes on disk; this is what counts against capacity.
    pub size: u64,
    /// Bytes after decompression.
    pub content_size: u64,
    pub exists: bool,
    pub dropped: bool,
    pub being_written: bool,
    pub verified: bool,
    pub disallowed: bool,
    pub keep_mapping: bool,
    pub mapping: Option<Arc<Mmap>>,
}

pub(crate) struct CasEntry {
    pub key: CasKey,
    pub list_index: u32,
    pub state: Mutex<CasEntryState>,
    write_done: Condvar,
}

impl CasEntry {
    fn new(key: CasKey, list_index: u32) -> Self {
        Self {
            key,
            list_index,
            state: Mutex::new(CasEntryState::default()),
            write_done: Condvar::new(),
        }
    }

    fn wait_for_writer(&self, state: &mut MutexGuard<'_, CasEntryState>) {
        while state.being_written {
            self.write_done.wait(state);
        }
    }
}

/// Read-only view of a blob's decompressed content.
pub struct CasView {
    key: CasKey,
    mapping: Option<Arc<Mmap>>,
}

impl CasView {
    pub fn key(&self) -> CasKey {
        self.key
    }
}

impl Deref for CasView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.mapping {
            Some(mapping) => mapping,
            None => &[],
        }
    }
}

impl AsRef<[u8]> for CasView {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub cas_entries: usize,
    pub live_entries: usize,
    pub file_entries: usize,
    pub total_bytes: u64,
    pub capacity: u64,
    pub hashed_files: u64,
    pub hashed_bytes: u64,
    pub stores: u64,
    pub dedup_hits: u64,
    pub retrieves: u64,
    pub evictions: u64,
    pub corrupt: u64,
}

/// Outcome of [`Storage::check_all_cas_files`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub checked: u64,
    pub corrupt: u64,
    pub missing: u64,
    pub deleted: u64,
}

#[derive(Default)]
struct Counters {
    hashed_files: AtomicU64,
    hashed_bytes: AtomicU64,
    stores: AtomicU64,
    dedup_hits: AtomicU64,
    retrieves: AtomicU64,
    evictions: AtomicU64,
    corrupt: AtomicU64,
}

enum BlobSource<'a> {
    File(&'a Path),
    Memory(&'a [u8]),
    /// File inside the storage temp dir, moved into place when possible.
    Temp(&'a Path),
}

const LOCK_FILE: &str = "hoard.lock";

/// Modification time of `metadata` as stored in [`FileEntry::last_written`].
pub fn last_written_of(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub struct Storage {
    pub(crate) config: StorageConfig,
    pub(crate) cas_dir: PathBuf,
    temp_dir: PathBuf,
    slots: BufferSlots,
    compressor: Compressor,
    pub(crate) file_table: DashMap<StringKey, FileEntry>,
    pub(crate) cas_table: RwLock<HashMap<CasKey, Arc<CasEntry>>>,
    pub(crate) access_list: Mutex<AccessList<CasKey>>,
    deferred: Mutex<HashMap<CasKey, DeferredCasCreation>>,
    pending_deletes: Mutex<Vec<CasKey>>,
    pub(crate) total_bytes: AtomicU64,
    temp_counter: AtomicU64,
    counters: Counters,
    _root_lock: File,
}

/// Lock `root` for this process. The lock goes away with the returned file.
fn lock_root(root: &Path) -> Result<File> {
    let file = File::create(root.join(LOCK_FILE))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            log_storage_warn!("Storage root is locked", root = root.display().to_string());
            Err(StorageError::Locked {
                root: root.to_path_buf(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

impl Storage {
    /// Open (or create) the storage under `config.root_dir`.
    ///
    /// A saved cas table restores LRU order and path info, and blobs the
    /// table does not know about are picked up by a scan of the blob directory.
    ///
    /// Fails with [`StorageError::Locked`] while another process has the root open.
    pub fn open(config: StorageConfig) -> Result<Self> {
        let cas_dir = config.root_dir.join("cas");
        let temp_dir = config.root_dir.join("temp");
        fs::create_dir_all(&cas_dir)?;
        let root_lock = lock_root(&config.root_dir)?;
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir)?;
        }
        fs::create_dir_all(&temp_dir)?;

        let compressor = match Compressor::from_id(config.compressor) {
            Some(Compressor::None) | None => Compressor::Deflate,
            Some(compressor) => compressor,
        };

        let storage = Self {
            slots: BufferSlots::new(config.buffer_slot_size, config.buffer_slot_count),
            compressor,
            cas_dir,
            temp_dir,
            file_table: DashMap::new(),
            cas_table: RwLock::new(HashMap::new()),
            access_list: Mutex::new(AccessList::new()),
            deferred: Mutex::new(HashMap::new()),
            pending_deletes: Mutex::new(Vec::new()),
            total_bytes: AtomicU64::new(0),
            temp_counter: AtomicU64::new(0),
            counters: Counters::default(),
            _root_lock: root_lock,
            config,
        };

        storage.load_or_scan()?;
        log_storage_info!(
            "Storage opened",
            root = storage.config.root_dir.display().to_string(),
            entries = storage.cas_table.read().len(),
            total_bytes = storage.total_bytes(),
            capacity = storage.config.capacity,
        );

        if !storage.config.manually_handle_overflow {
            storage.handle_overflow();
        }
        Ok(storage)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Whether new blobs are stored compressed.
    pub fn store_compressed(&self) -> bool {
        self.config.store_compressed && self.config.compressor != Compressor::None.id()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn string_key(&self, path: &Path) -> StringKey {
        StringKey::from_path(path, self.config.case_insensitive_paths)
    }

    pub(crate) fn blob_path(&self, key: &CasKey) -> PathBuf {
        let hex = key.to_hex();
        self.cas_dir.join(&hex[..2]).join(&hex[2..4]).join(hex)
    }

    pub(crate) fn lookup(&self, key: &CasKey) -> Option<Arc<CasEntry>> {
        self.cas_table.read().get(key).cloned()
    }

    pub(crate) fn entry(&self, key: CasKey) -> Arc<CasEntry> {
        if let Some(entry) = self.lookup(&key) {
            return entry;
        }
        let mut table = self.cas_table.write();
        Arc::clone(table.entry(key).or_insert_with(|| {
            let list_index = self.access_list.lock().allocate(key);
            Arc::new(CasEntry::new(key, list_index))
        }))
    }

    fn touch(&self, entry: &CasEntry) {
        self.access_list.lock().touch(entry.list_index);
    }

    // ========================================================================
    // Hashing
    // ========================================================================

    pub fn calculate_cas_key(&self, data: &[u8], store_compressed: bool) -> CasKey {
        self.counters.hashed_files.fetch_add(1, Ordering::Relaxed);
        self.counters
            .hashed_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        calculate_cas_key(data, store_compressed)
    }

    /// Hash a file through a memory mapping.
    pub fn calculate_cas_key_for_file(&self, path: &Path, store_compressed: bool) -> Result<CasKey> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(self.calculate_cas_key(&[], store_compressed));
        }
        // Safety: read-only mapping; a concurrent writer can only make the hash stale.
        let mapping = unsafe { Mmap::map(&file) }?;
        Ok(self.calculate_cas_key(&mapping, store_compressed))
    }

    // ========================================================================
    // Path table
    // ========================================================================

    /// Cached key of a path, trusted only when size and mtime still match.
    ///
    /// Never hashes. A match marks the entry verified.
    pub fn verify_and_get_cached_file_info(
        &self,
        file_name_key: StringKey,
        last_written: u64,
        size: u64,
    ) -> Option<CasKey> {
        let mut entry = self.file_table.get_mut(&file_name_key)?;
        if entry.last_written == last_written && entry.size == size && entry.cas_key.is_valid() {
            entry.verified = true;
            Some(entry.cas_key)
        } else {
            entry.verified = false;
            None
        }
    }

    /// Record that `path` was just written, hashing its new content.
    pub fn report_file_write(&self, file_name_key: StringKey, path: &Path) -> Result<CasKey> {
        let metadata = fs::metadata(path)?;
        let cas_key = self.calculate_cas_key_for_file(path, self.store_compressed())?;
        self.file_table.insert(
            file_name_key,
            FileEntry {
                cas_key,
                size: metadata.len(),
                last_written: last_written_of(&metadata),
                verified: true,
            },
        );
        Ok(cas_key)
    }

    /// Record path info learned elsewhere; confirmed on the next stat match.
    pub fn report_file_info_weak(
        &self,
        file_name_key: StringKey,
        cas_key: CasKey,
        last_written: u64,
        size: u64,
    ) {
        self.file_table.insert(
            file_name_key,
            FileEntry {
                cas_key,
                size,
                last_written,
                verified: false,
            },
        );
    }

    pub fn invalidate_cached_file_info(&self, file_name_key: StringKey) {
        self.file_table.remove(&file_name_key);
    }

    pub fn cached_file_info(&self, file_name_key: StringKey) -> Option<FileEntry> {
        self.file_table.get(&file_name_key).map(|entry| *entry)
    }

    // ========================================================================
    // Store
    // ========================================================================

    /// Store the content of `file_name`, returning its key.
    ///
    /// With `defer_creation` only the intent is recorded; the blob is written
    /// by the first retrieval or [`Storage::ensure_cas_file`].
    #[instrument(skip(self, hint), level = "debug")]
    pub fn store_cas_file(
        &self,
        file_name_key: StringKey,
        file_name: &Path,
        hint: &str,
        defer_creation: bool,
        keep_mapping_in_memory: bool,
    ) -> Result<CasKey> {
        let metadata = fs::metadata(file_name)?;
        let size = metadata.len();
        let last_written = last_written_of(&metadata);
        let compressed = self.store_compressed();

        let cas_key = match self.verify_and_get_cached_file_info(file_name_key, last_written, size) {
            Some(key) if key.is_compressed() == compressed => key,
            _ => {
                let key = self.calculate_cas_key_for_file(file_name, compressed)?;
                self.file_table.insert(
                    file_name_key,
                    FileEntry {
                        cas_key: key,
                        size,
                        last_written,
                        verified: true,
                    },
                );
                key
            }
        };

        self.store_with_key(
            cas_key,
            BlobSource::File(file_name),
            Some(file_name_key),
            hint,
            defer_creation,
            keep_mapping_in_memory,
        )?;
        Ok(cas_key)
    }

    #[instrument(skip(self, data, hint), level = "debug", fields(size = data.len()))]
    pub fn store_cas_file_from_memory(&self, data: &[u8], hint: &str) -> Result<CasKey> {
        let cas_key = self.calculate_cas_key(data, self.store_compressed());
        self.store_with_key(cas_key, BlobSource::Memory(data), None, hint, false, false)?;
        Ok(cas_key)
    }

    /// Adopt a fully received temp file as the blob of `expected_key`.
    ///
    /// The content is hashed in the mode of `expected_key`. The temp file is
    /// consumed on every path.
    #[instrument(skip(self, hint), level = "debug")]
    pub fn import_cas_file(&self, expected_key: CasKey, temp_path: &Path, hint: &str) -> Result<CasKey> {
        let actual = match self.calculate_cas_key_for_file(temp_path, expected_key.is_compressed()) {
            Ok(actual) => actual,
            Err(e) => {
                fs::remove_file(temp_path).ok();
                return Err(e);
            }
        };
        if actual != expected_key {
            fs::remove_file(temp_path).ok();
            log_storage_error!(
                "Imported content does not match its key",
                expected = expected_key.to_hex(),
                actual = actual.to_hex(),
                hint = hint,
            );
            return Err(StorageError::HashMismatch {
                expected: expected_key,
                actual,
            });
        }

        let result = self.store_with_key(expected_key, BlobSource::Temp(temp_path), None, hint, false, false);
        if temp_path.exists() {
            fs::remove_file(temp_path).ok();
        }
        result.map(|_| expected_key)
    }

    /// New empty file in the storage temp dir, on the same volume as the blobs.
    pub fn create_temp_file(&self) -> Result<(PathBuf, File)> {
        let id = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let path = self
            .temp_dir
            .join(format!("{}-{}.tmp", std::process::id(), id));
        let file = File::create(&path)?;
        Ok((path, file))
    }

    fn store_with_key(
        &self,
        key: CasKey,
        source: BlobSource<'_>,
        file_name_key: Option<StringKey>,
        hint: &str,
        defer_creation: bool,
        keep_mapping: bool,
    ) -> Result<()> {
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        let entry = self.entry(key);
        let mut state = entry.state.lock();
        entry.wait_for_writer(&mut state);
        state.keep_mapping |= keep_mapping;

        if state.exists && state.dropped && self.blob_path(&key).exists() {
            // Dropped but not yet deleted: reuse the blob.
            state.dropped = false;
            self.total_bytes.fetch_add(state.size, Ordering::AcqRel);
        }
        if state.exists && !state.dropped {
            self.counters.dedup_hits.fetch_add(1, Ordering::Relaxed);
            self.touch(&entry);
            drop(state);
            self.overflow_after_store(&key);
            return Ok(());
        }
        state.exists = false;
        state.dropped = false;

        if let (true, BlobSource::File(path)) = (defer_creation, &source) {
            self.deferred.lock().entry(key).or_insert_with(|| DeferredCasCreation {
                source: path.to_path_buf(),
                file_name_key,
                hint: hint.to_string(),
            });
            self.touch(&entry);
            log_storage_debug!("Deferred cas creation", key = key.to_hex(), hint = hint);
            return Ok(());
        }

        state.being_written = true;
        drop(state);

        let result = self.write_blob(&key, &source);

        let mut state = entry.state.lock();
        state.being_written = false;
        let result = match result {
            Ok((size, content_size)) => {
                self.finish_write(&entry, &mut state, size, content_size);
                Ok(())
            }
            Err(e) => {
                log_storage_error!(
                    "Failed to write cas blob",
                    key = key.to_hex(),
                    hint = hint,
                    error = e.to_string(),
                );
                Err(e)
            }
        };
        entry.write_done.notify_all();
        drop(state);

        self.overflow_after_store(&key);
        result
    }

    /// The blob just stored stays even if it alone exceeds capacity; it is the
    /// oldest candidate of the next pass.
    fn overflow_after_store(&self, stored: &CasKey) {
        if !self.config.manually_handle_overflow {
            self.evict_overflow(Some(stored));
        }
    }

    fn finish_write(&self, entry: &CasEntry, state: &mut CasEntryState, size: u64, content_size: u64) {
        state.size = size;
        state.content_size = content_size;
        state.exists = true;
        state.verified = true;
        state.disallowed = false;
        state.mapping = None;
        self.deferred.lock().remove(&entry.key);

        if state.dropped {
            // Dropped while the write was in flight.
            self.pending_deletes.lock().push(entry.key);
        } else {
            self.total_bytes.fetch_add(size, Ordering::AcqRel);
            self.touch(entry);
        }
    }

    /// Write the blob for `key` and return `(bytes on disk, content bytes)`.
    fn write_blob(&self, key: &CasKey, source: &BlobSource<'_>) -> Result<(u64, u64)> {
        let dest = self.blob_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if !key.is_compressed() {
            match source {
                BlobSource::Temp(path) => fs::rename(path, &dest)?,
                BlobSource::File(path) => self.write_via_temp(&dest, |file| {
                    let mut src = File::open(path)?;
                    io::copy(&mut src, file).map(|_| ())
                })?,
                BlobSource::Memory(data) => self.write_via_temp(&dest, |file| file.write_all(data))?,
            }
            let size = fs::metadata(&dest)?.len();
            return Ok((size, size));
        }

        let level = self.config.compression_level;
        let mut sizes = (0, 0);
        self.write_via_temp(&dest, |file| {
            let mut writer = BufWriter::new(file);
            sizes = match source {
                BlobSource::File(path) | BlobSource::Temp(path) => {
                    let mut src = File::open(path)?;
                    let content_size = src.metadata()?.len();
                    let written =
                        write_compressed(&self.slots, &mut src, content_size, &mut writer, self.compressor, level)?;
                    (written, content_size)
                }
                BlobSource::Memory(data) => {
                    let mut src: &[u8] = data;
                    let content_size = data.len() as u64;
                    let written =
                        write_compressed(&self.slots, &mut src, content_size, &mut writer, self.compressor, level)?;
                    (written, content_size)
                }
            };
            writer.flush()
        })?;

        if let BlobSource::Temp(path) = source {
            fs::remove_file(path).ok();
        }
        Ok(sizes)
    }

    /// Fill a fresh temp file through `fill`, then rename it to `dest`.
    fn write_via_temp<F>(&self, dest: &Path, fill: F) -> Result<()>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        let (temp, mut file) = self.create_temp_file()?;
        let result = fill(&mut file).and_then(|_| {
            drop(file);
            fs::rename(&temp, dest)
        });
        if let Err(e) = result {
            fs::remove_file(&temp).ok();
            return Err(e.into());
        }
        Ok(())
    }

    // ========================================================================
    // Retrieve
    // ========================================================================

    pub fn has_cas_file(&self, key: &CasKey) -> bool {
        let Some(entry) = self.lookup(key) else {
            return false;
        };
        let state = entry.state.lock();
        if state.dropped {
            return false;
        }
        state.exists || state.being_written || self.deferred.lock().contains_key(key)
    }

    /// Write the blob of a deferred creation now, if one is pending.
    pub fn ensure_cas_file(&self, key: &CasKey) -> Result<()> {
        let entry = self.lookup(key).ok_or(StorageError::NotFound { key: *key })?;
        self.materialize(&entry).map(|_| ())
    }

    /// Lock `entry` with its blob present on disk, resolving a deferred creation.
    fn materialize<'a>(&self, entry: &'a CasEntry) -> Result<MutexGuard<'a, CasEntryState>> {
        let key = entry.key;
        let mut state = entry.state.lock();
        entry.wait_for_writer(&mut state);
        if state.exists && !state.dropped {
            return Ok(state);
        }
        if state.dropped {
            return Err(StorageError::NotFound { key });
        }

        // Removing the record under the entry lock makes this the only resolver.
        let Some(deferred) = self.deferred.lock().remove(&key) else {
            return Err(StorageError::NotFound { key });
        };
        state.being_written = true;
        drop(state);

        let result = self
            .calculate_cas_key_for_file(&deferred.source, key.is_compressed())
            .and_then(|actual| {
                if actual == key {
                    self.write_blob(&key, &BlobSource::File(&deferred.source))
                } else {
                    Err(StorageError::HashMismatch { expected: key, actual })
                }
            });

        let mut state = entry.state.lock();
        state.being_written = false;
        let result = match result {
            Ok((size, content_size)) => {
                self.finish_write(entry, &mut state, size, content_size);
                Ok(())
            }
            Err(e) => {
                if let Some(file_name_key) = deferred.file_name_key {
                    self.invalidate_cached_file_info(file_name_key);
                }
                log_storage_error!(
                    "Deferred cas creation failed",
                    key = key.to_hex(),
                    source = deferred.source.display().to_string(),
                    hint = deferred.hint.as_str(),
                    error = e.to_string(),
                );
                Err(e)
            }
        };
        entry.write_done.notify_all();
        result?;

        if state.dropped {
            return Err(StorageError::NotFound { key });
        }
        Ok(state)
    }

    /// Mark a blob whose file vanished as gone and fix the accounting.
    fn forget_missing(&self, entry: &CasEntry, state: &mut CasEntryState) {
        if state.exists && !state.dropped {
            self.total_bytes.fetch_sub(state.size, Ordering::AcqRel);
        }
        state.exists = false;
        state.mapping = None;
        self.access_list.lock().unlink(entry.list_index);
    }

    /// Read-only view of the decompressed content of `key`.
    #[instrument(skip(self, hint), level = "debug")]
    pub fn retrieve_cas_file(&self, key: &CasKey, hint: &str) -> Result<CasView> {
        let entry = self.lookup(key).ok_or(StorageError::NotFound { key: *key })?;
        let mut state = self.materialize(&entry)?;
        if state.disallowed {
            return Err(StorageError::Disallowed { key: *key });
        }
        self.counters.retrieves.fetch_add(1, Ordering::Relaxed);

        if let Some(mapping) = &state.mapping {
            let mapping = Arc::clone(mapping);
            self.touch(&entry);
            return Ok(CasView {
                key: *key,
                mapping: Some(mapping),
            });
        }
        if state.content_size == 0 {
            self.touch(&entry);
            return Ok(CasView {
                key: *key,
                mapping: None,
            });
        }

        let path = self.blob_path(key);
        let mapped = if key.is_compressed() {
            MmapMut::map_anon(state.content_size as usize).and_then(|mut anon| {
                decompress_file_to_memory(&self.slots, &path, &mut anon)?;
                anon.make_read_only()
            })
        } else {
            // Safety: blobs are immutable once renamed into place.
            File::open(&path).and_then(|file| unsafe { Mmap::map(&file) })
        };

        let mapping = match mapped {
            Ok(mapping) => Arc::new(mapping),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.forget_missing(&entry, &mut state);
                log_storage_error!("Cas blob missing on disk", key = key.to_hex(), hint = hint);
                return Err(StorageError::MissingBlob { key: *key });
            }
            Err(e) => {
                log_storage_error!(
                    "Failed to map cas blob",
                    key = key.to_hex(),
                    hint = hint,
                    error = e.to_string(),
                );
                return Err(e.into());
            }
        };

        if state.keep_mapping || self.config.keep_mapping_in_memory {
            state.mapping = Some(Arc::clone(&mapping));
        }
        self.touch(&entry);
        Ok(CasView {
            key: *key,
            mapping: Some(mapping),
        })
    }

    /// Content size of a present blob, without mapping it.
    pub fn cas_file_size(&self, key: &CasKey) -> Option<u64> {
        let entry = self.lookup(key)?;
        let state = self.materialize(&entry).ok()?;
        Some(state.content_size)
    }

    // ========================================================================
    // Drop and eviction
    // ========================================================================

    /// Stop serving `key`. The file is deleted now only when `force_delete`
    /// is set and no write is in flight; otherwise by the next overflow pass.
    pub fn drop_cas_file(&self, key: &CasKey, force_delete: bool, hint: &str) -> Result<()> {
        let Some(entry) = self.lookup(key) else {
            return Ok(());
        };
        let released = {
            let mut state = entry.state.lock();
            let had_deferred = self.deferred.lock().remove(key).is_some();
            if state.dropped || !(state.exists || state.being_written || had_deferred) {
                return Ok(());
            }

            state.dropped = true;
            state.mapping = None;
            if !state.exists {
                self.access_list.lock().unlink(entry.list_index);
                true
            } else {
                self.total_bytes.fetch_sub(state.size, Ordering::AcqRel);
                log_storage_debug!("Dropped cas file", key = key.to_hex(), hint = hint, force = force_delete);

                if force_delete && !state.being_written {
                    self.delete_blob(key)?;
                    state.exists = false;
                    self.access_list.lock().unlink(entry.list_index);
                    true
                } else {
                    self.pending_deletes.lock().push(*key);
                    false
                }
            }
        };
        drop(entry);
        if released {
            self.reap(key);
        }
        Ok(())
    }

    /// Remove the entry of `key` once it backs no blob and nobody holds it.
    ///
    /// Callers must have let go of their own handle to the entry.
    fn reap(&self, key: &CasKey) {
        let mut table = self.cas_table.write();
        let Some(entry) = table.get(key) else {
            return;
        };
        // Handles are only cloned out of the table, so under the write lock
        // this count cannot grow.
        if Arc::strong_count(entry) > 1 {
            return;
        }
        {
            let state = entry.state.lock();
            if state.exists || state.being_written || self.deferred.lock().contains_key(key) {
                return;
            }
        }
        if let Some(entry) = table.remove(key) {
            self.access_list.lock().release(entry.list_index);
        }
    }

    fn delete_blob(&self, key: &CasKey) -> Result<()> {
        match fs::remove_file(self.blob_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn process_pending_deletes(&self) {
        let pending = std::mem::take(&mut *self.pending_deletes.lock());
        let mut deleted = Vec::new();
        for key in pending {
            let Some(entry) = self.lookup(&key) else {
                continue;
            };
            let mut state = entry.state.lock();
            if !state.dropped || !state.exists {
                continue;
            }
            if state.being_written {
                self.pending_deletes.lock().push(key);
                continue;
            }
            match self.delete_blob(&key) {
                Ok(()) => {
                    state.exists = false;
                    self.access_list.lock().unlink(entry.list_index);
                    deleted.push(key);
                }
                Err(e) => {
                    log_storage_warn!("Failed to delete dropped blob", key = key.to_hex(), error = e.to_string());
                    self.pending_deletes.lock().push(key);
                }
            }
        }
        for key in &deleted {
            self.reap(key);
        }
    }

    /// Bring live bytes back under capacity, oldest entries first.
    ///
    /// Returns the evicted keys, or with `manually_handle_overflow` the keys
    /// that would have to go, leaving them in place.
    pub fn handle_overflow(&self) -> Vec<CasKey> {
        self.evict_overflow(None)
    }

    fn evict_overflow(&self, keep: Option<&CasKey>) -> Vec<CasKey> {
        self.process_pending_deletes();

        let capacity = self.config.capacity;
        let mut projected = self.total_bytes();
        if capacity == 0 || projected <= capacity {
            return Vec::new();
        }

        let manual = self.config.manually_handle_overflow;
        let order = self.access_list.lock().snapshot();
        let mut selected = Vec::new();

        for key in order {
            if projected <= capacity {
                break;
            }
            if keep == Some(&key) {
                continue;
            }
            let Some(entry) = self.lookup(&key) else {
                continue;
            };
            let mut state = entry.state.lock();
            // Pending deferred creations are not `exists` yet, so they are skipped here too.
            if state.being_written || !state.exists || state.dropped {
                continue;
            }
            if manual {
                projected = projected.saturating_sub(state.size);
                selected.push(key);
                continue;
            }

            if let Err(e) = self.delete_blob(&key) {
                log_storage_warn!("Failed to evict blob", key = key.to_hex(), error = e.to_string());
                continue;
            }
            state.exists = false;
            state.verified = false;
            state.mapping = None;
            self.total_bytes.fetch_sub(state.size, Ordering::AcqRel);
            projected = projected.saturating_sub(state.size);
            self.access_list.lock().unlink(entry.list_index);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            selected.push(key);
        }

        if !manual && !selected.is_empty() {
            for key in &selected {
                self.reap(key);
            }
            log_storage_info!(
                "Evicted cas files",
                count = selected.len(),
                total_bytes = self.total_bytes(),
                capacity = capacity,
            );
        }
        selected
    }

    // ========================================================================
    // Integrity
    // ========================================================================

    /// Re-hash the stored content of `key`. A mismatch disallows the entry.
    pub fn check_cas_content(&self, key: &CasKey) -> Result<bool> {
        let entry = self.lookup(key).ok_or(StorageError::NotFound { key: *key })?;
        let content_size = {
            let mut state = entry.state.lock();
            entry.wait_for_writer(&mut state);
            if !state.exists || state.dropped {
                return Err(StorageError::NotFound { key: *key });
            }
            state.content_size
        };

        let path = self.blob_path(key);
        let actual = match self.hash_blob(&path, key.is_compressed(), content_size) {
            Ok(actual) => actual,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let mut state = entry.state.lock();
                self.forget_missing(&entry, &mut state);
                return Err(StorageError::MissingBlob { key: *key });
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof) => None,
            Err(e) => return Err(e.into()),
        };

        let mut state = entry.state.lock();
        if actual == Some(*key) {
            state.verified = true;
            return Ok(true);
        }
        if !state.disallowed {
            self.counters.corrupt.fetch_add(1, Ordering::Relaxed);
            log_storage_error!(
                "Cas content does not match its key",
                key = key.to_hex(),
                path = path.display().to_string(),
            );
        }
        state.verified = false;
        state.disallowed = true;
        Ok(false)
    }

    /// Key of the content at `path`; `None` for content too damaged to decode.
    fn hash_blob(&self, path: &Path, compressed: bool, content_size: u64) -> io::Result<Option<CasKey>> {
        if !compressed {
            let file = File::open(path)?;
            if file.metadata()?.len() == 0 {
                return Ok(Some(calculate_cas_key(&[], false)));
            }
            // Safety: read-only mapping of an immutable blob.
            let mapping = unsafe { Mmap::map(&file) }?;
            return Ok(Some(calculate_cas_key(&mapping, false)));
        }

        let header = read_compressed_header(path)?;
        if header.uncompressed_size != content_size {
            return Ok(None);
        }
        if content_size == 0 {
            return Ok(Some(calculate_cas_key(&[], true)));
        }
        let mut content = MmapMut::map_anon(content_size as usize)?;
        decompress_file_to_memory(&self.slots, path, &mut content)?;
        Ok(Some(calculate_cas_key(&content, true)))
    }

    /// Verify every stored blob in parallel.
    pub fn check_all_cas_files(self: &Arc<Self>, work_manager: &dyn WorkManager, delete_corrupt: bool) -> CheckReport {
        let keys: Vec<CasKey> = self
            .cas_table
            .read()
            .iter()
            .filter(|(_, entry)| {
                let state = entry.state.lock();
                state.exists && !state.dropped
            })
            .map(|(key, _)| *key)
            .collect();

        log_storage_info!("Checking cas files", count = keys.len(), delete_corrupt = delete_corrupt);

        let report = Arc::new(Mutex::new(CheckReport::default()));
        let storage = Arc::clone(self);
        let shared = Arc::clone(&report);
        parallel_for(
            work_manager,
            work_manager.worker_count(),
            keys,
            "CheckCasFiles",
            move |key| {
                let outcome = storage.check_cas_content(key);
                let mut report = shared.lock();
                match outcome {
                    Ok(true) => report.checked += 1,
                    Ok(false) => {
                        report.checked += 1;
                        report.corrupt += 1;
                        if delete_corrupt && storage.drop_cas_file(key, true, "check").is_ok() {
                            report.deleted += 1;
                        }
                    }
                    Err(StorageError::MissingBlob { .. }) => report.missing += 1,
                    Err(StorageError::NotFound { .. }) => {}
                    Err(e) => {
                        log_storage_warn!("Cas check failed", key = key.to_hex(), error = e.to_string());
                    }
                }
            },
        );

        let report = report.lock().clone();
        log_storage_info!(
            "Cas check finished",
            checked = report.checked,
            corrupt = report.corrupt,
            missing = report.missing,
        );
        report
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub fn stats(&self) -> StorageStats {
        let (cas_entries, live_entries) = {
            let table = self.cas_table.read();
            let live = table
                .values()
                .filter(|entry| {
                    let state = entry.state.lock();
                    state.exists && !state.dropped
                })
                .count();
            (table.len(), live)
        };
        StorageStats {
            cas_entries,
            live_entries,
            file_entries: self.file_table.len(),
            total_bytes: self.total_bytes(),
            capacity: self.config.capacity,
            hashed_files: self.counters.hashed_files.load(Ordering::Relaxed),
            hashed_bytes: self.counters.hashed_bytes.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            dedup_hits: self.counters.dedup_hits.load(Ordering::Relaxed),
            retrieves: self.counters.retrieves.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            corrupt: self.counters.corrupt.load(Ordering::Relaxed),
        }
    }

    /// Restore an entry found on disk. Used while opening.
    pub(crate) fn restore_entry(&self, key: CasKey, size: u64, content_size: u64) {
        let entry = self.entry(key);
        let mut state = entry.state.lock();
        if state.exists {
            return;
        }
        state.size = size;
        state.content_size = content_size;
        state.exists = true;
        self.total_bytes.fetch_add(size, Ordering::AcqRel);
        self.touch(&entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoard_config::testing::TestEnvironment;

    fn open(env: &TestEnvironment, capacity: u64) -> Storage {
        Storage::open(env.storage_config(capacity)).unwrap()
    }

    #[test]
    fn test_store_and_retrieve_from_memory() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);

        let key = storage.store_cas_file_from_memory(b"compiled object", "mem").unwrap();
        let view = storage.retrieve_cas_file(&key, "mem").unwrap();
        assert_eq!(&*view, b"compiled object");
        assert_eq!(storage.total_bytes(), 15);
    }

    #[test]
    fn test_compressed_store_and_retrieve() {
        let env = TestEnvironment::new().unwrap();
        let mut config = env.storage_config(0);
        config.store_compressed = true;
        config.buffer_slot_size = 1024;
        let storage = Storage::open(config).unwrap();

        let data = b"abcabcabc".repeat(2000);
        let key = storage.store_cas_file_from_memory(&data, "compressed").unwrap();
        assert!(key.is_compressed());
        assert!(storage.total_bytes() < data.len() as u64);

        let view = storage.retrieve_cas_file(&key, "compressed").unwrap();
        assert_eq!(&*view, &data[..]);
        assert!(storage.check_cas_content(&key).unwrap());
    }

    #[test]
    fn test_file_fast_path_skips_rehash() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let path = env.create_file("obj/main.o", b"main object").unwrap();
        let name_key = storage.string_key(&path);

        let first = storage.store_cas_file(name_key, &path, "main.o", false, false).unwrap();
        let hashed = storage.stats().hashed_files;
        let second = storage.store_cas_file(name_key, &path, "main.o", false, false).unwrap();

        assert_eq!(first, second);
        assert_eq!(storage.stats().hashed_files, hashed);
        assert_eq!(storage.stats().dedup_hits, 1);
    }

    #[test]
    fn test_verify_cached_info_never_hashes() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let name_key = StringKey::from_str_normalized("/src/a.o", false);
        let key = calculate_cas_key(b"a", false);
        storage.report_file_info_weak(name_key, key, 42, 1);

        assert_eq!(storage.verify_and_get_cached_file_info(name_key, 42, 1), Some(key));
        assert_eq!(storage.verify_and_get_cached_file_info(name_key, 42, 1), Some(key));
        assert!(storage.cached_file_info(name_key).unwrap().verified);
        assert_eq!(storage.stats().hashed_files, 0);

        assert_eq!(storage.verify_and_get_cached_file_info(name_key, 43, 1), None);
        storage.invalidate_cached_file_info(name_key);
        assert!(storage.cached_file_info(name_key).is_none());
    }

    #[test]
    fn test_report_file_write_updates_path_info() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let path = env.create_file("out.bin", b"v1").unwrap();
        let name_key = storage.string_key(&path);
        let v1 = storage.report_file_write(name_key, &path).unwrap();

        std::fs::write(&path, b"version two").unwrap();
        let v2 = storage.report_file_write(name_key, &path).unwrap();
        assert_ne!(v1, v2);
        assert_eq!(storage.cached_file_info(name_key).unwrap().cas_key, v2);
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 100);

        let a = storage.store_cas_file_from_memory(&[b'a'; 40], "a").unwrap();
        let b = storage.store_cas_file_from_memory(&[b'b'; 40], "b").unwrap();
        storage.retrieve_cas_file(&a, "touch a").unwrap();
        let c = storage.store_cas_file_from_memory(&[b'c'; 40], "c").unwrap();

        assert!(storage.has_cas_file(&a));
        assert!(!storage.has_cas_file(&b));
        assert!(storage.has_cas_file(&c));
        assert_eq!(storage.total_bytes(), 80);
        assert!(matches!(
            storage.retrieve_cas_file(&b, "evicted"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn test_manual_overflow_returns_candidates() {
        let env = TestEnvironment::new().unwrap();
        let mut config = env.storage_config(100);
        config.manually_handle_overflow = true;
        let storage = Storage::open(config).unwrap();

        let a = storage.store_cas_file_from_memory(&[1u8; 40], "a").unwrap();
        let b = storage.store_cas_file_from_memory(&[2u8; 40], "b").unwrap();
        let c = storage.store_cas_file_from_memory(&[3u8; 40], "c").unwrap();
        storage.retrieve_cas_file(&a, "touch").unwrap();

        assert_eq!(storage.total_bytes(), 120);
        assert_eq!(storage.handle_overflow(), vec![b]);
        assert!(storage.has_cas_file(&b));
        assert!(storage.has_cas_file(&c));
    }

    #[test]
    fn test_deferred_creation_resolved_on_retrieve() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let path = env.create_file("lazy.o", b"written later").unwrap();
        let name_key = storage.string_key(&path);

        let key = storage.store_cas_file(name_key, &path, "lazy", true, false).unwrap();
        assert!(storage.has_cas_file(&key));
        assert!(!storage.blob_path(&key).exists());
        assert_eq!(storage.total_bytes(), 0);

        let view = storage.retrieve_cas_file(&key, "lazy").unwrap();
        assert_eq!(&*view, b"written later");
        assert!(storage.blob_path(&key).exists());
        assert_eq!(storage.total_bytes(), 13);
    }

    #[test]
    fn test_deferred_source_changed_fails() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let path = env.create_file("lazy.o", b"original").unwrap();
        let name_key = storage.string_key(&path);
        let key = storage.store_cas_file(name_key, &path, "lazy", true, false).unwrap();

        std::fs::write(&path, b"modified!").unwrap();
        assert!(matches!(
            storage.ensure_cas_file(&key),
            Err(StorageError::HashMismatch { .. })
        ));
        assert!(storage.cached_file_info(name_key).is_none());
        assert!(matches!(
            storage.retrieve_cas_file(&key, "lazy"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn test_deferred_entry_not_evicted() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 50);
        let path = env.create_file("deferred.o", &[7u8; 30]).unwrap();
        let key = storage
            .store_cas_file(storage.string_key(&path), &path, "deferred", true, false)
            .unwrap();

        storage.store_cas_file_from_memory(&[8u8; 30], "x").unwrap();
        storage.store_cas_file_from_memory(&[9u8; 30], "y").unwrap();
        assert!(storage.has_cas_file(&key));
    }

    #[test]
    fn test_drop_force_and_deferred_delete() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let a = storage.store_cas_file_from_memory(b"aaaa", "a").unwrap();
        let b = storage.store_cas_file_from_memory(b"bbbbbb", "b").unwrap();

        storage.drop_cas_file(&a, true, "a").unwrap();
        assert!(!storage.blob_path(&a).exists());
        assert_eq!(storage.total_bytes(), 6);

        storage.drop_cas_file(&b, false, "b").unwrap();
        assert!(storage.blob_path(&b).exists());
        assert!(!storage.has_cas_file(&b));
        assert_eq!(storage.total_bytes(), 0);

        storage.handle_overflow();
        assert!(!storage.blob_path(&b).exists());
    }

    #[test]
    fn test_store_after_drop_reuses_blob() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let key = storage.store_cas_file_from_memory(b"again", "a").unwrap();
        storage.drop_cas_file(&key, false, "a").unwrap();
        storage.store_cas_file_from_memory(b"again", "a").unwrap();

        assert_eq!(storage.total_bytes(), 5);
        storage.handle_overflow();
        assert!(storage.blob_path(&key).exists());
    }

    #[test]
    fn test_corrupt_blob_disallowed() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let key = storage.store_cas_file_from_memory(b"pristine", "p").unwrap();
        std::fs::write(storage.blob_path(&key), b"tampered").unwrap();

        assert!(!storage.check_cas_content(&key).unwrap());
        assert!(matches!(
            storage.retrieve_cas_file(&key, "p"),
            Err(StorageError::Disallowed { .. })
        ));
        assert_eq!(storage.stats().corrupt, 1);
    }

    #[test]
    fn test_missing_blob_fixes_accounting() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let key = storage.store_cas_file_from_memory(b"gone soon", "g").unwrap();
        std::fs::remove_file(storage.blob_path(&key)).unwrap();

        assert!(matches!(
            storage.retrieve_cas_file(&key, "g"),
            Err(StorageError::MissingBlob { .. })
        ));
        assert_eq!(storage.total_bytes(), 0);
    }

    #[test]
    fn test_import_rejects_wrong_key() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let (temp, mut file) = storage.create_temp_file().unwrap();
        file.write_all(b"received").unwrap();
        drop(file);

        let wrong = calculate_cas_key(b"something else", false);
        assert!(matches!(
            storage.import_cas_file(wrong, &temp, "net"),
            Err(StorageError::HashMismatch { .. })
        ));
        assert!(!temp.exists());

        let (temp, mut file) = storage.create_temp_file().unwrap();
        file.write_all(b"received").unwrap();
        drop(file);
        let key = calculate_cas_key(b"received", false);
        assert_eq!(storage.import_cas_file(key, &temp, "net").unwrap(), key);
        assert_eq!(&*storage.retrieve_cas_file(&key, "net").unwrap(), b"received");
    }

    #[test]
    fn test_empty_content() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let key = storage.store_cas_file_from_memory(b"", "empty").unwrap();
        let view = storage.retrieve_cas_file(&key, "empty").unwrap();
        assert!(view.is_empty());
        assert!(storage.check_cas_content(&key).unwrap());
    }

    #[test]
    fn test_compressed_store_with_minimal_slot_pool() {
        let env = TestEnvironment::new().unwrap();
        let mut config = env.storage_config(0);
        config.store_compressed = true;
        config.buffer_slot_count = 1;
        config.buffer_slot_size = 512;
        let storage = Storage::open(config).unwrap();

        let data = b"slot pool of one ".repeat(100);
        let key = storage.store_cas_file_from_memory(&data, "one slot").unwrap();
        assert_eq!(&*storage.retrieve_cas_file(&key, "one slot").unwrap(), &data[..]);
    }

    #[test]
    fn test_second_open_of_root_is_refused() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let (temp, _file) = storage.create_temp_file().unwrap();

        assert!(matches!(
            Storage::open(env.storage_config(0)),
            Err(StorageError::Locked { .. })
        ));
        assert!(temp.exists());

        drop(storage);
        assert!(Storage::open(env.storage_config(0)).is_ok());
    }

    #[test]
    fn test_oversized_blob_survives_its_own_store() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 100);
        let small = storage.store_cas_file_from_memory(&[1u8; 40], "small").unwrap();

        let big = storage.store_cas_file_from_memory(&[2u8; 150], "big").unwrap();
        assert!(!storage.has_cas_file(&small));
        assert_eq!(storage.retrieve_cas_file(&big, "big").unwrap().len(), 150);
        assert_eq!(storage.total_bytes(), 150);

        let next = storage.store_cas_file_from_memory(&[3u8; 40], "next").unwrap();
        assert!(!storage.has_cas_file(&big));
        assert!(storage.has_cas_file(&next));
        assert_eq!(storage.total_bytes(), 40);
    }

    #[test]
    fn test_evicted_entries_are_forgotten() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 100);
        for i in 0..1000u32 {
            let mut data = [0u8; 40];
            data[..4].copy_from_slice(&i.to_le_bytes());
            storage.store_cas_file_from_memory(&data, "churn").unwrap();
        }

        let stats = storage.stats();
        assert_eq!(stats.live_entries, 2);
        assert_eq!(stats.cas_entries, 2);
        assert_eq!(stats.evictions, 998);
    }

    #[test]
    fn test_dropped_entries_are_forgotten() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let forced = storage.store_cas_file_from_memory(b"forced", "f").unwrap();
        let lazy = storage.store_cas_file_from_memory(b"lazy", "l").unwrap();

        storage.drop_cas_file(&forced, true, "f").unwrap();
        assert_eq!(storage.stats().cas_entries, 1);

        storage.drop_cas_file(&lazy, false, "l").unwrap();
        assert_eq!(storage.stats().cas_entries, 1);
        storage.handle_overflow();
        assert_eq!(storage.stats().cas_entries, 0);

        // Both keys can be stored again from scratch.
        storage.store_cas_file_from_memory(b"forced", "f").unwrap();
        assert_eq!(&*storage.retrieve_cas_file(&forced, "f").unwrap(), b"forced");
    }

    #[test]
    fn test_unknown_key_not_found() {
        let env = TestEnvironment::new().unwrap();
        let storage = open(&env, 0);
        let key = calculate_cas_key(b"never stored", false);
        assert!(!storage.has_cas_file(&key));
        assert!(matches!(
            storage.retrieve_cas_file(&key, "x"),
            Err(StorageError::NotFound { .. })
        ));
    }
}
