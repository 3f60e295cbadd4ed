//! Server side of the Storage service.
//!
//! Blobs travel uncompressed; the receiving [`Storage`] compresses them
//! according to the compression flag carried in the key. Transfers larger
//! than one segment are tracked by a 16-bit id owned by the connection that
//! started them, and are discarded if that connection goes away.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use hoard_cas::{CasKey, CasView, Storage};
use hoard_config::{log_daemon_debug, log_daemon_error, log_daemon_info, log_daemon_warn};
use hoard_net::protocol::PROTOCOL_VERSION;
use hoard_net::{BinaryReader, BinaryWriter, ConnectionId, MessageInfo, NetworkServer, ServiceId, StorageMessage};
use parking_lot::Mutex;

/// Hook id used for transfer cleanup on disconnect.
const DISCONNECT_HOOK_ID: u32 = 1;

/// `FetchBegin` size announcing that the key is unknown.
pub const FETCH_NOT_FOUND: u64 = u64::MAX;

struct ActiveStore {
    key: CasKey,
    size: u64,
    /// Bytes written so far; the next segment must start here.
    received: u64,
    temp_path: PathBuf,
    file: File,
    connection_id: ConnectionId,
}

struct ActiveFetch {
    view: CasView,
    connection_id: ConnectionId,
}

pub struct StorageServer {
    storage: Arc<Storage>,
    segment_size: usize,
    stores: Mutex<HashMap<u16, ActiveStore>>,
    fetches: Mutex<HashMap<u16, ActiveFetch>>,
    clients: Mutex<HashMap<ConnectionId, String>>,
    next_transfer_id: AtomicU16,
}

impl StorageServer {
    pub fn new(storage: Arc<Storage>, send_chunk_size: u32) -> Self {
        Self {
            storage,
            segment_size: send_chunk_size.max(1) as usize,
            stores: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            next_transfer_id: AtomicU16::new(1),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Install the Storage handler and the disconnect cleanup hook on `server`.
    pub fn register(self: &Arc<Self>, server: &NetworkServer) -> bool {
        let handler = Arc::clone(self);
        let registered = server.register_service(
            ServiceId::Storage as u8,
            move |info, reader, writer| handler.handle_message(info, reader, writer),
            StorageMessage::name_of,
        );
        if !registered {
            return false;
        }

        let hook = Arc::clone(self);
        server.register_on_client_disconnected(DISCONNECT_HOOK_ID, move |_, connection_id| {
            hook.connection_closed(connection_id)
        });
        true
    }

    pub fn unregister(&self, server: &NetworkServer) {
        server.unregister_service(ServiceId::Storage as u8);
        server.unregister_on_client_disconnected(DISCONNECT_HOOK_ID);
    }

    pub fn active_stores(&self) -> usize {
        self.stores.lock().len()
    }

    pub fn active_fetches(&self) -> usize {
        self.fetches.lock().len()
    }

    fn next_id(&self) -> u16 {
        loop {
            let id = self.next_transfer_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn handle_message(&self, info: &MessageInfo, reader: &mut BinaryReader<'_>, writer: &mut BinaryWriter) -> bool {
        let Some(message) = StorageMessage::from_u8(info.message_type) else {
            log_daemon_warn!(
                "Unknown storage message",
                message_type = info.message_type,
                connection_id = info.connection_id,
            );
            return false;
        };

        let result = match message {
            StorageMessage::Connect => self.connect(info, reader, writer),
            StorageMessage::StoreBegin => self.store_begin(info, reader, writer),
            StorageMessage::StoreSegment => self.store_segment(info, reader),
            StorageMessage::StoreEnd => self.store_end(info, reader, writer),
            StorageMessage::FetchBegin => self.fetch_begin(info, reader, writer),
            StorageMessage::FetchSegment => self.fetch_segment(info, reader, writer),
            StorageMessage::FetchEnd => self.fetch_end(info, reader),
            StorageMessage::ExistsOnServer => self.exists(reader, writer),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                log_daemon_error!(
                    "Storage message failed",
                    message = message.name(),
                    connection_id = info.connection_id,
                    error = format!("{e:#}"),
                );
                false
            }
        }
    }

    fn connect(&self, info: &MessageInfo, reader: &mut BinaryReader<'_>, writer: &mut BinaryWriter) -> Result<()> {
        let name = reader.read_string()?;
        let version = reader.read_u32()?;
        let accepted = version == PROTOCOL_VERSION;
        if accepted {
            log_daemon_info!("Storage client connected", name = name.as_str(), connection_id = info.connection_id);
            self.clients.lock().insert(info.connection_id, name);
        } else {
            log_daemon_warn!("Storage client version mismatch", name = name.as_str(), version = version);
        }
        writer.write_u8(u8::from(accepted));
        Ok(())
    }

    // ========================================================================
    // Store
    // ========================================================================

    fn store_begin(&self, info: &MessageInfo, reader: &mut BinaryReader<'_>, writer: &mut BinaryWriter) -> Result<()> {
        let key = CasKey(reader.read_array()?);
        let size = reader.read_u64()?;
        let segment = reader.remaining();
        if segment.len() as u64 > size {
            bail!("first segment of {key} exceeds declared size {size}");
        }

        if self.storage.has_cas_file(&key) {
            log_daemon_debug!("Store skipped, already present", key = key.to_hex());
            writer.write_u16(0);
            return Ok(());
        }

        let (temp_path, mut file) = self.storage.create_temp_file()?;
        if let Err(e) = file.write_all(segment) {
            fs::remove_file(&temp_path).ok();
            return Err(e.into());
        }

        if segment.len() as u64 == size {
            drop(file);
            self.storage.import_cas_file(key, &temp_path, "network store")?;
            writer.write_u16(0);
            return Ok(());
        }

        let id = self.next_id();
        self.stores.lock().insert(
            id,
            ActiveStore {
                key,
                size,
                received: segment.len() as u64,
                temp_path,
                file,
                connection_id: info.connection_id,
            },
        );
        writer.write_u16(id);
        Ok(())
    }

    fn take_store(&self, id: u16, connection_id: ConnectionId) -> Result<ActiveStore> {
        let mut stores = self.stores.lock();
        match stores.get(&id) {
            Some(store) if store.connection_id == connection_id => stores.remove(&id).ok_or_else(|| anyhow!("store {id} vanished")),
            _ => Err(anyhow!("unknown store id {id}")),
        }
    }

    fn store_segment(&self, info: &MessageInfo, reader: &mut BinaryReader<'_>) -> Result<()> {
        let id = reader.read_u16()?;
        let offset = reader.read_u64()?;
        let bytes = reader.remaining();

        // The store is owned by this connection, whose messages arrive one at
        // a time, so it can be worked on outside the map lock.
        let mut store = self.take_store(id, info.connection_id)?;
        if offset != store.received {
            fs::remove_file(&store.temp_path).ok();
            bail!(
                "segment at {offset} of {} does not continue at {}",
                store.key,
                store.received
            );
        }
        if offset + bytes.len() as u64 > store.size {
            fs::remove_file(&store.temp_path).ok();
            bail!("segment at {offset} overruns store of {} bytes", store.size);
        }
        if let Err(e) = store.file.write_all(bytes) {
            fs::remove_file(&store.temp_path).ok();
            return Err(e.into());
        }

        store.received += bytes.len() as u64;
        self.stores.lock().insert(id, store);
        Ok(())
    }

    fn store_end(&self, info: &MessageInfo, reader: &mut BinaryReader<'_>, writer: &mut BinaryWriter) -> Result<()> {
        let id = reader.read_u16()?;
        let ActiveStore {
            key,
            size,
            received,
            temp_path,
            file,
            ..
        } = self.take_store(id, info.connection_id)?;
        drop(file);

        let ok = if received != size {
            log_daemon_warn!("Store ended incomplete", key = key.to_hex(), size = size, received = received);
            fs::remove_file(&temp_path).ok();
            false
        } else {
            match self.storage.import_cas_file(key, &temp_path, "network store") {
                Ok(_) => true,
                Err(e) => {
                    log_daemon_error!("Store rejected", key = key.to_hex(), error = e.to_string());
                    false
                }
            }
        };
        writer.write_u8(u8::from(ok));
        Ok(())
    }

    // ========================================================================
    // Fetch
    // ========================================================================

    fn fetch_begin(&self, info: &MessageInfo, reader: &mut BinaryReader<'_>, writer: &mut BinaryWriter) -> Result<()> {
        let key = CasKey(reader.read_array()?);
        let view = match self.storage.retrieve_cas_file(&key, "network fetch") {
            Ok(view) => view,
            Err(e) => {
                log_daemon_debug!("Fetch miss", key = key.to_hex(), reason = e.to_string());
                writer.write_u16(0).write_u64(FETCH_NOT_FOUND);
                return Ok(());
            }
        };

        let size = view.len();
        let first = size.min(self.segment_size);
        let id = if first == size { 0 } else { self.next_id() };
        writer.write_u16(id).write_u64(size as u64).write_bytes(&view[..first]);

        if id != 0 {
            self.fetches.lock().insert(
                id,
                ActiveFetch {
                    view,
                    connection_id: info.connection_id,
                },
            );
        }
        Ok(())
    }

    fn fetch_segment(&self, info: &MessageInfo, reader: &mut BinaryReader<'_>, writer: &mut BinaryWriter) -> Result<()> {
        let id = reader.read_u16()?;
        let offset = reader.read_u64()?;

        let fetches = self.fetches.lock();
        let fetch = fetches
            .get(&id)
            .filter(|fetch| fetch.connection_id == info.connection_id)
            .ok_or_else(|| anyhow!("unknown fetch id {id}"))?;
        let start = usize::try_from(offset)?;
        if start > fetch.view.len() {
            bail!("fetch offset {offset} past end of {} bytes", fetch.view.len());
        }
        let end = fetch.view.len().min(start + self.segment_size);
        writer.write_bytes(&fetch.view[start..end]);
        Ok(())
    }

    fn fetch_end(&self, info: &MessageInfo, reader: &mut BinaryReader<'_>) -> Result<()> {
        let id = reader.read_u16()?;
        let mut fetches = self.fetches.lock();
        if fetches.get(&id).is_some_and(|fetch| fetch.connection_id == info.connection_id) {
            fetches.remove(&id);
        }
        Ok(())
    }

    fn exists(&self, reader: &mut BinaryReader<'_>, writer: &mut BinaryWriter) -> Result<()> {
        let key = CasKey(reader.read_array()?);
        writer.write_u8(u8::from(self.storage.has_cas_file(&key)));
        Ok(())
    }

    fn connection_closed(&self, connection_id: ConnectionId) {
        let abandoned: Vec<ActiveStore> = {
            let mut stores = self.stores.lock();
            let ids: Vec<u16> = stores
                .iter()
                .filter(|(_, store)| store.connection_id == connection_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| stores.remove(&id)).collect()
        };
        for store in &abandoned {
            fs::remove_file(&store.temp_path).ok();
        }
        self.fetches.lock().retain(|_, fetch| fetch.connection_id != connection_id);

        if let Some(name) = self.clients.lock().remove(&connection_id) {
            log_daemon_info!(
                "Storage client disconnected",
                name = name.as_str(),
                abandoned_stores = abandoned.len(),
            );
        }
    }
}
