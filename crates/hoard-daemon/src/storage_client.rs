//! Client side of the Storage service.

use anyhow::{bail, Context, Result};
use hoard_cas::{calculate_cas_key, CasKey};
use hoard_config::DEFAULT_SEND_CHUNK_SIZE;
use hoard_net::protocol::PROTOCOL_VERSION;
use hoard_net::{BinaryReader, BinaryWriter, NetworkClient, ServiceId, StorageMessage};

use crate::storage_service::FETCH_NOT_FOUND;

const STORAGE: u8 = ServiceId::Storage as u8;

pub struct StorageClient {
    client: NetworkClient,
    segment_size: usize,
}

impl StorageClient {
    /// Announce `name` on the Storage service of an established connection.
    pub async fn connect(client: NetworkClient, name: &str) -> Result<Self> {
        let mut body = BinaryWriter::new();
        body.write_string(name).write_u32(PROTOCOL_VERSION);
        let reply = client
            .send_message(STORAGE, StorageMessage::Connect as u8, body.as_slice())
            .await
            .context("Storage connect failed")?;
        if BinaryReader::new(&reply).read_u8()? != 1 {
            bail!("Storage server refused protocol version {PROTOCOL_VERSION}");
        }
        Ok(Self {
            client,
            segment_size: DEFAULT_SEND_CHUNK_SIZE as usize,
        })
    }

    /// Largest payload put in one store message.
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size.max(1);
        self
    }

    pub fn network(&self) -> &NetworkClient {
        &self.client
    }

    async fn request(&self, message: StorageMessage, body: &[u8]) -> Result<Vec<u8>> {
        self.client
            .send_message(STORAGE, message as u8, body)
            .await
            .with_context(|| format!("Storage {} failed", message.name()))
    }

    pub async fn exists(&self, key: &CasKey) -> Result<bool> {
        let reply = self.request(StorageMessage::ExistsOnServer, key.as_bytes()).await?;
        Ok(BinaryReader::new(&reply).read_u8()? != 0)
    }

    /// Upload `data` under `key`. The server verifies the key before accepting.
    pub async fn store(&self, key: CasKey, data: &[u8]) -> Result<()> {
        let first = data.len().min(self.segment_size);
        let mut body = BinaryWriter::with_capacity(40 + first);
        body.write_bytes(key.as_bytes())
            .write_u64(data.len() as u64)
            .write_bytes(&data[..first]);
        let reply = self.request(StorageMessage::StoreBegin, body.as_slice()).await?;
        let id = BinaryReader::new(&reply).read_u16()?;
        if id == 0 {
            return Ok(());
        }

        let mut offset = first;
        while offset < data.len() {
            let end = data.len().min(offset + self.segment_size);
            body.clear();
            body.write_u16(id).write_u64(offset as u64).write_bytes(&data[offset..end]);
            self.request(StorageMessage::StoreSegment, body.as_slice()).await?;
            offset = end;
        }

        let reply = self.request(StorageMessage::StoreEnd, &id.to_le_bytes()).await?;
        if BinaryReader::new(&reply).read_u8()? != 1 {
            bail!("Server rejected store of {key}");
        }
        Ok(())
    }

    /// Hash `data` and upload it; returns the key it was stored under.
    pub async fn store_bytes(&self, data: &[u8], compressed: bool) -> Result<CasKey> {
        let key = calculate_cas_key(data, compressed);
        self.store(key, data).await?;
        Ok(key)
    }

    /// Download the content of `key`, or `None` if the server does not have it.
    pub async fn fetch(&self, key: &CasKey) -> Result<Option<Vec<u8>>> {
        let reply = self.request(StorageMessage::FetchBegin, key.as_bytes()).await?;
        let mut reader = BinaryReader::new(&reply);
        let id = reader.read_u16()?;
        let size = reader.read_u64()?;
        if size == FETCH_NOT_FOUND {
            return Ok(None);
        }

        let size = usize::try_from(size).context("Fetched blob does not fit in memory")?;
        let mut content = Vec::with_capacity(size);
        content.extend_from_slice(reader.remaining());

        let mut body = BinaryWriter::with_capacity(10);
        while content.len() < size {
            body.clear();
            body.write_u16(id).write_u64(content.len() as u64);
            let segment = self.request(StorageMessage::FetchSegment, body.as_slice()).await?;
            if segment.is_empty() {
                bail!("Fetch of {key} stalled at {} of {size} bytes", content.len());
            }
            content.extend_from_slice(&segment);
        }
        if id != 0 {
            self.request(StorageMessage::FetchEnd, &id.to_le_bytes()).await?;
        }

        if content.len() != size || calculate_cas_key(&content, key.is_compressed()) != *key {
            bail!("Fetched content does not match {key}");
        }
        Ok(Some(content))
    }
}
