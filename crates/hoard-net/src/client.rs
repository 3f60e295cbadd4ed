//! Request/response client for a [`NetworkServer`](crate::NetworkServer).
//!
//! Requests may be issued concurrently from many tasks; responses are routed
//! back by message id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hoard_config::log_network_debug;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::crypto::{client_handshake, CryptoKey, FrameCipher};
use crate::protocol::{
    read_frame, write_frame, BinaryReader, BinaryWriter, MessageHeader, ServiceId, SystemMessage,
    HEADER_SIZE, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
use crate::server::ClientUid;
use crate::{NetworkError, Result};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

type Pending = Arc<Mutex<HashMap<u16, oneshot::Sender<Vec<u8>>>>>;

pub struct NetworkClient {
    uid: ClientUid,
    server_uid: ClientUid,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: Pending,
    next_message_id: AtomicU16,
    request_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl NetworkClient {
    /// Connect with a fresh identity.
    pub async fn connect(addr: SocketAddr, crypto_key: Option<CryptoKey>) -> Result<Self> {
        Self::connect_as(addr, crypto_key, ClientUid::generate()?).await
    }

    /// Connect presenting `uid`; several connections may share one uid.
    pub async fn connect_as(addr: SocketAddr, crypto_key: Option<CryptoKey>, uid: ClientUid) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let (mut sealer, mut opener) = match crypto_key {
            Some(key) => {
                let channel = client_handshake(&mut reader, &mut writer, &key).await?;
                (Some(channel.sealer), Some(channel.opener))
            }
            None => (None, None),
        };

        let mut body = BinaryWriter::with_capacity(20);
        body.write_bytes(&uid.0).write_u32(PROTOCOL_VERSION);
        let mut frame =
            MessageHeader::request(ServiceId::System as u8, SystemMessage::Connect as u8, 0).frame(body.as_slice());
        if let Some(sealer) = sealer.as_mut() {
            sealer.seal(&mut frame)?;
        }
        write_frame(&mut writer, &frame).await?;

        let mut reply = read_frame(&mut reader, MAX_FRAME_SIZE)
            .await?
            .ok_or(NetworkError::Disconnected)?;
        if let Some(opener) = opener.as_mut() {
            opener.open(&mut reply)?;
        }
        let header = MessageHeader::from_bytes(&reply)?;
        let mut answer = BinaryReader::new(&reply[HEADER_SIZE..]);
        if !header.is_response || answer.read_u8()? != 1 {
            return Err(NetworkError::Rejected);
        }
        let server_uid = ClientUid(answer.read_array()?);

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (outbound, frames) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, sealer, frames));
        let reader_task = tokio::spawn(read_loop(reader, opener, Arc::clone(&pending)));

        Ok(Self {
            uid,
            server_uid,
            outbound,
            pending,
            next_message_id: AtomicU16::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reader_task,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn uid(&self) -> ClientUid {
        self.uid
    }

    pub fn server_uid(&self) -> ClientUid {
        self.server_uid
    }

    pub fn is_connected(&self) -> bool {
        !self.reader_task.is_finished()
    }

    /// Send one request and wait for its response body.
    pub async fn send_message(&self, service_id: u8, message_type: u8, body: &[u8]) -> Result<Vec<u8>> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(message_id, tx);

        let frame = MessageHeader::request(service_id, message_type, message_id).frame(body);
        if self.outbound.send(frame).is_err() {
            self.pending.lock().remove(&message_id);
            return Err(NetworkError::Disconnected);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NetworkError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&message_id);
                Err(NetworkError::Timeout)
            }
        }
    }

    pub async fn keep_alive(&self) -> Result<()> {
        self.send_message(ServiceId::System as u8, SystemMessage::KeepAlive as u8, &[])
            .await
            .map(|_| ())
    }

    /// Tell the server how many connections this client intends to keep open.
    pub async fn set_connection_count(&self, count: u32) -> Result<()> {
        self.send_message(
            ServiceId::System as u8,
            SystemMessage::SetConnectionCount as u8,
            &count.to_le_bytes(),
        )
        .await
        .map(|_| ())
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        // The writer task drains queued frames and exits once `outbound` drops.
        self.reader_task.abort();
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut sealer: Option<FrameCipher>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(mut frame) = frames.recv().await {
        if let Some(sealer) = sealer.as_mut() {
            if sealer.seal(&mut frame).is_err() {
                break;
            }
        }
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
    writer.shutdown().await.ok();
}

async fn read_loop(mut reader: OwnedReadHalf, mut opener: Option<FrameCipher>, pending: Pending) {
    loop {
        let mut frame = match read_frame(&mut reader, MAX_FRAME_SIZE).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                log_network_debug!("Client receive failed", error = e.to_string());
                break;
            }
        };
        if let Some(opener) = opener.as_mut() {
            if opener.open(&mut frame).is_err() {
                break;
            }
        }
        let Ok(header) = MessageHeader::from_bytes(&frame) else {
            break;
        };
        if !header.is_response {
            log_network_debug!("Ignoring request from server", service = header.service_id);
            continue;
        }
        let waiter = pending.lock().remove(&header.message_id);
        if let Some(waiter) = waiter {
            waiter.send(frame.split_off(HEADER_SIZE)).ok();
        }
    }
    // Dropping the senders wakes every waiter with `Disconnected`.
    pending.lock().clear();
}
