//! Multiplexed TCP server.
//!
//! Each connection runs a reader loop and a writer task. Requests are
//! dispatched to the handler registered for their service id, one at a time
//! per connection and in arrival order. Handlers run on the blocking pool
//! with a worker context borrowed from a bounded free list.
//!
//! The server can also be the requesting side: [`NetworkServer::send_request`]
//! works on accepted and outbound connections, and responses are matched by
//! connection and message id. Outbound connections send KeepAlive so that
//! neither end hits its receive timeout while idle.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use hoard_config::{log_network_debug, log_network_error, log_network_info, log_network_warn, NetworkConfig};
use parking_lot::{Mutex, RwLock};
use ring::rand::{SecureRandom, SystemRandom};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::crypto::{client_handshake, server_handshake, CryptoChannel, CryptoKey, FrameCipher};
use crate::protocol::{
    read_frame, write_frame, BinaryReader, BinaryWriter, MessageHeader, ServiceId, SystemMessage,
    HEADER_SIZE, MAX_FRAME_SIZE, MAX_SERVICES, PROTOCOL_VERSION,
};
use crate::{NetworkError, Result};

pub type ConnectionId = u32;

/// Stable identity of a peer, shared by all its connections.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClientUid(pub [u8; 16]);

impl ClientUid {
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 16];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| NetworkError::Crypto("random source unavailable"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ClientUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ClientUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientUid({})", self)
    }
}

/// Context of one request, handed to service handlers.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub connection_id: ConnectionId,
    pub client_uid: ClientUid,
    pub service_id: u8,
    pub message_type: u8,
    pub message_id: u16,
    deferred: Cell<bool>,
}

impl MessageInfo {
    /// The writer contents are discarded; the reply goes out later through
    /// [`NetworkServer::send_response`].
    pub fn defer_response(&self) {
        self.deferred.set(true);
    }

    pub fn is_response_deferred(&self) -> bool {
        self.deferred.get()
    }
}

/// Returns false to disconnect the sender.
pub type ServiceHandler = dyn Fn(&MessageInfo, &mut BinaryReader<'_>, &mut BinaryWriter) -> bool + Send + Sync;
pub type MessageNameFn = fn(u8) -> &'static str;
pub type ClientHook = dyn Fn(ClientUid, ConnectionId) + Send + Sync;

struct Service {
    handler: Arc<ServiceHandler>,
    name_fn: MessageNameFn,
}

#[derive(Debug, Clone)]
pub struct NetworkServerConfig {
    pub max_workers: usize,
    pub receive_timeout: Duration,
    pub send_chunk_size: u32,
    pub connect_retries: u32,
    pub max_frame_size: usize,
}

impl Default for NetworkServerConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for NetworkServerConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            max_workers: config.max_workers.max(1),
            receive_timeout: Duration::from_secs(config.receive_timeout_secs.max(1)),
            send_chunk_size: config.send_chunk_size,
            connect_retries: config.connect_retries,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub connections: usize,
    pub clients: usize,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub protocol_errors: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientStats {
    pub uid: String,
    pub connections: u32,
    pub requested_connections: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct ClientState {
    connections: u32,
    requested_connections: u32,
    bytes_sent: u64,
    bytes_received: u64,
}

struct ConnectionTask {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

struct Listener {
    addr: Option<SocketAddr>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct WorkerContext {
    writer: BinaryWriter,
}

#[derive(Default)]
struct Counters {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    protocol_errors: AtomicU64,
}

enum Role {
    Accepted { requires_crypto: bool },
    Outbound { crypto_key: Option<CryptoKey> },
}

struct ServerInner {
    config: NetworkServerConfig,
    uid: ClientUid,
    services: RwLock<[Option<Arc<Service>>; MAX_SERVICES]>,
    crypto_keys: Mutex<Vec<(CryptoKey, SystemTime)>>,
    connections: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Vec<u8>>>>,
    requests: Mutex<HashMap<(ConnectionId, u16), oneshot::Sender<Vec<u8>>>>,
    next_message_id: AtomicU32,
    tasks: Mutex<HashMap<ConnectionId, ConnectionTask>>,
    clients: Mutex<HashMap<ClientUid, ClientState>>,
    connected_hooks: RwLock<Vec<(u32, Arc<ClientHook>)>>,
    disconnected_hooks: RwLock<Vec<(u32, Arc<ClientHook>)>>,
    listeners: Mutex<Vec<Listener>>,
    allow_new_clients: AtomicBool,
    next_connection_id: AtomicU32,
    worker_contexts: Mutex<Vec<WorkerContext>>,
    worker_permits: Semaphore,
    counters: Counters,
}

/// Cheap to clone; all clones share one server.
#[derive(Clone)]
pub struct NetworkServer {
    inner: Arc<ServerInner>,
}

impl NetworkServer {
    pub fn new(config: NetworkServerConfig) -> Result<Self> {
        let workers = config.max_workers.max(1);
        Ok(Self {
            inner: Arc::new(ServerInner {
                uid: ClientUid::generate()?,
                services: RwLock::new(std::array::from_fn(|_| None)),
                crypto_keys: Mutex::new(Vec::new()),
                connections: Mutex::new(HashMap::new()),
                requests: Mutex::new(HashMap::new()),
                next_message_id: AtomicU32::new(1),
                tasks: Mutex::new(HashMap::new()),
                clients: Mutex::new(HashMap::new()),
                connected_hooks: RwLock::new(Vec::new()),
                disconnected_hooks: RwLock::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                allow_new_clients: AtomicBool::new(true),
                next_connection_id: AtomicU32::new(1),
                worker_contexts: Mutex::new(Vec::with_capacity(workers)),
                worker_permits: Semaphore::new(workers),
                counters: Counters::default(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &NetworkServerConfig {
        &self.inner.config
    }

    /// Identity this server presents on outbound connections.
    pub fn uid(&self) -> ClientUid {
        self.inner.uid
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Install the handler of `service_id`. Fails if the slot is taken or reserved.
    pub fn register_service<F>(&self, service_id: u8, handler: F, name_fn: MessageNameFn) -> bool
    where
        F: Fn(&MessageInfo, &mut BinaryReader<'_>, &mut BinaryWriter) -> bool + Send + Sync + 'static,
    {
        let index = service_id as usize;
        if service_id == ServiceId::System as u8 || index >= MAX_SERVICES {
            return false;
        }
        let mut services = self.inner.services.write();
        if services[index].is_some() {
            return false;
        }
        services[index] = Some(Arc::new(Service {
            handler: Arc::new(handler),
            name_fn,
        }));
        true
    }

    pub fn unregister_service(&self, service_id: u8) {
        if let Some(slot) = self.inner.services.write().get_mut(service_id as usize) {
            *slot = None;
        }
    }

    pub fn register_on_client_connected<F>(&self, id: u32, hook: F)
    where
        F: Fn(ClientUid, ConnectionId) + Send + Sync + 'static,
    {
        register_hook(&self.inner.connected_hooks, id, Arc::new(hook));
    }

    pub fn unregister_on_client_connected(&self, id: u32) {
        self.inner.connected_hooks.write().retain(|(hook_id, _)| *hook_id != id);
    }

    pub fn register_on_client_disconnected<F>(&self, id: u32, hook: F)
    where
        F: Fn(ClientUid, ConnectionId) + Send + Sync + 'static,
    {
        register_hook(&self.inner.disconnected_hooks, id, Arc::new(hook));
    }

    pub fn unregister_on_client_disconnected(&self, id: u32) {
        self.inner.disconnected_hooks.write().retain(|(hook_id, _)| *hook_id != id);
    }

    /// Accept handshakes with `key` until `expiration`. Several keys may be valid at once.
    pub fn register_crypto_key(&self, key: CryptoKey, expiration: SystemTime) {
        let mut keys = self.inner.crypto_keys.lock();
        keys.retain(|(existing, _)| *existing != key);
        keys.push((key, expiration));
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Bind and start accepting. Returns false if the address cannot be bound.
    pub async fn start_listen(&self, ip: IpAddr, port: u16, requires_crypto: bool) -> bool {
        let listener = match TcpListener::bind((ip, port)).await {
            Ok(listener) => listener,
            Err(e) => {
                log_network_error!("Failed to listen", ip = ip.to_string(), port = port, error = e.to_string());
                return false;
            }
        };
        let addr = listener.local_addr().ok();
        log_network_info!(
            "Listening",
            addr = addr.map(|a| a.to_string()).unwrap_or_default(),
            requires_crypto = requires_crypto,
        );

        let shutdown = Arc::new(Notify::new());
        let inner = Arc::clone(&self.inner);
        let stop = Arc::clone(&shutdown);
        let task = tokio::spawn(async move { inner.accept_loop(listener, requires_crypto, stop).await });
        self.inner.listeners.lock().push(Listener { addr, shutdown, task });
        true
    }

    /// Address of the first listener, useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listeners.lock().iter().find_map(|l| l.addr)
    }

    /// Open an outbound connection that is then served like an accepted one.
    ///
    /// The transport connect is retried `connect_retries` times. Returns the
    /// connection id once the peer accepted the System Connect.
    pub async fn add_client(&self, ip: IpAddr, port: u16, crypto_key: Option<CryptoKey>) -> Option<ConnectionId> {
        let attempts = self.inner.config.connect_retries + 1;
        for attempt in 1..=attempts {
            match TcpStream::connect((ip, port)).await {
                Ok(stream) => {
                    let (ready, established) = oneshot::channel();
                    Arc::clone(&self.inner).spawn_connection(stream, Role::Outbound { crypto_key }, Some(ready));
                    return match established.await {
                        Ok(id) => Some(id),
                        Err(_) => {
                            log_network_warn!("Outbound connection not established", ip = ip.to_string(), port = port);
                            None
                        }
                    };
                }
                Err(e) => {
                    log_network_warn!(
                        "Outbound connect failed",
                        ip = ip.to_string(),
                        port = port,
                        attempt = attempt,
                        error = e.to_string(),
                    );
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    }
                }
            }
        }
        None
    }

    /// Send a request on an established connection and wait for its response.
    ///
    /// Fails with `Timeout` after the receive timeout, or `Disconnected` if
    /// the connection closes first.
    pub async fn send_request(
        &self,
        connection_id: ConnectionId,
        service_id: u8,
        message_type: u8,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        let message_id = self.inner.next_message_id();
        let (tx, rx) = oneshot::channel();
        self.inner.requests.lock().insert((connection_id, message_id), tx);

        let frame = MessageHeader::request(service_id, message_type, message_id).frame(body);
        if !self.inner.send_frame(connection_id, frame) {
            self.inner.requests.lock().remove(&(connection_id, message_id));
            return Err(NetworkError::Disconnected);
        }

        match tokio::time::timeout(self.inner.config.receive_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NetworkError::Disconnected),
            Err(_) => {
                self.inner.requests.lock().remove(&(connection_id, message_id));
                Err(NetworkError::Timeout)
            }
        }
    }

    /// Reply to a request whose handler called [`MessageInfo::defer_response`].
    pub fn send_response(&self, info: &MessageInfo, body: &[u8]) -> bool {
        let header = MessageHeader {
            service_id: info.service_id,
            message_type: info.message_type,
            message_id: info.message_id,
            is_response: true,
        };
        self.inner.send_frame(info.connection_id, header.frame(body))
    }

    /// Stop accepting connections on every listener.
    pub fn disallow_new_clients(&self) {
        self.inner.allow_new_clients.store(false, Ordering::Release);
        for listener in self.inner.listeners.lock().iter() {
            listener.shutdown.notify_one();
        }
    }

    /// Signal every connection to close and wait for their tasks.
    pub async fn disconnect_clients(&self) {
        let tasks: Vec<ConnectionTask> = self.inner.tasks.lock().drain().map(|(_, task)| task).collect();
        for task in &tasks {
            task.shutdown.notify_one();
        }
        for task in tasks {
            task.handle.await.ok();
        }
    }

    /// Stop listening, drain all connections, and wait for the accept loops.
    pub async fn shutdown(&self) {
        self.disallow_new_clients();
        self.disconnect_clients().await;
        let listeners: Vec<Listener> = self.inner.listeners.lock().drain(..).collect();
        for listener in listeners {
            listener.task.await.ok();
        }
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub fn stats(&self) -> ServerStats {
        let counters = &self.inner.counters;
        ServerStats {
            connections: self.inner.connections.lock().len(),
            clients: self
                .inner
                .clients
                .lock()
                .values()
                .filter(|client| client.connections > 0)
                .count(),
            messages_received: counters.messages_received.load(Ordering::Relaxed),
            messages_sent: counters.messages_sent.load(Ordering::Relaxed),
            bytes_received: counters.bytes_received.load(Ordering::Relaxed),
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            protocol_errors: counters.protocol_errors.load(Ordering::Relaxed),
        }
    }

    pub fn client_stats(&self, uid: ClientUid) -> Option<ClientStats> {
        self.inner.clients.lock().get(&uid).map(|client| ClientStats {
            uid: uid.to_string(),
            connections: client.connections,
            requested_connections: client.requested_connections,
            bytes_sent: client.bytes_sent,
            bytes_received: client.bytes_received,
        })
    }
}

async fn keep_alive_loop(outbound: mpsc::UnboundedSender<Vec<u8>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let frame = MessageHeader::request(ServiceId::System as u8, SystemMessage::KeepAlive as u8, 0).frame(&[]);
        if outbound.send(frame).is_err() {
            break;
        }
    }
}

fn register_hook(hooks: &RwLock<Vec<(u32, Arc<ClientHook>)>>, id: u32, hook: Arc<ClientHook>) {
    let mut hooks = hooks.write();
    hooks.retain(|(hook_id, _)| *hook_id != id);
    hooks.push((id, hook));
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener, requires_crypto: bool, stop: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = stop.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if !self.allow_new_clients.load(Ordering::Acquire) {
                            log_network_debug!("Refusing connection", peer = peer.to_string());
                            continue;
                        }
                        Arc::clone(&self).spawn_connection(stream, Role::Accepted { requires_crypto }, None);
                    }
                    Err(e) => {
                        log_network_warn!("Accept failed", error = e.to_string());
                    }
                }
            }
        }
        log_network_debug!("Accept loop stopped");
    }

    fn spawn_connection(self: Arc<Self>, stream: TcpStream, role: Role, ready: Option<oneshot::Sender<ConnectionId>>) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);
        let inner = Arc::clone(&self);

        // The task removes itself from `tasks` when done; inserting under the
        // same lock keeps that removal from running first.
        let mut tasks = self.tasks.lock();
        let handle = tokio::spawn(async move { inner.run_connection(id, stream, role, ready, stop).await });
        tasks.insert(id, ConnectionTask { shutdown, handle });
    }

    /// Id for a request this side originates. Zero is left to KeepAlive.
    fn next_message_id(&self) -> u16 {
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed) as u16;
            if id != 0 {
                return id;
            }
        }
    }

    fn protocol_error(&self, connection_id: ConnectionId, reason: &str) {
        self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
        log_network_warn!("Protocol error", connection_id = connection_id, reason = reason);
    }

    fn valid_crypto_keys(&self) -> Vec<CryptoKey> {
        let now = SystemTime::now();
        self.crypto_keys
            .lock()
            .iter()
            .filter(|(_, expiration)| *expiration > now)
            .map(|(key, _)| *key)
            .collect()
    }

    fn send_frame(&self, connection_id: ConnectionId, frame: Vec<u8>) -> bool {
        let outbound = self
            .connections
            .lock()
            .get(&connection_id)
            .cloned();
        match outbound {
            Some(outbound) => {
                let sent = outbound.send(frame).is_ok();
                if sent {
                    self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                sent
            }
            None => false,
        }
    }

    fn record_transfer(&self, uid: ClientUid, sent: u64, received: u64) {
        self.counters.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.counters.bytes_received.fetch_add(received, Ordering::Relaxed);
        if let Some(client) = self.clients.lock().get_mut(&uid) {
            client.bytes_sent += sent;
            client.bytes_received += received;
        }
    }

    fn fire_hooks(hooks: &RwLock<Vec<(u32, Arc<ClientHook>)>>, uid: ClientUid, connection_id: ConnectionId) {
        let hooks: Vec<Arc<ClientHook>> = hooks.read().iter().map(|(_, hook)| Arc::clone(hook)).collect();
        for hook in hooks {
            hook(uid, connection_id);
        }
    }

    async fn run_connection(
        self: Arc<Self>,
        id: ConnectionId,
        stream: TcpStream,
        role: Role,
        ready: Option<oneshot::Sender<ConnectionId>>,
        stop: Arc<Notify>,
    ) {
        stream.set_nodelay(true).ok();
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let (mut reader, mut writer) = stream.into_split();

        let established = tokio::select! {
            _ = stop.notified() => None,
            result = tokio::time::timeout(
                self.config.receive_timeout,
                self.establish(&mut reader, &mut writer, &role),
            ) => match result {
                Ok(Ok(established)) => Some(established),
                Ok(Err(e)) => {
                    self.protocol_error(id, &e.to_string());
                    None
                }
                Err(_) => {
                    self.protocol_error(id, "handshake timed out");
                    None
                }
            },
        };
        let Some((uid, channel)) = established else {
            self.tasks.lock().remove(&id);
            return;
        };
        let (sealer, opener) = match channel {
            Some(channel) => (Some(channel.sealer), Some(channel.opener)),
            None => (None, None),
        };

        let (outbound, frames) = mpsc::unbounded_channel();
        self.connections.lock().insert(id, outbound.clone());
        self.clients.lock().entry(uid).or_default().connections += 1;
        log_network_info!("Client connected", connection_id = id, client = uid.to_string(), peer = peer);
        Self::fire_hooks(&self.connected_hooks, uid, id);
        if let Some(ready) = ready {
            ready.send(id).ok();
        }

        let writer_task = tokio::spawn(Arc::clone(&self).write_loop(writer, sealer, frames, uid));
        let keep_alive = match role {
            Role::Outbound { .. } => {
                let period = (self.config.receive_timeout / 3).max(Duration::from_millis(10));
                Some(tokio::spawn(keep_alive_loop(outbound.clone(), period)))
            }
            Role::Accepted { .. } => None,
        };
        let reason = self.read_loop(id, uid, &mut reader, opener, &outbound, &stop).await;

        self.connections.lock().remove(&id);
        // Dropping the senders wakes pending requests with `Disconnected`.
        self.requests.lock().retain(|(connection, _), _| *connection != id);
        if let Some(task) = keep_alive {
            task.abort();
            task.await.ok();
        }
        drop(outbound);
        writer_task.await.ok();

        if let Some(client) = self.clients.lock().get_mut(&uid) {
            client.connections = client.connections.saturating_sub(1);
        }
        Self::fire_hooks(&self.disconnected_hooks, uid, id);
        self.tasks.lock().remove(&id);
        log_network_info!("Client disconnected", connection_id = id, client = uid.to_string(), reason = reason);
    }

    /// Crypto handshake plus System Connect. Yields the peer identity.
    async fn establish(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        role: &Role,
    ) -> Result<(ClientUid, Option<CryptoChannel>)> {
        match role {
            Role::Accepted { requires_crypto } => {
                let mut channel = if *requires_crypto {
                    let keys = self.valid_crypto_keys();
                    if keys.is_empty() {
                        return Err(NetworkError::Crypto("no valid crypto key registered"));
                    }
                    Some(server_handshake(reader, writer, &keys).await?)
                } else {
                    None
                };

                let mut frame = read_frame(reader, self.config.max_frame_size)
                    .await?
                    .ok_or(NetworkError::Disconnected)?;
                if let Some(channel) = channel.as_mut() {
                    channel.opener.open(&mut frame)?;
                }
                let header = MessageHeader::from_bytes(&frame)?;
                if header.is_response
                    || header.service_id != ServiceId::System as u8
                    || header.message_type != SystemMessage::Connect as u8
                {
                    return Err(NetworkError::Protocol("expected system connect".into()));
                }
                let mut body = BinaryReader::new(&frame[HEADER_SIZE..]);
                let uid = ClientUid(body.read_array()?);
                let version = body.read_u32()?;
                let accepted = version == PROTOCOL_VERSION && self.allow_new_clients.load(Ordering::Acquire);

                let mut answer = BinaryWriter::with_capacity(17);
                answer.write_u8(u8::from(accepted)).write_bytes(&self.uid.0);
                let mut reply = header.response().frame(answer.as_slice());
                if let Some(channel) = channel.as_mut() {
                    channel.sealer.seal(&mut reply)?;
                }
                write_frame(writer, &reply).await?;
                if !accepted {
                    return Err(NetworkError::Rejected);
                }
                Ok((uid, channel))
            }
            Role::Outbound { crypto_key } => {
                let mut channel = match crypto_key {
                    Some(key) => Some(client_handshake(reader, writer, key).await?),
                    None => None,
                };

                let mut body = BinaryWriter::with_capacity(20);
                body.write_bytes(&self.uid.0).write_u32(PROTOCOL_VERSION);
                let header = MessageHeader::request(ServiceId::System as u8, SystemMessage::Connect as u8, 0);
                let mut frame = header.frame(body.as_slice());
                if let Some(channel) = channel.as_mut() {
                    channel.sealer.seal(&mut frame)?;
                }
                write_frame(writer, &frame).await?;

                let mut reply = read_frame(reader, self.config.max_frame_size)
                    .await?
                    .ok_or(NetworkError::Disconnected)?;
                if let Some(channel) = channel.as_mut() {
                    channel.opener.open(&mut reply)?;
                }
                let reply_header = MessageHeader::from_bytes(&reply)?;
                let mut body = BinaryReader::new(&reply[HEADER_SIZE..]);
                if !reply_header.is_response || body.read_u8()? != 1 {
                    return Err(NetworkError::Rejected);
                }
                let peer = ClientUid(body.read_array()?);
                Ok((peer, channel))
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut sealer: Option<FrameCipher>,
        mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
        uid: ClientUid,
    ) {
        while let Some(mut frame) = frames.recv().await {
            if let Some(sealer) = sealer.as_mut() {
                if sealer.seal(&mut frame).is_err() {
                    break;
                }
            }
            if let Err(e) = write_frame(&mut writer, &frame).await {
                log_network_debug!("Send failed", client = uid.to_string(), error = e.to_string());
                break;
            }
            self.record_transfer(uid, frame.len() as u64 + 4, 0);
        }
        writer.shutdown().await.ok();
    }

    async fn read_loop(
        &self,
        id: ConnectionId,
        uid: ClientUid,
        reader: &mut OwnedReadHalf,
        mut opener: Option<FrameCipher>,
        outbound: &mpsc::UnboundedSender<Vec<u8>>,
        stop: &Notify,
    ) -> &'static str {
        loop {
            let received = tokio::select! {
                _ = stop.notified() => return "shutdown",
                received = tokio::time::timeout(
                    self.config.receive_timeout,
                    read_frame(reader, self.config.max_frame_size),
                ) => received,
            };
            let mut frame = match received {
                Err(_) => return "receive timeout",
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => return "closed by peer",
                Ok(Err(e)) => {
                    log_network_debug!("Receive failed", connection_id = id, error = e.to_string());
                    return "transport error";
                }
            };
            self.record_transfer(uid, 0, frame.len() as u64 + 4);

            if let Some(opener) = opener.as_mut() {
                if opener.open(&mut frame).is_err() {
                    self.protocol_error(id, "frame failed authentication");
                    return "protocol error";
                }
            }
            let header = match MessageHeader::from_bytes(&frame) {
                Ok(header) => header,
                Err(_) => {
                    self.protocol_error(id, "short frame");
                    return "protocol error";
                }
            };
            self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

            if header.is_response {
                let waiter = self.requests.lock().remove(&(id, header.message_id));
                match waiter {
                    Some(waiter) => {
                        waiter.send(frame.split_off(HEADER_SIZE)).ok();
                    }
                    None if header.service_id == ServiceId::System as u8 => {}
                    None => {
                        log_network_debug!("Ignoring unsolicited response", connection_id = id);
                    }
                }
                continue;
            }
            let body = frame.split_off(HEADER_SIZE);
            let keep = if header.service_id == ServiceId::System as u8 {
                self.handle_system(id, uid, header, &body, outbound)
            } else {
                self.dispatch(id, uid, header, body, outbound).await
            };
            if !keep {
                return "protocol error";
            }
        }
    }

    fn handle_system(
        &self,
        id: ConnectionId,
        uid: ClientUid,
        header: MessageHeader,
        body: &[u8],
        outbound: &mpsc::UnboundedSender<Vec<u8>>,
    ) -> bool {
        match SystemMessage::from_u8(header.message_type) {
            Some(SystemMessage::KeepAlive) => {}
            Some(SystemMessage::SetConnectionCount) => {
                let Ok(count) = BinaryReader::new(body).read_u32() else {
                    self.protocol_error(id, "truncated SetConnectionCount");
                    return false;
                };
                if let Some(client) = self.clients.lock().get_mut(&uid) {
                    client.requested_connections = count;
                }
            }
            Some(SystemMessage::Connect) | None => {
                self.protocol_error(id, "unexpected system message");
                return false;
            }
        }
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        outbound.send(header.response().frame(&[])).is_ok()
    }

    async fn dispatch(
        &self,
        id: ConnectionId,
        uid: ClientUid,
        header: MessageHeader,
        body: Vec<u8>,
        outbound: &mpsc::UnboundedSender<Vec<u8>>,
    ) -> bool {
        let service = self.services.read()[header.service_id as usize].clone();
        let Some(service) = service else {
            self.protocol_error(id, "no handler registered for service");
            return false;
        };

        let Ok(_permit) = self.worker_permits.acquire().await else {
            return false;
        };
        let mut context = self.worker_contexts.lock().pop().unwrap_or_default();

        let info = MessageInfo {
            connection_id: id,
            client_uid: uid,
            service_id: header.service_id,
            message_type: header.message_type,
            message_id: header.message_id,
            deferred: Cell::new(false),
        };
        let handler = Arc::clone(&service.handler);
        let joined = tokio::task::spawn_blocking(move || {
            context.writer.clear();
            let mut reader = BinaryReader::new(&body);
            let keep = handler(&info, &mut reader, &mut context.writer);
            (keep, info.is_response_deferred(), context)
        })
        .await;

        let (keep, deferred, context) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                log_network_error!(
                    "Service handler panicked",
                    service = header.service_id,
                    message = (service.name_fn)(header.message_type),
                    error = e.to_string(),
                );
                return false;
            }
        };

        if keep && !deferred {
            let frame = header.response().frame(context.writer.as_slice());
            if outbound.send(frame).is_ok() {
                self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.worker_contexts.lock().push(context);

        if !keep {
            log_network_debug!(
                "Handler closed connection",
                connection_id = id,
                message = (service.name_fn)(header.message_type),
            );
        }
        keep
    }
}
