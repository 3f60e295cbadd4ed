use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use hoard_net::protocol::MAX_FRAME_SIZE;
use hoard_net::{
    CacheMessage, CryptoKey, NetworkClient, NetworkError, NetworkServer, NetworkServerConfig, ServiceId,
    SessionMessage,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const CACHE: u8 = ServiceId::Cache as u8;

fn test_config() -> NetworkServerConfig {
    NetworkServerConfig {
        max_workers: 4,
        receive_timeout: Duration::from_secs(10),
        send_chunk_size: 64 * 1024,
        connect_retries: 2,
        max_frame_size: MAX_FRAME_SIZE,
    }
}

async fn listening(server: &NetworkServer, requires_crypto: bool) -> SocketAddr {
    assert!(server.start_listen(LOCALHOST, 0, requires_crypto).await);
    server.local_addr().unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn echo_server() -> NetworkServer {
    echo_server_with(test_config())
}

fn echo_server_with(config: NetworkServerConfig) -> NetworkServer {
    let server = NetworkServer::new(config).unwrap();
    assert!(server.register_service(
        CACHE,
        |_info, reader, writer| {
            let mut body = reader.remaining().to_vec();
            body.reverse();
            writer.write_bytes(&body);
            true
        },
        CacheMessage::name_of,
    ));
    server
}

#[tokio::test]
async fn request_reaches_registered_service() {
    let server = echo_server();
    let addr = listening(&server, false).await;

    let client = NetworkClient::connect(addr, None).await.unwrap();
    let reply = client
        .send_message(CACHE, CacheMessage::FetchEntries as u8, b"abc")
        .await
        .unwrap();
    assert_eq!(reply, b"cba");

    let stats = server.stats();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.clients, 1);
    assert_eq!(stats.protocol_errors, 0);
    assert!(stats.bytes_received > 0);

    server.shutdown().await;
}

#[tokio::test]
async fn duplicate_and_reserved_service_ids_are_refused() {
    let server = echo_server();
    assert!(!server.register_service(CACHE, |_, _, _| true, CacheMessage::name_of));
    assert!(!server.register_service(ServiceId::System as u8, |_, _, _| true, CacheMessage::name_of));
    assert!(!server.register_service(200, |_, _, _| true, CacheMessage::name_of));

    server.unregister_service(CACHE);
    assert!(server.register_service(CACHE, |_, _, _| true, CacheMessage::name_of));
}

#[tokio::test]
async fn unknown_service_closes_connection() {
    let server = echo_server();
    let addr = listening(&server, false).await;
    let client = NetworkClient::connect(addr, None).await.unwrap();

    let result = client
        .send_message(ServiceId::Session as u8, SessionMessage::Ping as u8, &[])
        .await;
    assert!(matches!(result, Err(NetworkError::Disconnected)));
    wait_until(|| server.stats().connections == 0).await;
    assert_eq!(server.stats().protocol_errors, 1);

    // The echo service is still there for new connections.
    let other = NetworkClient::connect(addr, None).await.unwrap();
    assert_eq!(other.send_message(CACHE, 0, b"xy").await.unwrap(), b"yx");
}

#[tokio::test]
async fn handler_can_reject_message() {
    let server = NetworkServer::new(test_config()).unwrap();
    server.register_service(
        CACHE,
        |info, _reader, _writer| info.message_type != CacheMessage::RequestShutdown as u8,
        CacheMessage::name_of,
    );
    let addr = listening(&server, false).await;
    let client = NetworkClient::connect(addr, None).await.unwrap();

    assert!(client.send_message(CACHE, CacheMessage::Connect as u8, &[]).await.is_ok());
    let rejected = client
        .send_message(CACHE, CacheMessage::RequestShutdown as u8, &[])
        .await;
    assert!(rejected.is_err());
    wait_until(|| !client.is_connected()).await;
}

#[tokio::test]
async fn deferred_response_sent_later() {
    let server = NetworkServer::new(test_config()).unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));
    {
        let parked = Arc::clone(&parked);
        server.register_service(
            CACHE,
            move |info, _reader, writer| {
                writer.write_bytes(b"discarded");
                info.defer_response();
                parked.lock().push(info.clone());
                true
            },
            CacheMessage::name_of,
        );
    }
    let addr = listening(&server, false).await;
    let client = Arc::new(NetworkClient::connect(addr, None).await.unwrap());

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send_message(CACHE, 3, &[]).await })
    };
    wait_until(|| parked.lock().len() == 1).await;

    let info = parked.lock().pop().unwrap();
    let responder = server.clone();
    std::thread::spawn(move || assert!(responder.send_response(&info, b"later")))
        .join()
        .unwrap();

    assert_eq!(pending.await.unwrap().unwrap(), b"later");
}

#[tokio::test]
async fn messages_on_one_connection_run_one_at_a_time() {
    let server = NetworkServer::new(test_config()).unwrap();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let (in_flight, overlap, order) = (Arc::clone(&in_flight), Arc::clone(&overlap), Arc::clone(&order));
        server.register_service(
            CACHE,
            move |info, _reader, _writer| {
                if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                order.lock().push(info.message_id);
                std::thread::sleep(Duration::from_millis(2));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                true
            },
            CacheMessage::name_of,
        );
    }
    let addr = listening(&server, false).await;
    let client = Arc::new(NetworkClient::connect(addr, None).await.unwrap());

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.send_message(CACHE, 1, &[]).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(overlap.load(Ordering::SeqCst), 0);
    let order = order.lock();
    assert_eq!(order.len(), 16);
    let mut sorted = order.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 16);
}

#[tokio::test]
async fn system_messages_update_client_state() {
    let server = echo_server();
    let addr = listening(&server, false).await;
    let client = NetworkClient::connect(addr, None).await.unwrap();

    client.keep_alive().await.unwrap();
    client.set_connection_count(4).await.unwrap();

    let uid = client.uid();
    wait_until(|| server.client_stats(uid).map_or(false, |s| s.bytes_sent > 0)).await;
    let stats = server.client_stats(uid).unwrap();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.requested_connections, 4);
    assert!(stats.bytes_received > 0);
    assert_eq!(client.server_uid(), server.uid());
}

#[tokio::test]
async fn encrypted_connection_with_registered_key() {
    let server = echo_server();
    let key = CryptoKey::generate().unwrap();
    server.register_crypto_key(key, SystemTime::now() + Duration::from_secs(3600));
    let addr = listening(&server, true).await;

    let client = NetworkClient::connect(addr, Some(key)).await.unwrap();
    assert_eq!(client.send_message(CACHE, 0, b"secret").await.unwrap(), b"terces");
    client.keep_alive().await.unwrap();
}

#[tokio::test]
async fn wrong_or_missing_key_is_rejected() {
    let server = echo_server();
    server.register_crypto_key(CryptoKey::new([1; 16]), SystemTime::now() + Duration::from_secs(3600));
    let addr = listening(&server, true).await;

    assert!(NetworkClient::connect(addr, Some(CryptoKey::new([2; 16]))).await.is_err());
    assert!(NetworkClient::connect(addr, None).await.is_err());
    wait_until(|| server.stats().protocol_errors >= 2).await;
    assert_eq!(server.stats().connections, 0);
}

#[tokio::test]
async fn expired_key_is_not_accepted() {
    let server = echo_server();
    let key = CryptoKey::new([3; 16]);
    server.register_crypto_key(key, SystemTime::now() - Duration::from_secs(1));
    let addr = listening(&server, true).await;

    assert!(NetworkClient::connect(addr, Some(key)).await.is_err());
}

#[tokio::test]
async fn hooks_fire_on_connect_and_disconnect() {
    let server = echo_server();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    {
        let tx = events_tx.clone();
        server.register_on_client_connected(1, move |uid, id| {
            tx.send(("connected", uid, id)).ok();
        });
    }
    server.register_on_client_disconnected(1, move |uid, id| {
        events_tx.send(("disconnected", uid, id)).ok();
    });
    let addr = listening(&server, false).await;

    let client = NetworkClient::connect(addr, None).await.unwrap();
    let uid = client.uid();
    let (kind, seen, connection) = events.recv().await.unwrap();
    assert_eq!((kind, seen), ("connected", uid));

    drop(client);
    let (kind, seen, closed) = events.recv().await.unwrap();
    assert_eq!((kind, seen, closed), ("disconnected", uid, connection));

    server.unregister_on_client_connected(1);
    let _again = NetworkClient::connect(addr, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn add_client_connects_two_servers() {
    let upstream = echo_server();
    let (tx, mut connected) = mpsc::unbounded_channel();
    upstream.register_on_client_connected(7, move |uid, _| {
        tx.send(uid).ok();
    });
    let addr = listening(&upstream, false).await;

    let downstream = NetworkServer::new(test_config()).unwrap();
    assert!(downstream.add_client(addr.ip(), addr.port(), None).await.is_some());
    assert_eq!(connected.recv().await.unwrap(), downstream.uid());

    wait_until(|| downstream.stats().connections == 1).await;
    assert!(downstream.client_stats(upstream.uid()).is_some());
}

#[tokio::test]
async fn add_client_gives_up_after_retries() {
    let listener = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let server = NetworkServer::new(test_config()).unwrap();
    assert!(server.add_client(LOCALHOST, port, None).await.is_none());
}

#[tokio::test]
async fn shutdown_refuses_new_clients_and_drains() {
    let server = echo_server();
    let addr = listening(&server, false).await;
    let client = NetworkClient::connect(addr, None).await.unwrap();

    server.disallow_new_clients();
    server.disconnect_clients().await;
    assert_eq!(server.stats().connections, 0);
    wait_until(|| !client.is_connected()).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(NetworkClient::connect(addr, None).await.is_err());
}

#[tokio::test]
async fn idle_client_is_dropped_after_receive_timeout() {
    let mut config = test_config();
    config.receive_timeout = Duration::from_secs(1);
    let server = echo_server_with(config);
    let addr = listening(&server, false).await;

    let client = NetworkClient::connect(addr, None).await.unwrap();
    assert_eq!(server.stats().connections, 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    wait_until(|| server.stats().connections == 0).await;
    wait_until(|| !client.is_connected()).await;
}

#[tokio::test]
async fn outbound_connection_outlives_receive_timeout() {
    let mut config = test_config();
    config.receive_timeout = Duration::from_secs(1);
    let upstream = echo_server_with(config.clone());
    let (tx, mut connected) = mpsc::unbounded_channel();
    upstream.register_on_client_connected(7, move |_, id| {
        tx.send(id).ok();
    });
    let addr = listening(&upstream, false).await;

    let downstream = NetworkServer::new(config).unwrap();
    assert!(downstream.register_service(
        CACHE,
        |_info, reader, writer| {
            writer.write_bytes(b"down:").write_bytes(reader.remaining());
            true
        },
        CacheMessage::name_of,
    ));
    let outbound = downstream.add_client(addr.ip(), addr.port(), None).await.unwrap();
    let accepted = connected.recv().await.unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(upstream.stats().connections, 1);
    assert_eq!(downstream.stats().connections, 1);

    // Requests flow both ways over the one connection.
    let reply = downstream
        .send_request(outbound, CACHE, CacheMessage::FetchEntries as u8, b"abc")
        .await
        .unwrap();
    assert_eq!(reply, b"cba");
    let reply = upstream
        .send_request(accepted, CACHE, CacheMessage::FetchEntries as u8, b"xyz")
        .await
        .unwrap();
    assert_eq!(reply, b"down:xyz");
}

#[tokio::test]
async fn request_on_closed_connection_fails() {
    let server = echo_server();
    assert!(matches!(
        server.send_request(42, CACHE, 0, b"nobody").await,
        Err(NetworkError::Disconnected)
    ));
}
