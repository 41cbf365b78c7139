//! Integration tests for the memcached capability
//!
//! A small in-process memcached speaks the text protocol over real TCP
//! sockets; several instances can share one item store to act as a ring.

use clusterpool::cluster::{Item, MemcacheClient, MemcacheCluster};
use clusterpool::transport::{Transport, TransportError, WorkError};
use clusterpool::{Cluster, Connection, TransportConfig};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

type Store = Arc<Mutex<HashMap<String, (u32, Vec<u8>)>>>;

/// Per-node behavior shared between the test and the server tasks
#[derive(Default)]
struct NodeState {
    up: AtomicBool,
    accepted: AtomicUsize,
    /// `config get cluster` body; `None` for a server that does not know the command
    cluster_config: Mutex<Option<Vec<String>>>,
    /// Raw bytes sent in place of every `get` reply
    get_reply: Mutex<Option<Vec<u8>>>,
}

struct FakeMemcached {
    addr: String,
    state: Arc<NodeState>,
}

impl FakeMemcached {
    async fn spawn(store: Store) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(NodeState::default());
        state.up.store(true, Ordering::SeqCst);

        let server_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                server_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, Arc::clone(&store), Arc::clone(&server_state)));
            }
        });

        Self { addr, state }
    }

    fn set_cluster_config(&self, lines: &[&str]) {
        *self.state.cluster_config.lock().unwrap() = Some(lines.iter().map(|s| s.to_string()).collect());
    }

    fn answer_get_with(&self, raw: Option<&[u8]>) {
        *self.state.get_reply.lock().unwrap() = raw.map(|r| r.to_vec());
    }

    fn port(&self) -> &str {
        self.addr.rsplit(':').next().unwrap()
    }

    fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Drop every connection on its next command
    fn go_down(&self) {
        self.state.up.store(false, Ordering::SeqCst);
    }

    fn come_back(&self) {
        self.state.up.store(true, Ordering::SeqCst);
    }
}

async fn serve(socket: TcpStream, store: Store, state: Arc<NodeState>) {
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if !state.up.load(Ordering::SeqCst) {
            return;
        }

        let parts: Vec<&str> = line.trim_end().split(' ').collect();
        let reply: Vec<u8> = match parts.as_slice() {
            ["version"] => b"VERSION 1.6.21\r\n".to_vec(),
            ["get", key] => {
                let scripted = state.get_reply.lock().unwrap().clone();
                match scripted {
                    Some(raw) => raw,
                    None => {
                        let found = store.lock().unwrap().get(*key).cloned();
                        let mut reply = Vec::new();
                        if let Some((flags, data)) = found {
                            reply.extend_from_slice(format!("VALUE {} {} {}\r\n", key, flags, data.len()).as_bytes());
                            reply.extend_from_slice(&data);
                            reply.extend_from_slice(b"\r\n");
                        }
                        reply.extend_from_slice(b"END\r\n");
                        reply
                    }
                }
            }
            ["set", key, flags, _exptime, len] => {
                let len: usize = len.parse().unwrap();
                let mut data = vec![0u8; len + 2];
                if reader.read_exact(&mut data).await.is_err() {
                    return;
                }
                data.truncate(len);
                store
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), (flags.parse().unwrap(), data));
                b"STORED\r\n".to_vec()
            }
            ["delete", key] => match store.lock().unwrap().remove(*key) {
                Some(_) => b"DELETED\r\n".to_vec(),
                None => b"NOT_FOUND\r\n".to_vec(),
            },
            ["config", "get", "cluster"] => match state.cluster_config.lock().unwrap().clone() {
                Some(lines) => {
                    let mut reply = String::new();
                    for l in &lines {
                        reply.push_str(l);
                        reply.push_str("\r\n");
                    }
                    reply.push_str("END\r\n");
                    reply.into_bytes()
                }
                None => b"ERROR\r\n".to_vec(),
            },
            _ => b"ERROR\r\n".to_vec(),
        };

        if write.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn store() -> Store {
    Arc::new(Mutex::new(HashMap::new()))
}

fn cluster() -> MemcacheCluster {
    MemcacheCluster::new(Duration::from_secs(2))
}

#[tokio::test]
async fn test_connect_probes_version() {
    let server = FakeMemcached::spawn(store()).await;

    let mut client = cluster().connect(&server.addr).await.unwrap();
    assert_eq!(client.endpoint(), server.addr);
    assert_eq!(client.version().await.unwrap(), "1.6.21");
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = cluster().connect(&addr).await.unwrap_err();
    assert!(err.to_string().contains(&addr));
}

#[tokio::test]
async fn test_item_operations() {
    let server = FakeMemcached::spawn(store()).await;
    let mut client = MemcacheClient::connect(&server.addr, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(client.get("greeting").await.unwrap(), None);

    let mut item = Item::new("greeting", "hello\r\nworld");
    item.flags = 7;
    client.set(&item).await.unwrap();

    let fetched = client.get("greeting").await.unwrap().unwrap();
    assert_eq!(fetched.value, item.value);
    assert_eq!(fetched.flags, 7);

    assert!(client.delete("greeting").await.unwrap());
    assert!(!client.delete("greeting").await.unwrap());
    assert_eq!(client.get("greeting").await.unwrap(), None);
}

#[tokio::test]
async fn test_invalid_key_rejected_locally() {
    let server = FakeMemcached::spawn(store()).await;
    let mut client = MemcacheClient::connect(&server.addr, Duration::from_secs(2))
        .await
        .unwrap();

    let err = client.get("two words").await.unwrap_err();
    assert!(matches!(err, WorkError::Protocol(_)));
    assert!(!err.is_network());

    // Connection still usable
    assert!(client.version().await.is_ok());
}

#[tokio::test]
async fn test_closed_connection_is_network_fault() {
    let server = FakeMemcached::spawn(store()).await;
    let mut client = MemcacheClient::connect(&server.addr, Duration::from_secs(2))
        .await
        .unwrap();

    server.go_down();
    let err = client.version().await.unwrap_err();
    assert!(err.is_network());
}

#[tokio::test]
async fn test_client_redials_after_node_returns() {
    let server = FakeMemcached::spawn(store()).await;
    let mut client = MemcacheClient::connect(&server.addr, Duration::from_secs(2))
        .await
        .unwrap();

    server.go_down();
    assert!(client.version().await.unwrap_err().is_network());
    assert!(!client.is_connected());

    server.come_back();
    assert_eq!(client.version().await.unwrap(), "1.6.21");
    assert!(client.is_connected());
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn test_server_error_line_keeps_stream() {
    let server = FakeMemcached::spawn(store()).await;
    server.answer_get_with(Some(b"SERVER_ERROR out of memory\r\n"));
    let mut client = MemcacheClient::connect(&server.addr, Duration::from_secs(2))
        .await
        .unwrap();

    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, WorkError::Protocol(_)));
    assert!(client.is_connected());
    assert_eq!(client.version().await.unwrap(), "1.6.21");
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_reply_for_other_key_is_rejected() {
    let server = FakeMemcached::spawn(store()).await;
    server.answer_get_with(Some(b"VALUE other 0 1\r\nx\r\nEND\r\n"));
    let mut client = MemcacheClient::connect(&server.addr, Duration::from_secs(2))
        .await
        .unwrap();

    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, WorkError::Protocol(_)));
    assert!(!client.is_connected());

    // The unread remainder went with the old stream
    assert_eq!(client.version().await.unwrap(), "1.6.21");
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn test_oversized_value_length_is_rejected() {
    let server = FakeMemcached::spawn(store()).await;
    let mut client = MemcacheClient::connect(&server.addr, Duration::from_secs(2))
        .await
        .unwrap();

    server.answer_get_with(Some(b"VALUE k 0 18446744073709551615\r\n"));
    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, WorkError::Protocol(_)));
    assert!(!err.is_network());

    server.answer_get_with(Some(b"VALUE k 0 2097152\r\n"));
    assert!(matches!(client.get("k").await.unwrap_err(), WorkError::Protocol(_)));

    server.answer_get_with(None);
    client.set(&Item::new("k", "v")).await.unwrap();
    assert_eq!(&client.get("k").await.unwrap().unwrap().value[..], b"v");
}

#[tokio::test]
async fn test_discover_parses_cluster_config() {
    let server = FakeMemcached::spawn(store()).await;
    server.set_cluster_config(&[
        "CONFIG cluster 0 48",
        "12",
        "cache-1.internal|10.0.0.1|11211 |10.0.0.2|11212",
    ]);

    let cluster = cluster();
    let client = cluster.connect(&server.addr).await.unwrap();
    let mut conn = Connection::new(server.addr.clone(), client, Duration::from_secs(60));

    assert_eq!(
        cluster.discover(&mut conn).await,
        vec!["cache-1.internal:11211".to_string(), "10.0.0.2:11212".to_string()]
    );
}

#[tokio::test]
async fn test_discover_malformed_two_line_reply() {
    let server = FakeMemcached::spawn(store()).await;
    server.set_cluster_config(&["CONFIG cluster 0 2", "1"]);

    let cluster = cluster();
    let client = cluster.connect(&server.addr).await.unwrap();
    let mut conn = Connection::new(server.addr.clone(), client, Duration::from_secs(60));

    assert!(cluster.discover(&mut conn).await.is_empty());
}

#[tokio::test]
async fn test_discover_on_plain_memcached() {
    let server = FakeMemcached::spawn(store()).await;

    let cluster = cluster();
    let client = cluster.connect(&server.addr).await.unwrap();
    let mut conn = Connection::new(server.addr.clone(), client, Duration::from_secs(60));

    assert!(cluster.discover(&mut conn).await.is_empty());

    // The ERROR reply was consumed; the connection stays in sync
    assert_eq!(conn.client_mut().version().await.unwrap(), "1.6.21");
}

#[tokio::test]
async fn test_transport_fails_over_to_live_node() {
    let shared = store();
    let first = FakeMemcached::spawn(Arc::clone(&shared)).await;
    let second = FakeMemcached::spawn(Arc::clone(&shared)).await;

    let config = TransportConfig {
        discover: false,
        retry_on_failure: true,
        max_retries: 2,
        ..TransportConfig::default()
    };
    let transport = Transport::start(
        cluster(),
        config,
        &[first.addr.clone(), second.addr.clone()],
    )
    .await
    .unwrap();

    let set = transport.bind(|conn: &mut Connection<MemcacheClient>, item: Item| {
        async move { conn.client_mut().set(&item).await }.boxed()
    });
    let get = transport.bind(|conn: &mut Connection<MemcacheClient>, key: String| {
        async move { conn.client_mut().get(&key).await }.boxed()
    });

    set.call(Item::new("k", "v1")).await.unwrap();
    let item = get.call("k".to_string()).await.unwrap().unwrap();
    assert_eq!(&item.value[..], b"v1");

    first.go_down();
    for _ in 0..4 {
        let item = get.call("k".to_string()).await.unwrap().unwrap();
        assert_eq!(&item.value[..], b"v1");
    }

    let stats = transport.stats().await.unwrap();
    assert_eq!(stats.pool.dead, 1);
    assert!(stats.pool.connections[0].is_dead);
    assert_eq!(stats.pool.connections[0].endpoint, first.addr);
}

#[tokio::test]
async fn test_transport_without_retry_surfaces_network_fault() {
    let server = FakeMemcached::spawn(store()).await;
    let config = TransportConfig {
        discover: false,
        ..TransportConfig::default()
    };
    let transport = Transport::start(cluster(), config, &[server.addr.clone()])
        .await
        .unwrap();

    server.go_down();
    let err = transport
        .request(|conn: &mut Connection<MemcacheClient>| {
            async move { conn.client_mut().version().await }.boxed()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Failed { attempts: 1, .. }));
    assert!(err.work_error().is_some_and(WorkError::is_network));
}

#[tokio::test]
async fn test_transport_discovers_ring_members() {
    let shared = store();
    let seed = FakeMemcached::spawn(Arc::clone(&shared)).await;
    let member = FakeMemcached::spawn(Arc::clone(&shared)).await;

    let members = format!("|127.0.0.1|{} |127.0.0.1|{}", seed.port(), member.port());
    seed.set_cluster_config(&["CONFIG cluster 0 64", "3", &members]);

    let transport = Transport::start(cluster(), TransportConfig::default(), &[seed.addr.clone()])
        .await
        .unwrap();

    let stats = transport.stats().await.unwrap();
    let endpoints: Vec<String> = stats.pool.connections.iter().map(|c| c.endpoint.clone()).collect();
    assert_eq!(endpoints, vec![seed.addr.clone(), member.addr.clone()]);
    assert_eq!(stats.discovered, Some(endpoints.clone()));

    // Requests now rotate over both members (discovery itself consumed one pick)
    let mut answered = Vec::new();
    for _ in 0..2 {
        let endpoint = transport
            .request(|conn: &mut Connection<MemcacheClient>| {
                async move {
                    conn.client_mut().version().await?;
                    Ok::<_, WorkError>(conn.endpoint().to_string())
                }
                .boxed()
            })
            .await
            .unwrap();
        answered.push(endpoint);
    }
    answered.sort();
    let mut expected = endpoints;
    expected.sort();
    assert_eq!(answered, expected);
}

fn server_version(conn: &mut Connection<MemcacheClient>) -> BoxFuture<'_, Result<String, WorkError>> {
    async move { conn.client_mut().version().await }.boxed()
}

#[tokio::test]
async fn test_transport_recovers_when_node_returns() {
    let server = FakeMemcached::spawn(store()).await;
    let config = TransportConfig {
        discover: false,
        ..TransportConfig::default()
    };
    let transport = Transport::start(cluster(), config, &[server.addr.clone()])
        .await
        .unwrap();

    assert!(transport.request(server_version).await.is_ok());

    server.go_down();
    let err = transport.request(server_version).await.unwrap_err();
    assert!(matches!(err, TransportError::Failed { attempts: 1, .. }));
    assert_eq!(transport.stats().await.unwrap().pool.dead, 1);

    server.come_back();
    assert_eq!(transport.request(server_version).await.unwrap(), "1.6.21");

    let stats = transport.stats().await.unwrap();
    assert_eq!(stats.pool.dead, 0);
    assert_eq!(stats.pool.connections[0].failures, 0);
}

#[tokio::test]
async fn test_transport_survives_oversized_reply() {
    let server = FakeMemcached::spawn(store()).await;
    let config = TransportConfig {
        discover: false,
        max_retries: 1,
        ..TransportConfig::default()
    };
    let transport = Transport::start(cluster(), config, &[server.addr.clone()])
        .await
        .unwrap();
    let get = transport.bind(|conn: &mut Connection<MemcacheClient>, key: String| {
        async move { conn.client_mut().get(&key).await }.boxed()
    });

    server.answer_get_with(Some(b"VALUE k 0 18446744073709551615\r\n"));
    let err = get.call("k".to_string()).await.unwrap_err();
    assert!(matches!(err, TransportError::Failed { attempts: 2, .. }));
    assert!(matches!(err.work_error(), Some(WorkError::Protocol(_))));

    // Worker still running, connection still alive
    assert_eq!(transport.stats().await.unwrap().pool.dead, 0);

    server.answer_get_with(None);
    assert_eq!(get.call("k".to_string()).await.unwrap(), None);
}
