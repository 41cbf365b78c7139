//! Memcached cache-ring capability
//!
//! Speaks the memcached text protocol over one TCP stream per connection,
//! redialed after any exchange that leaves it out of sync. Topology comes
//! from the `config get cluster` command, whose reply carries the member list
//! on its third line as space separated `host|ip|port` triples.

use anyhow::Context;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::Cluster;
use crate::pool::{Connection, Endpoint};
use crate::transport::WorkError;

/// Longest key memcached accepts
const MAX_KEY_LEN: usize = 250;

/// Upper bound on lines read for one `config get cluster` reply
const MAX_CONFIG_LINES: usize = 64;

/// Largest value accepted in a reply (memcached's default item size limit)
const MAX_VALUE_LEN: usize = 1024 * 1024;

/// A cached item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub value: Bytes,
    pub flags: u32,
    /// Expiration in seconds (0 = never)
    pub expiration: u32,
}

impl Item {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            flags: 0,
            expiration: 0,
        }
    }

    pub fn with_expiration(mut self, seconds: u32) -> Self {
        self.expiration = seconds;
        self
    }
}

type Stream = BufReader<TcpStream>;

/// Outcome of one request/reply exchange
///
/// The outer error means the stream no longer lines up with the server's
/// replies and must be dropped. The inner error is an error line the server
/// answered with; the stream stays usable.
type Reply<T> = Result<Result<T, WorkError>, WorkError>;

/// One text-protocol connection to a memcached node
///
/// A failed exchange drops the stream; the next call redials.
#[derive(Debug)]
pub struct MemcacheClient {
    endpoint: Endpoint,
    stream: Option<Stream>,
    io_timeout: Duration,
}

impl MemcacheClient {
    /// Open a TCP connection with keep-alive enabled
    pub async fn connect(endpoint: &str, timeout: Duration) -> io::Result<Self> {
        let stream = dial(endpoint, timeout).await?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            stream: Some(stream),
            io_timeout: timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether a stream is open right now
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Server version string
    pub async fn version(&mut self) -> Result<String, WorkError> {
        let deadline = self.io_timeout;
        let stream = self.stream().await?;
        let reply = with_deadline(deadline, version_exchange(stream)).await;
        self.settle(reply)
    }

    /// Fetch one item; `None` on a cache miss
    pub async fn get(&mut self, key: &str) -> Result<Option<Item>, WorkError> {
        validate_key(key)?;
        let deadline = self.io_timeout;
        let stream = self.stream().await?;
        let reply = with_deadline(deadline, get_exchange(stream, key)).await;
        self.settle(reply)
    }

    /// Store an item unconditionally
    pub async fn set(&mut self, item: &Item) -> Result<(), WorkError> {
        validate_key(&item.key)?;
        let deadline = self.io_timeout;
        let stream = self.stream().await?;
        let reply = with_deadline(deadline, set_exchange(stream, item)).await;
        self.settle(reply)
    }

    /// Delete an item; false when the key did not exist
    pub async fn delete(&mut self, key: &str) -> Result<bool, WorkError> {
        validate_key(key)?;
        let deadline = self.io_timeout;
        let stream = self.stream().await?;
        let reply = with_deadline(deadline, delete_exchange(stream, key)).await;
        self.settle(reply)
    }

    /// Raw reply lines of `config get cluster`, without the `END` terminator
    pub async fn cluster_config(&mut self) -> Result<Vec<String>, WorkError> {
        let deadline = self.io_timeout;
        let stream = self.stream().await?;
        let reply = with_deadline(deadline, cluster_config_exchange(stream)).await;
        self.settle(reply)
    }

    /// The open stream, redialing first if the last exchange dropped it
    async fn stream(&mut self) -> Result<&mut Stream, WorkError> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                debug!(endpoint = %self.endpoint, "Redialing memcached");
                dial(&self.endpoint, self.io_timeout)
                    .await
                    .map_err(|e| WorkError::ConnectionRefused(format!("{}: {}", self.endpoint, e)))?
            }
        };
        Ok(self.stream.insert(stream))
    }

    fn settle<T>(&mut self, reply: Reply<T>) -> Result<T, WorkError> {
        match reply {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "Dropping memcached stream");
                self.stream = None;
                Err(e)
            }
        }
    }
}

async fn dial(endpoint: &str, timeout: Duration) -> io::Result<Stream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "Connection timeout"))??;

    // Configure TCP keep-alive
    let socket = socket2::Socket::from(stream.into_std()?);
    socket.set_keepalive(true)?;
    let stream = TcpStream::from_std(socket.into())?;
    stream.set_nodelay(true)?;

    Ok(BufReader::new(stream))
}

async fn version_exchange(stream: &mut Stream) -> Reply<String> {
    send(stream, b"version\r\n").await?;
    let line = read_line(stream).await?;
    if let Some(e) = server_error(&line) {
        return Ok(Err(e));
    }

    match line.strip_prefix("VERSION ") {
        Some(version) => Ok(Ok(version.to_string())),
        None => Err(WorkError::Protocol(format!("Unexpected version reply: {}", line))),
    }
}

async fn get_exchange(stream: &mut Stream, key: &str) -> Reply<Option<Item>> {
    send(stream, format!("get {}\r\n", key).as_bytes()).await?;

    let mut found = None;
    loop {
        let line = read_line(stream).await?;
        if line == "END" {
            return Ok(Ok(found));
        }
        if let Some(e) = server_error(&line) {
            return Ok(Err(e));
        }

        let mut parts = line.split(' ');
        let (Some("VALUE"), Some(item_key), Some(flags), Some(len)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(WorkError::Protocol(format!("Unexpected get reply: {}", line)));
        };
        if item_key != key {
            return Err(WorkError::Protocol(format!(
                "Reply carries key {:?} for a get of {:?}",
                item_key, key
            )));
        }

        let flags: u32 = flags
            .parse()
            .map_err(|_| WorkError::Protocol(format!("Bad flags in: {}", line)))?;
        let len: usize = len
            .parse()
            .map_err(|_| WorkError::Protocol(format!("Bad length in: {}", line)))?;

        // Data block plus trailing CRLF
        let block = len
            .checked_add(2)
            .filter(|_| len <= MAX_VALUE_LEN)
            .ok_or_else(|| {
                WorkError::Protocol(format!("Value length {} exceeds {} bytes", len, MAX_VALUE_LEN))
            })?;
        let mut data = vec![0u8; block];
        stream.read_exact(&mut data).await?;
        if !data.ends_with(b"\r\n") {
            return Err(WorkError::Protocol(format!("Unterminated data block for {}", key)));
        }
        data.truncate(len);

        found = Some(Item {
            key: key.to_string(),
            value: Bytes::from(data),
            flags,
            expiration: 0,
        });
    }
}

async fn set_exchange(stream: &mut Stream, item: &Item) -> Reply<()> {
    let header = format!(
        "set {} {} {} {}\r\n",
        item.key,
        item.flags,
        item.expiration,
        item.value.len()
    );
    let mut payload = Vec::with_capacity(header.len() + item.value.len() + 2);
    payload.extend_from_slice(header.as_bytes());
    payload.extend_from_slice(&item.value);
    payload.extend_from_slice(b"\r\n");
    send(stream, &payload).await?;

    let line = read_line(stream).await?;
    if let Some(e) = server_error(&line) {
        return Ok(Err(e));
    }
    if line == "STORED" {
        Ok(Ok(()))
    } else {
        Err(WorkError::Protocol(format!("Unexpected set reply: {}", line)))
    }
}

async fn delete_exchange(stream: &mut Stream, key: &str) -> Reply<bool> {
    send(stream, format!("delete {}\r\n", key).as_bytes()).await?;

    let line = read_line(stream).await?;
    if let Some(e) = server_error(&line) {
        return Ok(Err(e));
    }
    match line.as_str() {
        "DELETED" => Ok(Ok(true)),
        "NOT_FOUND" => Ok(Ok(false)),
        _ => Err(WorkError::Protocol(format!("Unexpected delete reply: {}", line))),
    }
}

async fn cluster_config_exchange(stream: &mut Stream) -> Reply<Vec<String>> {
    send(stream, b"config get cluster\r\n").await?;

    let mut lines = Vec::new();
    loop {
        let line = read_line(stream).await?;
        if line == "END" {
            return Ok(Ok(lines));
        }
        if let Some(e) = server_error(&line) {
            return Ok(Err(e));
        }

        lines.push(line);
        if lines.len() > MAX_CONFIG_LINES {
            return Err(WorkError::Protocol("Cluster config reply too long".to_string()));
        }
    }
}

async fn send(stream: &mut Stream, payload: &[u8]) -> io::Result<()> {
    let stream = stream.get_mut();
    stream.write_all(payload).await?;
    stream.flush().await
}

async fn read_line(stream: &mut Stream) -> io::Result<String> {
    let mut line = String::new();
    let read = stream.read_line(&mut line).await?;
    if read == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Connection closed by server",
        ));
    }

    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(line)
}

async fn with_deadline<T>(deadline: Duration, fut: impl Future<Output = Reply<T>>) -> Reply<T> {
    tokio::time::timeout(deadline, fut).await.map_err(|_| {
        WorkError::Io(io::Error::new(io::ErrorKind::TimedOut, "Memcached reply timeout"))
    })?
}

/// Error reply lines; these end the reply
fn server_error(line: &str) -> Option<WorkError> {
    let is_error =
        line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR");
    is_error.then(|| WorkError::Protocol(line.to_string()))
}

fn validate_key(key: &str) -> Result<(), WorkError> {
    if key.is_empty()
        || key.len() > MAX_KEY_LEN
        || key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
    {
        return Err(WorkError::Protocol(format!("Invalid key: {:?}", key)));
    }
    Ok(())
}

/// Extract `host:port` endpoints from a `config get cluster` reply
///
/// The reply must have at least three lines; the third holds the members.
/// Anything malformed yields an empty list.
pub fn parse_cluster_config(lines: &[String]) -> Vec<Endpoint> {
    if lines.len() < 3 {
        return Vec::new();
    }

    let mut endpoints = Vec::new();
    for member in lines[2].split_whitespace() {
        let parts: Vec<&str> = member.split('|').collect();
        let [host, ip, port] = parts.as_slice() else {
            return Vec::new();
        };
        if port.parse::<u16>().is_err() {
            return Vec::new();
        }

        let host = if host.is_empty() { ip } else { host };
        if host.is_empty() {
            return Vec::new();
        }
        endpoints.push(format!("{}:{}", host, port));
    }

    endpoints
}

/// Memcached cluster capability
#[derive(Debug, Clone)]
pub struct MemcacheCluster {
    /// Connect and per-reply timeout
    timeout: Duration,
}

impl MemcacheCluster {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for MemcacheCluster {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Cluster for MemcacheCluster {
    type Client = MemcacheClient;

    async fn connect(&self, endpoint: &str) -> anyhow::Result<MemcacheClient> {
        let mut client = MemcacheClient::connect(endpoint, self.timeout)
            .await
            .with_context(|| format!("Failed to launch memcached at {}", endpoint))?;

        // Cheap liveness probe before handing the connection out
        let version = client
            .version()
            .await
            .with_context(|| format!("Failed to launch memcached at {}", endpoint))?;

        debug!(endpoint = %endpoint, version = %version, "Connected to memcached");
        Ok(client)
    }

    async fn discover(&self, conn: &mut Connection<MemcacheClient>) -> Vec<Endpoint> {
        let reply = conn.client_mut().cluster_config().await;
        match reply {
            Ok(lines) => {
                let endpoints = parse_cluster_config(&lines);
                if endpoints.is_empty() {
                    debug!(
                        endpoint = %conn.endpoint(),
                        lines = lines.len(),
                        "No topology in cluster config reply"
                    );
                }
                endpoints
            }
            Err(e) => {
                debug!(endpoint = %conn.endpoint(), error = %e, "Cluster config query failed");
                Vec::new()
            }
        }
    }
}
