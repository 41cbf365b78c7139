//! Search cluster capability
//!
//! Nodes are plain HTTP(S) endpoints. A connection is a base URL bound to a
//! shared hyper client; topology comes from `GET /_nodes/http`.
//!
//! HTTP settings:
//! - HTTP/1.1 only
//! - TCP_NODELAY and TCP keep-alive on the connector
//! - native-tls (OpenSSL) for TLS

use anyhow::Context;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io;
use std::time::Duration;
use tracing::debug;

use super::Cluster;
use crate::pool::{Connection, Endpoint};
use crate::transport::WorkError;

type HttpClient = HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Node-info API path used for discovery
pub const NODES_INFO_PATH: &str = "/_nodes/http";

/// Handle to one search node
///
/// Clone is cheap - the underlying HTTP client uses Arc internally.
#[derive(Clone)]
pub struct SearchClient {
    /// Base URL without a trailing slash
    base: String,
    scheme: String,
    http: HttpClient,
    timeout: Duration,
}

impl std::fmt::Debug for SearchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchClient")
            .field("base", &self.base)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SearchClient {
    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// URL scheme this node was reached with
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// GET a path relative to the node's base URL
    ///
    /// Connect failures and timeouts are reported as network faults; any
    /// answered request returns its status and body.
    pub async fn get(&self, path: &str) -> Result<(StatusCode, Bytes), WorkError> {
        let url = format!("{}{}", self.base, path);

        match tokio::time::timeout(self.timeout, self.fetch(&url)).await {
            Ok(result) => result,
            Err(_) => Err(WorkError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out after {:?}", url, self.timeout),
            ))),
        }
    }

    /// GET a path and decode a 2xx JSON body
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value, WorkError> {
        let (status, body) = self.get(path).await?;
        if !status.is_success() {
            return Err(WorkError::Protocol(format!(
                "{}{} answered {}",
                self.base, path, status
            )));
        }

        serde_json::from_slice(&body)
            .map_err(|e| WorkError::Protocol(format!("Invalid JSON from {}{}: {}", self.base, path, e)))
    }

    /// Root document of the node (name, cluster name, version)
    pub async fn ping(&self) -> Result<serde_json::Value, WorkError> {
        self.get_json("/").await
    }

    async fn fetch(&self, url: &str) -> Result<(StatusCode, Bytes), WorkError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .header("accept", "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| WorkError::Protocol(format!("Request build error: {}", e)))?;

        let response = match self.http.request(request).await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                return Err(WorkError::ConnectionRefused(format!("{}: {}", url, e)));
            }
            Err(e) => {
                return Err(WorkError::Other(
                    anyhow::Error::new(e).context(format!("Request to {} failed", url)),
                ));
            }
        };

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| WorkError::Io(io::Error::new(io::ErrorKind::ConnectionReset, e)))?
            .to_bytes();

        Ok((status, body))
    }
}

/// Search cluster capability
#[derive(Clone)]
pub struct SearchCluster {
    http: HttpClient,
    timeout: Duration,
}

impl SearchCluster {
    /// Build the shared HTTP client
    pub fn new(timeout: Duration, insecure_tls: bool) -> anyhow::Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(timeout));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if insecure_tls {
            tracing::warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            TlsConnector::new()
        }
        .context("Failed to build TLS connector")?;

        let https = HttpsConnector::from((http, tls.into()));

        let http = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .set_host(true)
            .build(https);

        Ok(Self { http, timeout })
    }

    fn client_for(&self, endpoint: &str) -> anyhow::Result<SearchClient> {
        let (base, scheme) = base_url(endpoint)?;

        Ok(SearchClient {
            base,
            scheme,
            http: self.http.clone(),
            timeout: self.timeout,
        })
    }
}

/// Base URL and scheme of a node: `http://` is assumed, trailing slashes dropped
fn base_url(endpoint: &str) -> anyhow::Result<(String, String)> {
    let raw = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };
    let url = url::Url::parse(&raw).with_context(|| format!("Invalid search endpoint: {}", endpoint))?;

    Ok((raw.trim_end_matches('/').to_string(), url.scheme().to_string()))
}

impl Cluster for SearchCluster {
    type Client = SearchClient;

    fn canonical(&self, endpoint: &str) -> Endpoint {
        base_url(endpoint)
            .map(|(base, _)| base)
            .unwrap_or_else(|_| endpoint.to_string())
    }

    async fn connect(&self, endpoint: &str) -> anyhow::Result<SearchClient> {
        let client = self.client_for(endpoint)?;

        let (status, _) = client
            .get("/")
            .await
            .with_context(|| format!("Failed to reach search node at {}", endpoint))?;
        if !status.is_success() {
            anyhow::bail!("Search node at {} answered {}", endpoint, status);
        }

        debug!(endpoint = %client.base_url(), "Connected to search node");
        Ok(client)
    }

    async fn discover(&self, conn: &mut Connection<SearchClient>) -> Vec<Endpoint> {
        let reply = conn.client().get(NODES_INFO_PATH).await;
        match reply {
            Ok((status, body)) if status.is_success() => parse_nodes_info(conn.client().scheme(), &body),
            Ok((status, _)) => {
                debug!(endpoint = %conn.endpoint(), status = %status, "Node-info request rejected");
                Vec::new()
            }
            Err(e) => {
                debug!(endpoint = %conn.endpoint(), error = %e, "Node-info request failed");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct NodesInfo {
    #[serde(default)]
    nodes: BTreeMap<String, NodeInfo>,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    #[serde(default)]
    http_address: Option<String>,
    #[serde(default)]
    http: Option<NodeHttp>,
}

#[derive(Debug, Deserialize)]
struct NodeHttp {
    #[serde(default)]
    publish_address: Option<String>,
}

/// Extract node URLs from a `/_nodes/http` response body
///
/// Each node's `http.publish_address` (or legacy `http_address`) becomes
/// `scheme://host:port`. Nodes without an address are skipped; an
/// undecodable body yields an empty list.
pub fn parse_nodes_info(scheme: &str, body: &[u8]) -> Vec<Endpoint> {
    let info: NodesInfo = match serde_json::from_slice(body) {
        Ok(info) => info,
        Err(e) => {
            debug!(error = %e, "Undecodable node-info response");
            return Vec::new();
        }
    };

    info.nodes
        .values()
        .filter_map(|node| {
            node.http
                .as_ref()
                .and_then(|http| http.publish_address.as_deref())
                .or(node.http_address.as_deref())
        })
        .filter_map(normalize_address)
        .map(|addr| format!("{}://{}", scheme, addr))
        .collect()
}

/// `inet[/10.0.0.1:9200]` and `host/10.0.0.1:9200` both become `10.0.0.1:9200`
fn normalize_address(raw: &str) -> Option<&str> {
    let addr = raw
        .trim()
        .trim_start_matches("inet[")
        .trim_end_matches(']')
        .rsplit('/')
        .next()?;
    (!addr.is_empty()).then_some(addr)
}
