//! Cluster capabilities
//!
//! A [`Cluster`] knows how to open a connection to one member of a specific
//! backend product and how to ask a live member for the current member list.
//! The pool, sniffer and transport only ever talk to this trait.
//!
//! # Implementations
//!
//! - [`MemcacheCluster`]: memcached-style cache ring using the
//!   `config get cluster` topology command
//! - [`SearchCluster`]: search cluster exposing a `/_nodes/http` node-info API

pub mod memcache;
pub mod search;

use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::pool::{Connection, Endpoint};

pub use memcache::{parse_cluster_config, Item, MemcacheClient, MemcacheCluster};
pub use search::{parse_nodes_info, SearchClient, SearchCluster};

/// Which backend product a transport fronts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    #[default]
    Memcache,
    Search,
}

impl ClusterKind {
    /// Parse a kind name, falling back to memcache for unknown names
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "search" | "elasticsearch" => ClusterKind::Search,
            _ => ClusterKind::Memcache,
        }
    }
}

/// Capability implemented once per backend product
pub trait Cluster: Send + Sync + 'static {
    /// Client handle owned by each [`Connection`]
    type Client: Send + 'static;

    /// Identity under which an endpoint is pooled
    ///
    /// Seeds and discovered endpoints pass through this before they are
    /// compared, so two spellings of one member share a connection.
    fn canonical(&self, endpoint: &str) -> Endpoint {
        endpoint.to_string()
    }

    /// Open a connection and probe it before declaring success
    fn connect(&self, endpoint: &str) -> impl Future<Output = anyhow::Result<Self::Client>> + Send;

    /// Ask a live member for the cluster's endpoints
    ///
    /// Any failure yields an empty list; nothing is raised past this call.
    fn discover(
        &self,
        conn: &mut Connection<Self::Client>,
    ) -> impl Future<Output = Vec<Endpoint>> + Send;
}
