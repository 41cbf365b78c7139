use anyhow::{Context, Result};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{ClusterKind, MemcacheClient, MemcacheCluster, SearchClient, SearchCluster};
use crate::config::Config;
use crate::pool::{Connection, Endpoint};
use crate::transport::{Transport, TransportStats, WorkError};

/// Transport for the configured cluster kind
#[derive(Clone)]
pub enum Backend {
    Memcache(Transport<MemcacheClient>),
    Search(Transport<SearchClient>),
}

/// A configuration bound to a running transport
///
/// Clones share the same transport worker.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    backend: Backend,
}

impl Core {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let timeout = Duration::from_secs(config.transport.connect_timeout);
        let transport_config = config.transport.clone();
        let seeds = &config.cluster.seeds;

        let backend = match config.cluster.kind {
            ClusterKind::Memcache => {
                let transport = Transport::start(MemcacheCluster::new(timeout), transport_config, seeds)
                    .await
                    .context("Failed to start memcache transport")?;
                Backend::Memcache(transport)
            }
            ClusterKind::Search => {
                let cluster = SearchCluster::new(timeout, config.cluster.insecure_tls)?;
                let transport = Transport::start(cluster, transport_config, seeds)
                    .await
                    .context("Failed to start search transport")?;
                Backend::Search(transport)
            }
        };

        Ok(Self {
            config: Arc::new(config),
            backend,
        })
    }

    pub fn kind(&self) -> ClusterKind {
        match self.backend {
            Backend::Memcache(_) => ClusterKind::Memcache,
            Backend::Search(_) => ClusterKind::Search,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// The memcache transport, or an error for other cluster kinds
    pub fn memcache(&self) -> Result<&Transport<MemcacheClient>> {
        match &self.backend {
            Backend::Memcache(transport) => Ok(transport),
            Backend::Search(_) => anyhow::bail!("This command requires a memcache cluster"),
        }
    }

    pub async fn stats(&self) -> Result<TransportStats> {
        let stats = match &self.backend {
            Backend::Memcache(transport) => transport.stats().await?,
            Backend::Search(transport) => transport.stats().await?,
        };
        Ok(stats)
    }

    /// Cluster topology as last discovered
    pub async fn endpoints(&self) -> Result<Vec<Endpoint>> {
        let endpoints = match &self.backend {
            Backend::Memcache(transport) => transport.sniffed().await?,
            Backend::Search(transport) => transport.sniffed().await?,
        };
        Ok(endpoints)
    }

    /// Round-trip one liveness request through the transport
    ///
    /// Returns the answering endpoint and what it reported about itself.
    pub async fn ping(&self) -> Result<(Endpoint, String)> {
        let answer = match &self.backend {
            Backend::Memcache(transport) => {
                transport
                    .request(|conn: &mut Connection<MemcacheClient>| {
                        async move {
                            let version = conn.client_mut().version().await?;
                            Ok::<_, WorkError>((conn.endpoint().to_string(), format!("memcached {}", version)))
                        }
                        .boxed()
                    })
                    .await?
            }
            Backend::Search(transport) => {
                transport
                    .request(|conn: &mut Connection<SearchClient>| {
                        async move {
                            let root = conn.client().ping().await?;
                            let name = root["name"].as_str().unwrap_or("unknown");
                            let version = root["version"]["number"].as_str().unwrap_or("unknown");
                            Ok::<_, WorkError>((conn.endpoint().to_string(), format!("{} ({})", name, version)))
                        }
                        .boxed()
                    })
                    .await?
            }
        };
        Ok(answer)
    }

    pub async fn shutdown(&self) -> Result<()> {
        match &self.backend {
            Backend::Memcache(transport) => transport.shutdown().await?,
            Backend::Search(transport) => transport.shutdown().await?,
        }
        Ok(())
    }
}
