use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::pool::{ConnectionPool, Endpoint, PoolError};

/// Cached cluster topology
///
/// The sniffer is owned by the transport worker, so at most one discovery
/// runs at a time and callers waiting on it queue up in the worker's
/// mailbox.
#[derive(Debug)]
pub struct Sniffer {
    cached: Option<Vec<Endpoint>>,
    timeout: Duration,
    last_sniff: Option<Instant>,
    sniffs: u64,
}

impl Sniffer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cached: None,
            timeout,
            last_sniff: None,
            sniffs: 0,
        }
    }

    /// Last discovered endpoint list, if any
    pub fn cached(&self) -> Option<&[Endpoint]> {
        self.cached.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// When the last discovery call finished
    pub fn last_sniff(&self) -> Option<Instant> {
        self.last_sniff
    }

    /// Number of discovery calls made so far
    pub fn sniffs(&self) -> u64 {
        self.sniffs
    }

    /// Cached endpoints, or a fresh discovery when nothing is cached
    pub async fn sniffed<C: Cluster>(
        &mut self,
        cluster: &C,
        pool: &mut ConnectionPool<C::Client>,
    ) -> Result<Vec<Endpoint>, PoolError> {
        if let Some(cached) = &self.cached {
            return Ok(cached.clone());
        }
        self.refresh(cluster, pool).await
    }

    /// Unconditionally ask the cluster for its members
    ///
    /// The discovery call runs on a connection from the pool and is abandoned
    /// after the sniff timeout. A non-empty result replaces the cache; an
    /// empty one leaves it untouched and is returned as is.
    pub async fn refresh<C: Cluster>(
        &mut self,
        cluster: &C,
        pool: &mut ConnectionPool<C::Client>,
    ) -> Result<Vec<Endpoint>, PoolError> {
        let conn = pool.conn()?;
        let via = conn.endpoint().to_string();
        let started = Instant::now();

        let discovered = match tokio::time::timeout(self.timeout, cluster.discover(conn)).await {
            Ok(endpoints) => endpoints,
            Err(_) => {
                warn!(via = %via, timeout = ?self.timeout, "Discovery timed out");
                Vec::new()
            }
        };

        self.sniffs += 1;
        self.last_sniff = Some(Instant::now());

        if discovered.is_empty() {
            debug!(via = %via, "Discovery returned no endpoints, topology unchanged");
        } else {
            info!(
                via = %via,
                endpoints = discovered.len(),
                elapsed = ?started.elapsed(),
                "Discovered cluster topology"
            );
            self.cached = Some(discovered.clone());
        }

        Ok(discovered)
    }

    /// Drop the cache so the next [`sniffed`](Self::sniffed) goes to the network
    pub fn lost(&mut self) {
        if self.cached.take().is_some() {
            debug!("Topology cache invalidated");
        }
    }
}
