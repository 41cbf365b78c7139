//! The set of connections behind one logical transport
//!
//! Connections keep discovery order. Selection only ever considers the alive
//! subset; when nothing is alive the dead connection with the fewest failures
//! is tentatively resurrected first.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{Connection, Endpoint};
use crate::cluster::Cluster;
use crate::lb::{Algorithm, Selector};

/// Error types for connection pool operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The pool holds zero connections, alive or dead
    #[error("No connection available")]
    NoConnectionAvailable,
}

/// Snapshot of one connection's health
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub endpoint: Endpoint,
    pub failures: u32,
    pub is_dead: bool,
    /// How long the connection has been dead
    pub dead_for: Option<Duration>,
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub alive: usize,
    pub dead: usize,
    pub selector: Algorithm,
    pub connections: Vec<ConnectionStats>,
}

/// Outcome of a pool rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildStats {
    /// Existing connections kept with their health state
    pub retained: usize,
    /// Newly connected endpoints
    pub added: usize,
    /// Connections dropped because their endpoint disappeared
    pub removed: usize,
    /// Discovered endpoints that could not be connected
    pub unreachable: usize,
    /// Whether the new connection set replaced the old one
    pub committed: bool,
}

/// Ordered set of connections plus the selector that picks among them
pub struct ConnectionPool<Cl> {
    conns: Vec<Connection<Cl>>,
    selector: Box<dyn Selector<Connection<Cl>>>,
    backoff_base: Duration,
}

impl<Cl> ConnectionPool<Cl> {
    /// Create an empty pool using the given selection algorithm
    pub fn new(algorithm: Algorithm, backoff_base: Duration) -> Self {
        Self::with_selector(algorithm.build(), backoff_base)
    }

    /// Create an empty pool with a custom selector
    pub fn with_selector(selector: Box<dyn Selector<Connection<Cl>>>, backoff_base: Duration) -> Self {
        Self {
            conns: Vec::new(),
            selector,
            backoff_base,
        }
    }

    /// Append a connection, keeping insertion order
    pub fn push(&mut self, conn: Connection<Cl>) {
        self.conns.push(conn);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn connections(&self) -> &[Connection<Cl>] {
        &self.conns
    }

    pub fn get(&self, index: usize) -> Option<&Connection<Cl>> {
        self.conns.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Connection<Cl>> {
        self.conns.get_mut(index)
    }

    /// Endpoints in pool order
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.conns.iter().map(|c| c.endpoint().to_string()).collect()
    }

    /// Indices of alive connections, in pool order
    pub fn alives(&self) -> Vec<usize> {
        self.partition(false)
    }

    /// Indices of dead connections, in pool order
    pub fn deads(&self) -> Vec<usize> {
        self.partition(true)
    }

    fn partition(&self, dead: bool) -> Vec<usize> {
        self.conns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_dead() == dead)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn alive_count(&self) -> usize {
        self.conns.iter().filter(|c| !c.is_dead()).count()
    }

    pub fn dead_count(&self) -> usize {
        self.conns.iter().filter(|c| c.is_dead()).count()
    }

    pub fn selector_algorithm(&self) -> Algorithm {
        self.selector.algorithm()
    }

    /// Swap the selection strategy; health state is untouched
    pub fn set_selector(&mut self, selector: Box<dyn Selector<Connection<Cl>>>) {
        self.selector = selector;
    }

    /// Change the resurrection backoff unit for current and future connections
    pub fn set_backoff_base(&mut self, backoff_base: Duration) {
        self.backoff_base = backoff_base;
        for conn in &mut self.conns {
            conn.set_backoff_base(backoff_base);
        }
    }

    /// Pick a connection and return its index
    ///
    /// With no alive connection, the dead one with the fewest failures (first
    /// in pool order on ties) is marked alive and becomes the only candidate.
    pub fn checkout(&mut self) -> Result<usize, PoolError> {
        let mut alive = self.alives();

        if alive.is_empty() {
            let mut dead = self.deads();
            if dead.is_empty() {
                return Err(PoolError::NoConnectionAvailable);
            }

            // Stable sort: ties keep pool order
            dead.sort_by_key(|&idx| self.conns[idx].failures());
            let idx = dead[0];
            let conn = &mut self.conns[idx];
            conn.mark_alive();
            info!(
                endpoint = %conn.endpoint(),
                failures = conn.failures(),
                "No alive connections, tentatively resurrecting"
            );
            alive.push(idx);
        }

        let candidates: Vec<&Connection<Cl>> = alive.iter().map(|&idx| &self.conns[idx]).collect();
        let position = self.selector.select(&candidates);
        Ok(alive[position % alive.len()])
    }

    /// Pick a connection; see [`checkout`](Self::checkout)
    pub fn conn(&mut self) -> Result<&mut Connection<Cl>, PoolError> {
        let idx = self.checkout()?;
        Ok(&mut self.conns[idx])
    }

    /// Bring back every dead connection whose backoff has elapsed at `now`
    ///
    /// Returns the number of connections resurrected.
    pub fn resurrect_eligible(&mut self, now: Instant) -> usize {
        let mut resurrected = 0;
        for conn in self.conns.iter_mut().filter(|c| c.is_dead()) {
            if conn.resurrect(now) {
                debug!(
                    endpoint = %conn.endpoint(),
                    failures = conn.failures(),
                    "Resurrected connection after backoff"
                );
                resurrected += 1;
            }
        }
        resurrected
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let connections: Vec<ConnectionStats> = self
            .conns
            .iter()
            .map(|c| ConnectionStats {
                endpoint: c.endpoint().to_string(),
                failures: c.failures(),
                is_dead: c.is_dead(),
                dead_for: c.dead_since().map(|since| now.saturating_duration_since(since)),
            })
            .collect();

        let dead = connections.iter().filter(|c| c.is_dead).count();
        PoolStats {
            total: connections.len(),
            alive: connections.len() - dead,
            dead,
            selector: self.selector_algorithm(),
            connections,
        }
    }

    fn position(&self, endpoint: &str) -> Option<usize> {
        self.conns.iter().position(|c| c.endpoint() == endpoint)
    }

    /// Rebuild the connection set from a discovered endpoint list
    ///
    /// Endpoints already in the pool keep their connection and health state,
    /// new endpoints are connected through the cluster capability, and
    /// connections whose endpoint disappeared are dropped. The swap only
    /// happens if the result has at least one alive connection; otherwise
    /// the current pool stays exactly as it was.
    pub async fn rebuild<C>(
        &mut self,
        cluster: &C,
        endpoints: &[Endpoint],
        connect_timeout: Duration,
    ) -> RebuildStats
    where
        C: Cluster<Client = Cl>,
    {
        let mut stats = RebuildStats::default();

        let mut wanted: Vec<Endpoint> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let endpoint = cluster.canonical(endpoint);
            if !wanted.contains(&endpoint) {
                wanted.push(endpoint);
            }
        }

        if wanted.is_empty() {
            debug!("Rebuild skipped: empty endpoint list");
            return stats;
        }

        let mut fresh: HashMap<Endpoint, Cl> = HashMap::new();
        for endpoint in &wanted {
            if self.position(endpoint).is_some() {
                continue;
            }

            match tokio::time::timeout(connect_timeout, cluster.connect(endpoint)).await {
                Ok(Ok(client)) => {
                    fresh.insert(endpoint.to_string(), client);
                }
                Ok(Err(e)) => {
                    stats.unreachable += 1;
                    warn!(endpoint = %endpoint, error = %e, "Failed to connect to endpoint");
                }
                Err(_) => {
                    stats.unreachable += 1;
                    warn!(endpoint = %endpoint, timeout = ?connect_timeout, "Connection timeout");
                }
            }
        }

        let retained_alive = wanted
            .iter()
            .filter_map(|endpoint| self.position(endpoint))
            .filter(|&idx| !self.conns[idx].is_dead())
            .count();

        if retained_alive + fresh.len() == 0 {
            warn!(
                discovered = wanted.len(),
                unreachable = stats.unreachable,
                "Rebuild abandoned: no reachable connection, keeping current pool"
            );
            return stats;
        }

        let mut previous: HashMap<Endpoint, Connection<Cl>> = self
            .conns
            .drain(..)
            .map(|c| (c.endpoint().to_string(), c))
            .collect();

        for endpoint in wanted {
            if let Some(conn) = previous.remove(endpoint.as_str()) {
                stats.retained += 1;
                self.conns.push(conn);
            } else if let Some(client) = fresh.remove(endpoint.as_str()) {
                stats.added += 1;
                self.conns.push(Connection::new(endpoint, client, self.backoff_base));
            }
        }

        stats.removed = previous.len();
        for endpoint in previous.keys() {
            debug!(endpoint = %endpoint, "Dropping connection to vanished endpoint");
        }
        stats.committed = true;

        info!(
            retained = stats.retained,
            added = stats.added,
            removed = stats.removed,
            unreachable = stats.unreachable,
            total = self.conns.len(),
            "Rebuilt connection pool"
        );

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::RoundRobinSelector;
    use std::collections::HashSet;

    const BASE: Duration = Duration::from_secs(60);

    fn pool_of(count: usize) -> ConnectionPool<()> {
        let mut pool = ConnectionPool::new(Algorithm::RoundRobin, BASE);
        for i in 0..count {
            pool.push(Connection::new(format!("node-{}:11211", i + 1), (), BASE));
        }
        pool
    }

    /// Cluster whose reachable endpoints are fixed up front
    struct StaticCluster {
        reachable: HashSet<String>,
    }

    impl StaticCluster {
        fn new(reachable: &[&str]) -> Self {
            Self {
                reachable: reachable.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl Cluster for StaticCluster {
        type Client = ();

        fn canonical(&self, endpoint: &str) -> Endpoint {
            endpoint.trim_start_matches("tcp://").to_string()
        }

        async fn connect(&self, endpoint: &str) -> anyhow::Result<()> {
            if self.reachable.contains(endpoint) {
                Ok(())
            } else {
                anyhow::bail!("{} refused the connection", endpoint)
            }
        }

        async fn discover(&self, _conn: &mut Connection<()>) -> Vec<Endpoint> {
            Vec::new()
        }
    }

    fn endpoints(names: &[&str]) -> Vec<Endpoint> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_pool() {
        let mut pool = pool_of(0);
        assert_eq!(pool.checkout(), Err(PoolError::NoConnectionAvailable));
        assert!(pool.conn().is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_never_returns_dead_when_alive_exists() {
        let mut pool = pool_of(4);
        pool.get_mut(0).unwrap().mark_failed();
        pool.get_mut(2).unwrap().mark_failed();

        for _ in 0..20 {
            let conn = pool.conn().unwrap();
            assert!(!conn.is_dead());
            assert!(conn.endpoint() == "node-2:11211" || conn.endpoint() == "node-4:11211");
        }
        assert_eq!(pool.dead_count(), 2);
    }

    #[test]
    fn test_resurrects_fewest_failures() {
        let mut pool = pool_of(3);
        for _ in 0..3 {
            pool.get_mut(0).unwrap().mark_failed();
        }
        pool.get_mut(1).unwrap().mark_failed();
        for _ in 0..2 {
            pool.get_mut(2).unwrap().mark_failed();
        }

        let conn = pool.conn().unwrap();
        assert_eq!(conn.endpoint(), "node-2:11211");
        assert!(!conn.is_dead());
        assert_eq!(conn.failures(), 1);

        // Exactly one resurrected
        assert_eq!(pool.alive_count(), 1);
        assert_eq!(pool.dead_count(), 2);
    }

    #[test]
    fn test_resurrect_ties_keep_pool_order() {
        let mut pool = pool_of(3);
        for idx in 0..3 {
            pool.get_mut(idx).unwrap().mark_failed();
        }

        let idx = pool.checkout().unwrap();
        assert_eq!(idx, 0);
        assert_eq!(pool.alives(), vec![0]);
        assert_eq!(pool.deads(), vec![1, 2]);
    }

    #[test]
    fn test_round_robin_over_pool() {
        let mut pool = pool_of(3);
        let picks: Vec<usize> = (0..4).map(|_| pool.checkout().unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_resurrect_eligible() {
        let mut pool = pool_of(2);
        let t0 = Instant::now();
        pool.get_mut(0).unwrap().mark_failed_at(t0);
        pool.get_mut(1).unwrap().mark_failed_at(t0);
        pool.get_mut(1).unwrap().mark_failed_at(t0);

        // One base elapsed: only the single-failure connection qualifies
        assert_eq!(pool.resurrect_eligible(t0 + Duration::from_secs(61)), 1);
        assert_eq!(pool.alives(), vec![0]);

        assert_eq!(pool.resurrect_eligible(t0 + Duration::from_secs(121)), 1);
        assert_eq!(pool.alive_count(), 2);
    }

    #[test]
    fn test_set_backoff_base_applies_to_connections() {
        let mut pool = pool_of(2);
        pool.set_backoff_base(Duration::from_secs(5));
        assert!(pool
            .connections()
            .iter()
            .all(|c| c.backoff_base() == Duration::from_secs(5)));
    }

    #[test]
    fn test_set_selector() {
        let mut pool = pool_of(2);
        pool.set_selector(Algorithm::Random.build());
        assert_eq!(pool.selector_algorithm(), Algorithm::Random);
        pool.set_selector(Box::new(RoundRobinSelector::new()));
        assert_eq!(pool.selector_algorithm(), Algorithm::RoundRobin);
    }

    #[test]
    fn test_stats() {
        let mut pool = pool_of(3);
        pool.get_mut(1).unwrap().mark_failed();

        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.alive, 2);
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.selector, Algorithm::RoundRobin);
        assert!(stats.connections[1].is_dead);
        assert!(stats.connections[1].dead_for.is_some());
        assert!(stats.connections[0].dead_for.is_none());
    }

    #[tokio::test]
    async fn test_rebuild_merges_by_endpoint() {
        let mut pool = pool_of(3);
        pool.get_mut(1).unwrap().mark_failed();
        pool.get_mut(1).unwrap().mark_failed();

        let cluster = StaticCluster::new(&["node-4:11211"]);
        let stats = pool
            .rebuild(
                &cluster,
                &endpoints(&["node-2:11211", "node-3:11211", "node-4:11211"]),
                Duration::from_secs(1),
            )
            .await;

        assert!(stats.committed);
        assert_eq!(stats.retained, 2);
        assert_eq!(stats.added, 1);
        assert_eq!(stats.removed, 1);
        assert_eq!(
            pool.endpoints(),
            endpoints(&["node-2:11211", "node-3:11211", "node-4:11211"])
        );

        // Health state survives the rebuild
        let node2 = pool.get(0).unwrap();
        assert!(node2.is_dead());
        assert_eq!(node2.failures(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_abandoned_without_reachable_connection() {
        let mut pool = pool_of(2);
        pool.get_mut(0).unwrap().mark_failed();

        let cluster = StaticCluster::new(&[]);
        let stats = pool
            .rebuild(
                &cluster,
                &endpoints(&["node-1:11211", "node-9:11211"]),
                Duration::from_secs(1),
            )
            .await;

        assert!(!stats.committed);
        assert_eq!(stats.unreachable, 1);

        // Old pool fully intact
        assert_eq!(pool.endpoints(), endpoints(&["node-1:11211", "node-2:11211"]));
        assert_eq!(pool.deads(), vec![0]);
        assert_eq!(pool.alives(), vec![1]);
        assert_eq!(pool.get(0).unwrap().failures(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_with_empty_list_is_noop() {
        let mut pool = pool_of(2);
        let cluster = StaticCluster::new(&[]);
        let stats = pool.rebuild(&cluster, &[], Duration::from_secs(1)).await;

        assert!(!stats.committed);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_deduplicates() {
        let mut pool = pool_of(0);
        let cluster = StaticCluster::new(&["a:1", "b:2"]);
        let stats = pool
            .rebuild(&cluster, &endpoints(&["a:1", "b:2", "a:1"]), Duration::from_secs(1))
            .await;

        assert!(stats.committed);
        assert_eq!(stats.added, 2);
        assert_eq!(pool.endpoints(), endpoints(&["a:1", "b:2"]));
    }

    #[tokio::test]
    async fn test_rebuild_matches_canonical_endpoints() {
        let mut pool = pool_of(2);
        pool.get_mut(0).unwrap().mark_failed();

        // Nothing is reachable: a redial of node-1 would fail
        let cluster = StaticCluster::new(&[]);
        let stats = pool
            .rebuild(
                &cluster,
                &endpoints(&["tcp://node-1:11211", "node-2:11211", "tcp://node-2:11211"]),
                Duration::from_secs(1),
            )
            .await;

        assert!(stats.committed);
        assert_eq!(stats.retained, 2);
        assert_eq!(stats.added, 0);
        assert_eq!(stats.unreachable, 0);
        assert_eq!(pool.endpoints(), endpoints(&["node-1:11211", "node-2:11211"]));
        assert_eq!(pool.get(0).unwrap().failures(), 1);
    }
}
