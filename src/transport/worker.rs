//! The transport actor
//!
//! One worker task owns the pool, the sniffer and the request counter. It
//! drains a command mailbox and two timers, one event at a time, so pool
//! mutation never interleaves.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::envelope::{Envelope, ErasedWork, Parcel, Payload, Recycler};
use super::error::{TransportError, WorkError};
use crate::cluster::Cluster;
use crate::config::TransportConfig;
use crate::discovery::Sniffer;
use crate::pool::{ConnectionPool, Endpoint, PoolError, PoolStats};

/// Function from the current configuration to the next one
pub type ConfigUpdate = Box<dyn FnOnce(TransportConfig) -> TransportConfig + Send>;

/// Messages accepted by the worker
pub(crate) enum Command<Cl> {
    Request(Box<Envelope<Cl>>),
    Configure {
        update: ConfigUpdate,
        ack: oneshot::Sender<TransportConfig>,
    },
    Stats(oneshot::Sender<TransportStats>),
    Sniffed(oneshot::Sender<Result<Vec<Endpoint>, TransportError>>),
    Discover(oneshot::Sender<Result<Vec<Endpoint>, TransportError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Snapshot of a transport's state
#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    /// Requests accepted since start
    pub requests: u64,
    /// Discovery calls made since start
    pub sniffs: u64,
    /// Time since the last successful request
    pub idle_for: Duration,
    /// Endpoints from the last successful discovery
    pub discovered: Option<Vec<Endpoint>>,
    pub pool: PoolStats,
}

pub(crate) struct Worker<C: Cluster> {
    cluster: C,
    config: TransportConfig,
    pool: ConnectionPool<C::Client>,
    sniffer: Sniffer,
    requests: u64,
    last_success: Instant,
    envelopes: Arc<Recycler<Envelope<C::Client>>>,
    parcels: Arc<Recycler<Parcel>>,
    rx: mpsc::Receiver<Command<C::Client>>,
}

impl<C: Cluster> Worker<C> {
    pub(crate) fn new(
        cluster: C,
        config: TransportConfig,
        pool: ConnectionPool<C::Client>,
        sniffer: Sniffer,
        envelopes: Arc<Recycler<Envelope<C::Client>>>,
        parcels: Arc<Recycler<Parcel>>,
        rx: mpsc::Receiver<Command<C::Client>>,
    ) -> Self {
        Self {
            cluster,
            config,
            pool,
            sniffer,
            requests: 0,
            last_success: Instant::now(),
            envelopes,
            parcels,
            rx,
        }
    }

    /// Feed the initial discovery result into the pool
    pub(crate) async fn bootstrap(&mut self) {
        if !self.config.discover {
            return;
        }

        match self.sniffer.sniffed(&self.cluster, &mut self.pool).await {
            Ok(endpoints) if !endpoints.is_empty() => {
                let connect_timeout = Duration::from_secs(self.config.connect_timeout);
                self.pool.rebuild(&self.cluster, &endpoints, connect_timeout).await;
            }
            Ok(_) => debug!("No topology discovered at start, keeping seed connections"),
            Err(e) => warn!(error = %e, "Initial discovery failed"),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut discover_timer = periodic(self.config.discover_interval);
        let mut housekeeping_timer = periodic(self.config.housekeeping_interval);

        info!(
            connections = self.pool.len(),
            discover = self.config.discover,
            selector = ?self.pool.selector_algorithm(),
            "Transport worker started"
        );

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        debug!("All transport handles dropped, stopping worker");
                        break;
                    };

                    match command {
                        Command::Request(envelope) => self.handle_request(envelope).await,
                        Command::Configure { update, ack } => {
                            self.reconfigure(update);
                            discover_timer = periodic(self.config.discover_interval);
                            housekeeping_timer = periodic(self.config.housekeeping_interval);
                            let _ = ack.send(self.config.clone());
                        }
                        Command::Stats(reply) => {
                            let _ = reply.send(self.stats());
                        }
                        Command::Sniffed(reply) => {
                            let endpoints = self
                                .sniffer
                                .sniffed(&self.cluster, &mut self.pool)
                                .await
                                .map_err(TransportError::from);
                            let _ = reply.send(endpoints);
                        }
                        Command::Discover(reply) => {
                            let endpoints = self.discover().await;
                            let _ = reply.send(endpoints);
                        }
                        Command::Shutdown(ack) => {
                            info!(requests = self.requests, "Transport shutting down");
                            let _ = ack.send(());
                            break;
                        }
                    }
                }
                _ = discover_timer.tick(), if self.config.discover => {
                    if let Err(e) = self.discover().await {
                        warn!(error = %e, "Scheduled discovery failed");
                    }
                }
                _ = housekeeping_timer.tick(), if self.config.debug => self.housekeeping(),
            }
        }
    }

    async fn handle_request(&mut self, mut envelope: Box<Envelope<C::Client>>) {
        let reply = envelope.take_reply();
        let (outcome, attempts) = match envelope.take_work() {
            Some(mut work) => self.perform(&mut work).await,
            None => (Err(TransportError::Undelivered), 0),
        };
        self.envelopes.release(envelope);

        let Some(reply) = reply else {
            return;
        };

        let mut parcel = self.parcels.acquire();
        parcel.fill(outcome, attempts);
        if let Err(parcel) = reply.send(parcel) {
            // Caller went away before the outcome arrived
            self.parcels.release(parcel);
        }
    }

    /// Run one request under the retry policy
    ///
    /// Network faults mark the connection dead and move on to another
    /// connection only when `retry_on_failure` is set. Other errors retry on
    /// the same connection. Either way at most `max_retries` retries follow
    /// the first attempt.
    async fn perform(
        &mut self,
        work: &mut ErasedWork<C::Client>,
    ) -> (Result<Payload, TransportError>, u32) {
        self.requests = self.requests.wrapping_add(1);
        self.prepare().await;

        let mut attempts: u32 = 0;
        let mut pinned: Option<usize> = None;

        loop {
            let idx = match pinned.take() {
                Some(idx) => idx,
                None => match self.checkout() {
                    Ok(idx) => idx,
                    Err(e) => return (Err(e.into()), attempts),
                },
            };

            let Some(conn) = self.pool.get_mut(idx) else {
                return (Err(TransportError::NoConnectionAvailable), attempts);
            };

            attempts += 1;
            let err = match work(conn).await {
                Ok(value) => {
                    self.succeeded(idx, attempts);
                    return (Ok(value), attempts);
                }
                Err(err) => err,
            };

            let can_retry = attempts <= self.config.max_retries;
            if err.is_network() {
                self.failed(idx, &err);
                if self.config.retry_on_failure && can_retry {
                    continue;
                }
            } else if can_retry {
                if self.config.debug {
                    debug!(attempt = attempts, error = %err, "Transient error, retrying on same connection");
                }
                pinned = Some(idx);
                continue;
            }

            warn!(attempts, error = %err, "Request failed");
            return (Err(TransportError::Failed { attempts, source: err }), attempts);
        }
    }

    /// Pre-selection housekeeping: inactivity resurrection and request-count discovery
    async fn prepare(&mut self) {
        let now = Instant::now();
        let idle = now.saturating_duration_since(self.last_success);
        if self.pool.dead_count() > 0 && idle > Duration::from_secs(self.config.resurrect_after) {
            let resurrected = self.pool.resurrect_eligible(now);
            if resurrected > 0 {
                info!(resurrected, idle = ?idle, "Resurrected connections after inactivity");
            }
        }

        let every = self.config.discover_after;
        if self.config.discover && every > 0 && self.requests % every == 0 {
            debug!(requests = self.requests, "Request threshold reached, refreshing topology");
            if let Err(e) = self.discover().await {
                warn!(error = %e, "Threshold discovery failed");
            }
        }
    }

    fn checkout(&mut self) -> Result<usize, PoolError> {
        if !self.pool.is_empty() && self.pool.alive_count() == 0 {
            warn!(dead = self.pool.dead_count(), "No alive connections left");
            self.sniffer.lost();
        }
        self.pool.checkout()
    }

    fn succeeded(&mut self, idx: usize, attempts: u32) {
        if let Some(conn) = self.pool.get_mut(idx) {
            if conn.failures() > 0 {
                info!(
                    endpoint = %conn.endpoint(),
                    failures = conn.failures(),
                    "Connection recovered"
                );
                conn.mark_healthy();
            }
            if self.config.debug {
                debug!(endpoint = %conn.endpoint(), attempts, "Request succeeded");
            }
        }
        self.last_success = Instant::now();
    }

    fn failed(&mut self, idx: usize, err: &WorkError) {
        if let Some(conn) = self.pool.get_mut(idx) {
            conn.mark_failed();
            warn!(
                endpoint = %conn.endpoint(),
                failures = conn.failures(),
                backoff = ?conn.backoff(),
                error = %err,
                "Connection marked dead"
            );
        }
    }

    /// Re-sniff unconditionally and rebuild the pool from the result
    async fn discover(&mut self) -> Result<Vec<Endpoint>, TransportError> {
        let endpoints = self.sniffer.refresh(&self.cluster, &mut self.pool).await?;
        if !endpoints.is_empty() {
            let connect_timeout = Duration::from_secs(self.config.connect_timeout);
            self.pool.rebuild(&self.cluster, &endpoints, connect_timeout).await;
        }
        Ok(endpoints)
    }

    fn reconfigure(&mut self, update: ConfigUpdate) {
        let previous = self.config.clone();
        let next = update(previous.clone());

        if next.selector != self.pool.selector_algorithm() {
            self.pool.set_selector(next.selector.build());
        }
        if next.backoff_base != previous.backoff_base {
            self.pool.set_backoff_base(Duration::from_secs(next.backoff_base));
        }
        self.sniffer.set_timeout(Duration::from_secs(next.sniff_timeout));

        info!(
            discover = next.discover,
            discover_interval = next.discover_interval,
            max_retries = next.max_retries,
            retry_on_failure = next.retry_on_failure,
            selector = ?next.selector,
            "Transport reconfigured"
        );
        self.config = next;
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            requests: self.requests,
            sniffs: self.sniffer.sniffs(),
            idle_for: self.last_success.elapsed(),
            discovered: self.sniffer.cached().map(|endpoints| endpoints.to_vec()),
            pool: self.pool.stats(),
        }
    }

    fn housekeeping(&self) {
        debug!(
            alive = self.pool.alive_count(),
            dead = self.pool.dead_count(),
            requests = self.requests,
            "Connection pool status"
        );
    }
}

/// Interval whose first tick is one full period away
fn periodic(secs: u64) -> Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}
