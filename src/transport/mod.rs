//! Resilient transport in front of a cluster
//!
//! A [`Transport`] is a cheap, cloneable handle to a worker task that owns
//! the connection pool. Callers submit units of work; the worker picks a
//! connection, runs the work against it, applies the retry policy and
//! returns the outcome.
//!
//! # Example
//!
//! ```ignore
//! let transport = Transport::start(MemcacheCluster::default(), config, &seeds).await?;
//! let version = transport
//!     .request(|conn: &mut Connection<MemcacheClient>| {
//!         async move { conn.client_mut().version().await }.boxed()
//!     })
//!     .await?;
//! ```

pub mod envelope;
pub mod error;
pub mod worker;

pub use envelope::{Envelope, Parcel, Recycler, Reset};
pub use error::{TransportError, WorkError};
pub use worker::{ConfigUpdate, TransportStats};

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::cluster::Cluster;
use crate::config::TransportConfig;
use crate::discovery::Sniffer;
use crate::pool::{Connection, ConnectionPool, Endpoint};
use envelope::erase;
use worker::{Command, Worker};

/// Pending commands buffered before senders wait
pub const MAILBOX_CAPACITY: usize = 64;

type BoundFn<Cl, A, T> =
    dyn for<'a> Fn(&'a mut Connection<Cl>, A) -> BoxFuture<'a, Result<T, WorkError>> + Send + Sync;

/// Handle to a running transport worker
pub struct Transport<Cl> {
    tx: mpsc::Sender<Command<Cl>>,
    envelopes: Arc<Recycler<Envelope<Cl>>>,
    parcels: Arc<Recycler<Parcel>>,
}

impl<Cl> Clone for Transport<Cl> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            envelopes: Arc::clone(&self.envelopes),
            parcels: Arc::clone(&self.parcels),
        }
    }
}

impl<Cl: Send + 'static> Transport<Cl> {
    /// Connect to the seed endpoints and spawn the worker
    ///
    /// Fails with [`TransportError::NoConnectionAvailable`] when no seed is
    /// reachable. With discovery enabled the cluster is sniffed once before
    /// this returns and the pool is rebuilt from the answer.
    pub async fn start<C>(
        cluster: C,
        config: TransportConfig,
        seeds: &[Endpoint],
    ) -> Result<Self, TransportError>
    where
        C: Cluster<Client = Cl>,
    {
        let mut pool = ConnectionPool::new(config.selector, Duration::from_secs(config.backoff_base));
        let seeded = pool
            .rebuild(&cluster, seeds, Duration::from_secs(config.connect_timeout))
            .await;
        if !seeded.committed {
            warn!(seeds = seeds.len(), "No seed endpoint reachable");
            return Err(TransportError::NoConnectionAvailable);
        }

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let envelopes = Arc::new(Recycler::default());
        let parcels = Arc::new(Recycler::default());

        let sniffer = Sniffer::new(Duration::from_secs(config.sniff_timeout));
        let mut worker = Worker::new(
            cluster,
            config,
            pool,
            sniffer,
            Arc::clone(&envelopes),
            Arc::clone(&parcels),
            rx,
        );
        worker.bootstrap().await;
        tokio::spawn(worker.run());

        Ok(Self {
            tx,
            envelopes,
            parcels,
        })
    }

    /// Run a unit of work against a connection chosen by the pool
    ///
    /// The closure may be called more than once when the request is retried.
    pub async fn request<T, F>(&self, work: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: for<'a> FnMut(&'a mut Connection<Cl>) -> BoxFuture<'a, Result<T, WorkError>>
            + Send
            + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut envelope = self.envelopes.acquire();
        envelope.load(erase(work), reply_tx);

        if let Err(mpsc::error::SendError(command)) = self.tx.send(Command::Request(envelope)).await {
            if let Command::Request(envelope) = command {
                self.envelopes.release(envelope);
            }
            return Err(TransportError::Closed);
        }

        let mut parcel = reply_rx.await.map_err(|_| TransportError::Closed)?;
        let outcome = parcel.take_outcome::<T>();
        self.parcels.release(parcel);
        outcome
    }

    /// Bind a work function that takes an argument bundle per call
    pub fn bind<A, T, F>(&self, func: F) -> Bound<Cl, A, T>
    where
        F: for<'a> Fn(&'a mut Connection<Cl>, A) -> BoxFuture<'a, Result<T, WorkError>>
            + Send
            + Sync
            + 'static,
    {
        Bound {
            transport: self.clone(),
            func: Arc::new(func),
        }
    }

    /// Replace the configuration with `update(current)`
    ///
    /// Applies to the next request; a request in flight finishes under the
    /// old settings. Returns the configuration now in force.
    pub async fn configure<F>(&self, update: F) -> Result<TransportConfig, TransportError>
    where
        F: FnOnce(TransportConfig) -> TransportConfig + Send + 'static,
    {
        self.ask(|ack| Command::Configure {
            update: Box::new(update),
            ack,
        })
        .await
    }

    pub async fn stats(&self) -> Result<TransportStats, TransportError> {
        self.ask(Command::Stats).await
    }

    /// Cached topology, discovering it first if nothing is cached
    pub async fn sniffed(&self) -> Result<Vec<Endpoint>, TransportError> {
        self.ask(Command::Sniffed).await?
    }

    /// Force a discovery and rebuild; returns the discovered endpoints
    pub async fn discover(&self) -> Result<Vec<Endpoint>, TransportError> {
        self.ask(Command::Discover).await?
    }

    /// Stop the worker
    ///
    /// Commands still queued are dropped and their callers see
    /// [`TransportError::Closed`].
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.ask(Command::Shutdown).await
    }

    /// Whether the worker has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn ask<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command<Cl>,
    ) -> Result<R, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)
    }
}

/// A work function bound to a transport, called with a fresh argument bundle each time
pub struct Bound<Cl, A, T> {
    transport: Transport<Cl>,
    func: Arc<BoundFn<Cl, A, T>>,
}

impl<Cl, A, T> Clone for Bound<Cl, A, T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            func: Arc::clone(&self.func),
        }
    }
}

impl<Cl, A, T> Bound<Cl, A, T>
where
    Cl: Send + 'static,
    A: Clone + Send + 'static,
    T: Send + 'static,
{
    pub async fn call(&self, args: A) -> Result<T, TransportError> {
        let func = Arc::clone(&self.func);
        self.transport
            .request(move |conn| func(conn, args.clone()))
            .await
    }
}
