//! clusterpool - resilient load-balanced transport in front of clustered backends
//!
//! A [`Transport`] hands callers one logical connection to a memcache ring or
//! a search cluster. Behind it a single worker task picks live connections,
//! marks failing ones dead, resurrects them with exponential backoff and
//! keeps the member list current through periodic discovery.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod discovery;
pub mod lb;
pub mod pool;
pub mod transport;

pub use cluster::{Cluster, ClusterKind};
pub use config::{Config, TransportConfig};
pub use core::Core;
pub use pool::{Connection, Endpoint};
pub use transport::{Transport, TransportError, WorkError};
