//! Connection health bookkeeping and the connection pool
//!
//! This module provides:
//! - [`Connection`]: one endpoint's client handle plus failure count, dead flag and backoff
//! - [`ConnectionPool`]: alive/dead partitioning, reactive resurrection and topology rebuilds

pub mod collection;
pub mod connection;

pub use collection::{ConnectionPool, ConnectionStats, PoolError, PoolStats, RebuildStats};
pub use connection::{Connection, Endpoint};
