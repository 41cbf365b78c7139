//! Topology discovery
//!
//! The [`Sniffer`] caches the member list reported by the cluster and
//! refreshes it on demand.

pub mod sniffer;

pub use sniffer::Sniffer;
