//! CLI module for clusterpool
//!
//! Every command goes through the same transport the library exposes, so
//! the CLI doubles as a smoke test for a live cluster.
//!
//! # Usage
//!
//! ```bash
//! # Show the discovered topology
//! clusterpool --config cluster.yaml endpoints
//!
//! # Pool health and request counters
//! clusterpool stats --json
//!
//! # Ten liveness round-trips, watch the selector rotate
//! clusterpool ping --count 10
//!
//! # Memcache item operations
//! clusterpool set greeting hello --ttl 60
//! clusterpool get greeting
//! clusterpool delete greeting
//! ```

pub mod commands;
