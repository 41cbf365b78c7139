//! Connection selection strategies
//!
//! A [`Selector`] picks one connection out of the pool's alive subset. The
//! pool filters dead connections out before asking, so selectors never see
//! an empty candidate list and never need to know about health.
//!
//! # Algorithms
//!
//! - **Round-robin**: cursor over the candidate list, reset to the start when
//!   the list has shrunk below the cursor
//! - **Random**: uniform pick from a generator seeded once per selector

pub mod selector;

pub use selector::{Algorithm, RandomSelector, RoundRobinSelector, Selector};
