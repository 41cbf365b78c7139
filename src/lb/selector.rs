use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Selection algorithm choice, as named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Simple round-robin distribution
    #[default]
    RoundRobin,
    /// Uniformly random pick
    Random,
}

impl Algorithm {
    /// Parse an algorithm name, falling back to round-robin for unknown names
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "random" => Algorithm::Random,
            _ => Algorithm::RoundRobin,
        }
    }

    /// Build a fresh selector for this algorithm
    pub fn build<T>(self) -> Box<dyn Selector<T>> {
        match self {
            Algorithm::RoundRobin => Box::new(RoundRobinSelector::new()),
            Algorithm::Random => Box::new(RandomSelector::new()),
        }
    }
}

/// Picks one candidate out of a non-empty candidate list
///
/// Returns the position of the chosen candidate within `candidates`.
/// Passing an empty list is a caller bug; the pool never does.
pub trait Selector<T>: Send {
    fn select(&mut self, candidates: &[&T]) -> usize;

    fn algorithm(&self) -> Algorithm;
}

/// Round-robin: cursor-based selection
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursor: usize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }
}

impl<T> Selector<T> for RoundRobinSelector {
    fn select(&mut self, candidates: &[&T]) -> usize {
        debug_assert!(!candidates.is_empty(), "select called with no candidates");

        // The candidate list shrinks as connections die
        if self.cursor >= candidates.len() {
            self.cursor = 0;
        }

        let index = self.cursor;
        self.cursor += 1;
        index
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::RoundRobin
    }
}

/// Random: uniform pick from a generator seeded once per selector
#[derive(Debug)]
pub struct RandomSelector {
    rng: StdRng,
}

impl RandomSelector {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self::with_seed(seed)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Selector<T> for RandomSelector {
    fn select(&mut self, candidates: &[&T]) -> usize {
        debug_assert!(!candidates.is_empty(), "select called with no candidates");
        self.rng.gen_range(0..candidates.len())
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Random
    }
}
