use std::time::Duration;
use tokio::time::Instant;

/// Unique identifier for a cluster member (e.g. "10.0.0.1:11211" or "http://es-1:9200")
pub type Endpoint = String;

/// A handle to one cluster endpoint plus its health bookkeeping
///
/// No I/O happens here. The client handle is owned exclusively by this
/// connection and is only ever lent out to a unit of work by the transport.
#[derive(Debug)]
pub struct Connection<Cl> {
    /// Endpoint this connection talks to
    endpoint: Endpoint,

    /// Capability-specific client handle
    client: Cl,

    /// Number of consecutive failures (reset on confirmed success)
    failures: u32,

    /// Whether the connection is currently excluded from selection
    dead: bool,

    /// When the connection was last marked dead
    dead_since: Option<Instant>,

    /// Unit duration for the resurrection backoff
    backoff_base: Duration,
}

impl<Cl> Connection<Cl> {
    /// Create a new, alive connection
    pub fn new(endpoint: Endpoint, client: Cl, backoff_base: Duration) -> Self {
        Self {
            endpoint,
            client,
            failures: 0,
            dead: false,
            dead_since: None,
            backoff_base,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn client(&self) -> &Cl {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut Cl {
        &mut self.client
    }

    /// Get the current failure count
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Time the connection was marked dead, if it is dead
    pub fn dead_since(&self) -> Option<Instant> {
        if self.dead {
            self.dead_since
        } else {
            None
        }
    }

    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    pub fn set_backoff_base(&mut self, backoff_base: Duration) {
        self.backoff_base = backoff_base;
    }

    /// Record a network-class failure
    ///
    /// Calling this on an already dead connection still counts, pushing the
    /// next resurrection further out.
    pub fn mark_failed(&mut self) {
        self.mark_failed_at(Instant::now());
    }

    /// Same as [`mark_failed`](Self::mark_failed) with an explicit clock reading
    pub fn mark_failed_at(&mut self, now: Instant) {
        self.dead = true;
        self.failures = self.failures.saturating_add(1);
        self.dead_since = Some(now);
    }

    /// Tentatively bring the connection back; the failure count is kept
    pub fn mark_alive(&mut self) {
        self.dead = false;
    }

    /// Confirm the connection works again
    pub fn mark_healthy(&mut self) {
        self.dead = false;
        self.failures = 0;
    }

    /// How long a dead connection must wait before it may be resurrected
    ///
    /// 1 failure waits one base, 2 failures two, 3 failures four, and so on.
    pub fn backoff(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(31);
        self.backoff_base.saturating_mul(1u32 << exponent)
    }

    /// Whether the backoff for this dead connection has elapsed at `now`
    pub fn is_resurrectable(&self, now: Instant) -> bool {
        match (self.dead, self.dead_since) {
            (true, Some(since)) => since
                .checked_add(self.backoff())
                .map_or(false, |eligible_at| now > eligible_at),
            _ => false,
        }
    }

    /// Resurrect the connection if its backoff has elapsed
    ///
    /// Returns true when the connection was brought back.
    pub fn resurrect(&mut self, now: Instant) -> bool {
        if self.is_resurrectable(now) {
            self.mark_alive();
            true
        } else {
            false
        }
    }
}
