//! Node configuration.

use std::time::Duration;

use warpline_proto::VirtualTime;

/// What the slab pool does when the free list runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolGrowth {
    /// Never allocate beyond the initial capacity; callers back off.
    #[default]
    Fixed,
    /// Allocate on demand up to `max_slabs` in total.
    Grow {
        /// Hard ceiling on slabs ever allocated
        max_slabs: usize,
    },
}

/// Backoff for rendezvous retries (UNBLOCK busy replies and reply timeouts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on the doubled delay
    pub max_backoff: Duration,
    /// Attempts before the session is declared failed
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_backoff.saturating_mul(1 << shift).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(100),
            max_attempts: 16,
        }
    }
}

/// Per-node engine configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Slabs allocated up front
    pub pool_capacity: usize,
    /// Behaviour once those are all in use
    pub pool_growth: PoolGrowth,
    /// Queue depth per destination node that triggers a flush
    pub flush_threshold: usize,
    /// Processed entries between periodic checkpoints
    pub checkpoint_interval: u32,
    /// Events processed per `step` before yielding to the driver
    pub events_per_step: usize,
    /// Events after this time are never executed; termination follows once
    /// GVT passes it
    pub end_time: VirtualTime,
    /// How long a rendezvous waits for the owner's next reply
    pub rendezvous_timeout: Duration,
    /// Backoff for rendezvous retries
    pub rendezvous_retry: RetryPolicy,
    /// Minimum spacing between GVT rounds
    pub gvt_period: Duration,
    /// A round not completed within this bound aborts the run
    pub gvt_liveness: Duration,
    /// Protocol violations tolerated from one peer before it is declared
    /// corrupt
    pub max_violations_per_peer: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 1024,
            pool_growth: PoolGrowth::Grow { max_slabs: 64 * 1024 },
            flush_threshold: 32,
            checkpoint_interval: 8,
            events_per_step: 64,
            end_time: VirtualTime::INFINITY,
            rendezvous_timeout: Duration::from_millis(500),
            rendezvous_retry: RetryPolicy::default(),
            gvt_period: Duration::from_millis(50),
            gvt_liveness: Duration::from_secs(10),
            max_violations_per_peer: 8,
        }
    }
}
