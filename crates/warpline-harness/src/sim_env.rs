//! Manually advanced environment for deterministic simulation.
//!
//! Every node in a [`SimCluster`](crate::SimCluster) shares one clock. Time
//! only moves when the cluster (or a test) advances it, so GVT pacing,
//! rendezvous deadlines and retry backoff are reproducible to the tick.

use std::{
    ops::{Add, Sub},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use warpline_core::Environment;

/// Point on the simulated clock: time since the simulation began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Time since the simulation began.
    pub fn elapsed(self) -> Duration {
        self.0
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0.saturating_add(rhs))
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

/// Shared manual clock. Clones observe the same time.
#[derive(Debug, Clone, Default)]
pub struct SimEnv {
    nanos: Arc<AtomicU64>,
}

impl SimEnv {
    /// Clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(Duration::from_nanos(self.nanos.load(Ordering::SeqCst)))
    }

    /// Sleeping is instantaneous: the clock jumps by `duration`.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        std::future::ready(())
    }
}
