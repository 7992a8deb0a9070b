//! Environment abstraction for deterministic testing.
//!
//! The `Environment` trait decouples the engine from wall-clock time. Real
//! time only matters for three things in the core: rendezvous reply
//! deadlines, GVT round pacing and the GVT liveness bound. Everything else is
//! driven by virtual simulation time carried in messages.
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` must never go backwards
//! - Isolation: implementations must not share global state

use std::{
    fmt::Debug,
    future::Future,
    ops::{Add, Sub},
    time::Duration,
};

/// Abstract environment providing time and async sleeping.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Point in wall-clock (or simulated wall-clock) time.
    type Instant: Copy
        + Ord
        + Debug
        + Send
        + Sync
        + Add<Duration, Output = Self::Instant>
        + Sub<Output = Duration>;

    /// Returns the current time.
    ///
    /// # Invariants
    ///
    /// - Monotonicity: subsequent calls return times >= previous calls.
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code awaits this; the sans-IO core never sleeps.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}
