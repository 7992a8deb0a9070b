//! Production environment backed by the tokio clock.
//!
//! Uses `tokio::time::Instant` rather than the std clock so that a paused
//! runtime, or a turmoil simulation, controls GVT pacing and rendezvous
//! deadlines the same way it controls sleeps.

use std::time::Duration;

use tokio::time::Instant;
use warpline_core::Environment;

/// Environment reading the tokio clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioEnv;

impl TokioEnv {
    /// Create a new tokio environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for TokioEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}
