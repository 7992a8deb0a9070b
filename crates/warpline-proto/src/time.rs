use std::fmt;

use serde::{Deserialize, Serialize};

/// Simulation timestamp in model-defined ticks.
///
/// `INFINITY` is the identity of the GVT min-reduction: a node with nothing
/// left to process contributes it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VirtualTime(u64);

impl VirtualTime {
    /// The start of simulated time. Initial checkpoints live here.
    pub const ZERO: Self = Self(0);

    /// Greater than every reachable timestamp.
    pub const INFINITY: Self = Self(u64::MAX);

    /// Wrap a raw tick count.
    pub const fn new(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Raw tick count.
    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// True for the reduction identity.
    pub const fn is_infinite(self) -> bool {
        self.0 == u64::MAX
    }

    /// Offset by `delta` ticks, saturating at `INFINITY`.
    #[must_use]
    pub const fn saturating_add(self, delta: u64) -> Self {
        Self(self.0.saturating_add(delta))
    }
}

impl From<u64> for VirtualTime {
    fn from(ticks: u64) -> Self {
        Self(ticks)
    }
}

impl fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() { f.write_str("inf") } else { write!(f, "{}", self.0) }
    }
}
