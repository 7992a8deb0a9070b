//! LP selection policy.
//!
//! The node asks a [`Scheduler`] which runnable LP executes next. The
//! default is lowest timestamp first, which keeps speculation shallow.

use warpline_proto::{LpId, VirtualTime};

/// An LP with pending work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Runnable {
    /// LP id
    pub lp: LpId,
    /// Time of its next pending entry
    pub next: VirtualTime,
}

/// Chooses the next LP to execute.
pub trait Scheduler: Send {
    /// Pick one of `runnable`, or `None` to yield.
    fn select(&mut self, runnable: &[Runnable]) -> Option<LpId>;
}

/// Earliest next entry wins; ties go to the lower LP id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestTimestampFirst;

impl Scheduler for LowestTimestampFirst {
    fn select(&mut self, runnable: &[Runnable]) -> Option<LpId> {
        runnable.iter().min_by_key(|r| (r.next, r.lp)).map(|r| r.lp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_then_lowest_id() {
        let runnable = [
            Runnable { lp: 4, next: VirtualTime::new(9) },
            Runnable { lp: 2, next: VirtualTime::new(7) },
            Runnable { lp: 1, next: VirtualTime::new(7) },
        ];
        assert_eq!(LowestTimestampFirst.select(&runnable), Some(1));
        assert_eq!(LowestTimestampFirst.select(&[]), None);
    }
}
