//! Statistics sink.
//!
//! The core produces counters and timings; what happens to them is up to the
//! embedder. A sink is created with the node, notified on every adopted GVT
//! and flushed at GVT and at shutdown.

use std::collections::{BTreeMap, HashMap};

use warpline_proto::{LpId, VirtualTime};

/// Kinds of statistic the core records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stat {
    /// Antimessages sent
    AntiMessage,
    /// Events executed (first or re-execution, not silent)
    Event,
    /// Events committed below GVT
    Committed,
    /// Rollbacks performed
    Rollback,
    /// Checkpoints taken
    Checkpoint,
    /// Seconds spent taking a checkpoint
    CheckpointTime,
    /// Bytes of state captured by a checkpoint
    CheckpointMemory,
    /// State restorations
    Recovery,
    /// Seconds spent restoring and replaying
    RecoveryTime,
    /// Seconds spent inside the model callback
    EventTime,
    /// Steps in which no LP could run
    IdleCycles,
    /// Entries re-executed silently during recovery
    Silent,
    /// Seconds a GVT round took, start to last adoption
    GvtRoundTime,
    /// GVT advance since the previous round, in ticks
    SimTimeAdvancement,
}

/// Receives statistics from a node.
pub trait MetricsSink: Send {
    /// Record one sample. `lp` is `None` for node-wide statistics.
    fn record(&mut self, lp: Option<LpId>, stat: Stat, value: f64);

    /// A GVT round completed with value `gvt`.
    fn on_gvt(&mut self, _gvt: VirtualTime) {}

    /// Persist anything buffered.
    fn flush(&mut self) {}
}

/// In-memory totals, used by tests and the demo binary.
#[derive(Debug, Default, Clone)]
pub struct CounterSink {
    totals: BTreeMap<Stat, f64>,
    per_lp: HashMap<(LpId, Stat), f64>,
    gvts: Vec<VirtualTime>,
    flushes: u64,
}

impl CounterSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all samples of `stat`.
    pub fn total(&self, stat: Stat) -> f64 {
        self.totals.get(&stat).copied().unwrap_or(0.0)
    }

    /// Sum of samples of `stat` recorded for `lp`.
    pub fn for_lp(&self, lp: LpId, stat: Stat) -> f64 {
        self.per_lp.get(&(lp, stat)).copied().unwrap_or(0.0)
    }

    /// Every GVT announced, in order.
    pub fn gvts(&self) -> &[VirtualTime] {
        &self.gvts
    }

    /// Times `flush` was called.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// All totals, ordered by stat.
    pub fn totals(&self) -> impl Iterator<Item = (Stat, f64)> + '_ {
        self.totals.iter().map(|(stat, value)| (*stat, *value))
    }
}

impl MetricsSink for CounterSink {
    fn record(&mut self, lp: Option<LpId>, stat: Stat, value: f64) {
        *self.totals.entry(stat).or_insert(0.0) += value;
        if let Some(lp) = lp {
            *self.per_lp.entry((lp, stat)).or_insert(0.0) += value;
        }
    }

    fn on_gvt(&mut self, gvt: VirtualTime) {
        self.gvts.push(gvt);
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }
}

impl<T: MetricsSink + ?Sized> MetricsSink for Box<T> {
    fn record(&mut self, lp: Option<LpId>, stat: Stat, value: f64) {
        (**self).record(lp, stat, value);
    }

    fn on_gvt(&mut self, gvt: VirtualTime) {
        (**self).on_gvt(gvt);
    }

    fn flush(&mut self) {
        (**self).flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut sink = CounterSink::new();
        sink.record(Some(1), Stat::Event, 1.0);
        sink.record(Some(1), Stat::Event, 1.0);
        sink.record(Some(2), Stat::Event, 1.0);
        sink.record(None, Stat::IdleCycles, 1.0);
        sink.on_gvt(VirtualTime::new(40));
        sink.flush();

        assert!((sink.total(Stat::Event) - 3.0).abs() < f64::EPSILON);
        assert!((sink.for_lp(1, Stat::Event) - 2.0).abs() < f64::EPSILON);
        assert!((sink.total(Stat::Rollback)).abs() < f64::EPSILON);
        assert_eq!(sink.gvts(), &[VirtualTime::new(40)]);
        assert_eq!(sink.flushes(), 1);
    }
}
