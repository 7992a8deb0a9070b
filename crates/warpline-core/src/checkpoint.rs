//! Checkpoint storage.
//!
//! The engine saves LP state snapshots and asks for them back on rollback.
//! A snapshot is tagged with the time of the last entry it includes and
//! that entry's key, so recovery knows exactly where silent re-execution
//! has to resume.

use std::collections::{BTreeMap, HashMap};

use warpline_proto::{LpId, VirtualTime};

use crate::lp::EntryKey;

/// One saved state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint<S> {
    /// Time of the last entry applied to `state`
    pub time: VirtualTime,
    /// Key of that entry; `None` for the initial state
    pub cursor: Option<EntryKey>,
    /// The snapshot
    pub state: S,
}

/// The checkpoint fossil collection kept as the new base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retained {
    /// Time of the retained checkpoint
    pub time: VirtualTime,
    /// Its cursor
    pub cursor: Option<EntryKey>,
}

/// Where snapshots live.
pub trait CheckpointStore<S> {
    /// Store a snapshot. Snapshots for one LP arrive in non-decreasing
    /// `(time, cursor)` order; a snapshot with an equal position replaces
    /// the older one.
    fn save(&mut self, lp: LpId, checkpoint: Checkpoint<S>);

    /// Latest snapshot strictly before `time`.
    fn get_state_before(&self, lp: LpId, time: VirtualTime) -> Option<&Checkpoint<S>>;

    /// Forget snapshots at or after `time`; they describe undone history.
    fn discard_from(&mut self, lp: LpId, time: VirtualTime);

    /// Drop everything older than the latest snapshot before `gvt`, which
    /// is kept and returned.
    fn fossil_collect(&mut self, lp: LpId, gvt: VirtualTime) -> Option<Retained>;

    /// Snapshots held for `lp`.
    fn len(&self, lp: LpId) -> usize;
}

type Position = (VirtualTime, Option<EntryKey>);

/// Checkpoints kept in memory, ordered per LP.
#[derive(Debug)]
pub struct MemoryCheckpoints<S> {
    per_lp: HashMap<LpId, BTreeMap<Position, Checkpoint<S>>>,
}

impl<S> MemoryCheckpoints<S> {
    /// Empty store.
    pub fn new() -> Self {
        Self { per_lp: HashMap::new() }
    }
}

impl<S> Default for MemoryCheckpoints<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> CheckpointStore<S> for MemoryCheckpoints<S> {
    fn save(&mut self, lp: LpId, checkpoint: Checkpoint<S>) {
        let position = (checkpoint.time, checkpoint.cursor);
        self.per_lp.entry(lp).or_default().insert(position, checkpoint);
    }

    fn get_state_before(&self, lp: LpId, time: VirtualTime) -> Option<&Checkpoint<S>> {
        self.per_lp
            .get(&lp)?
            .range(..(time, None))
            .next_back()
            .map(|(_, checkpoint)| checkpoint)
    }

    fn discard_from(&mut self, lp: LpId, time: VirtualTime) {
        if let Some(snapshots) = self.per_lp.get_mut(&lp) {
            drop(snapshots.split_off(&(time, None)));
        }
    }

    fn fossil_collect(&mut self, lp: LpId, gvt: VirtualTime) -> Option<Retained> {
        let snapshots = self.per_lp.get_mut(&lp)?;
        let base = *snapshots.range(..(gvt, None)).next_back()?.0;
        let kept = snapshots.split_off(&base);
        *snapshots = kept;
        Some(Retained { time: base.0, cursor: base.1 })
    }

    fn len(&self, lp: LpId) -> usize {
        self.per_lp.get(&lp).map_or(0, BTreeMap::len)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lp::Rank;

    fn key(time: u64) -> Option<EntryKey> {
        Some(EntryKey { time: VirtualTime::new(time), rank: Rank::Regular, sender: 0, seq: 1 })
    }

    fn store() -> MemoryCheckpoints<u64> {
        let mut store = MemoryCheckpoints::new();
        store.save(1, Checkpoint { time: VirtualTime::ZERO, cursor: None, state: 0 });
        for t in [10, 20, 30] {
            store.save(1, Checkpoint { time: VirtualTime::new(t), cursor: key(t), state: t });
        }
        store
    }

    #[test]
    fn state_before_is_strict() {
        let store = store();
        assert_eq!(store.get_state_before(1, VirtualTime::new(20)).unwrap().state, 10);
        assert_eq!(store.get_state_before(1, VirtualTime::new(21)).unwrap().state, 20);
        assert_eq!(store.get_state_before(1, VirtualTime::new(5)).unwrap().state, 0);
        assert!(store.get_state_before(1, VirtualTime::ZERO).is_none());
        assert!(store.get_state_before(2, VirtualTime::new(5)).is_none());
    }

    #[test]
    fn discard_from_drops_undone_snapshots() {
        let mut store = store();
        store.discard_from(1, VirtualTime::new(20));
        assert_eq!(store.len(1), 2);
        assert_eq!(store.get_state_before(1, VirtualTime::INFINITY).unwrap().state, 10);
    }

    #[test]
    fn fossil_collection_keeps_one_base() {
        let mut store = store();
        let retained = store.fossil_collect(1, VirtualTime::new(25)).unwrap();
        assert_eq!(retained, Retained { time: VirtualTime::new(20), cursor: key(20) });
        assert_eq!(store.len(1), 2);
        assert!(store.get_state_before(1, VirtualTime::new(20)).is_none());
    }

    #[test]
    fn equal_position_replaces() {
        let mut store = store();
        store.save(1, Checkpoint { time: VirtualTime::new(30), cursor: key(30), state: 99 });
        assert_eq!(store.len(1), 4);
        assert_eq!(store.get_state_before(1, VirtualTime::INFINITY).unwrap().state, 99);
    }
}
