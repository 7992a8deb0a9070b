//! Logical process timeline.
//!
//! Each LP keeps its whole speculative history until fossil collection:
//! the input queue (processed and pending entries in one ordered map, split
//! by a cursor), the outgoing records of every message it sent, and its
//! per-destination sequence counters.
//!
//! ## Ordering
//!
//! Entries are ordered by `(receive time, rank, sender, seq)`. An arrival
//! ordered before the cursor is a straggler. Processing order is therefore
//! fully determined by message keys, independent of arrival order.
//!
//! RENDEZVOUS_START entries rank after everything else at their time: an
//! owner lends a page only once its own work at that time is done, so two
//! LPs borrowing from each other at the same time never have to undo each
//! other's request.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
};

use bytes::Bytes;
use warpline_proto::{ControlCode, LpId, MessageKey, SeqNo, VirtualTime};

use crate::checkpoint::Retained;

/// Where an entry sorts among entries with the same receive time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Rank {
    /// Events and timeline notifications
    #[default]
    Regular,
    /// RENDEZVOUS_START
    Lend,
}

impl Rank {
    /// Rank of an entry carrying `code`.
    pub fn of(code: Option<ControlCode>) -> Self {
        if code == Some(ControlCode::RendezvousStart) { Self::Lend } else { Self::Regular }
    }
}

/// Position of an entry in an LP's input queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    /// Receive time
    pub time: VirtualTime,
    /// Order among entries at the same time
    pub rank: Rank,
    /// Sending LP
    pub sender: LpId,
    /// Sequence number from that sender
    pub seq: SeqNo,
}

impl EntryKey {
    /// Key of the entry a message with control `code` occupies.
    pub fn of(key: &MessageKey, code: Option<ControlCode>) -> Self {
        Self { time: key.recv_time, rank: Rank::of(code), sender: key.sender, seq: key.seq }
    }
}

/// An input queue entry: an event or a timeline control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Time the sender produced it
    pub send_time: VirtualTime,
    /// `None` for events, otherwise the timeline control code
    pub code: Option<ControlCode>,
    /// Body
    pub payload: Bytes,
}

/// A sent message that may still have to be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingRecord {
    /// Key of the sent message
    pub key: MessageKey,
    /// Control code if it was a timeline control message
    pub code: Option<ControlCode>,
}

/// Outcome of queueing an arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// Ahead of the cursor; will be processed in order
    Queued,
    /// Behind the cursor; the LP must roll back to its time
    Straggler,
    /// Key already present
    Duplicate,
}

/// One logical process.
#[derive(Debug)]
pub struct LogicalProcess<S> {
    id: LpId,
    state: S,
    input: BTreeMap<EntryKey, Entry>,
    cursor: Option<EntryKey>,
    outgoing: Vec<OutgoingRecord>,
    next_seq: HashMap<LpId, SeqNo>,
    blocked_at: Option<VirtualTime>,
    since_checkpoint: u32,
    committed_through: Option<EntryKey>,
    committed: u64,
    trimmed: bool,
    pending_page: Option<S>,
}

impl<S> LogicalProcess<S> {
    /// Fresh LP with initial `state`.
    pub fn new(id: LpId, state: S) -> Self {
        Self {
            id,
            state,
            input: BTreeMap::new(),
            cursor: None,
            outgoing: Vec::new(),
            next_seq: HashMap::new(),
            blocked_at: None,
            since_checkpoint: 0,
            committed_through: None,
            committed: 0,
            trimmed: false,
            pending_page: None,
        }
    }

    /// LP id.
    pub fn id(&self) -> LpId {
        self.id
    }

    /// Current (speculative) state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Mutable state, for the model callback.
    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Replace the state, on recovery or rendezvous completion.
    pub fn set_state(&mut self, state: S) {
        self.state = state;
    }

    /// Last processed entry.
    pub fn cursor(&self) -> Option<EntryKey> {
        self.cursor
    }

    /// Time of the last processed entry.
    pub fn now(&self) -> VirtualTime {
        self.cursor.map_or(VirtualTime::ZERO, |c| c.time)
    }

    /// True if `key` is at or behind the cursor.
    pub fn is_processed(&self, key: EntryKey) -> bool {
        self.cursor.is_some_and(|cursor| key <= cursor)
    }

    /// Queue an arrival.
    pub fn insert(&mut self, key: EntryKey, entry: Entry) -> Insert {
        if self.input.contains_key(&key) {
            return Insert::Duplicate;
        }
        let straggler = self.is_processed(key);
        self.input.insert(key, entry);
        if straggler { Insert::Straggler } else { Insert::Queued }
    }

    /// True if `key` is in the input queue.
    pub fn contains(&self, key: EntryKey) -> bool {
        self.input.contains_key(&key)
    }

    /// Remove an unprocessed entry.
    pub fn remove(&mut self, key: EntryKey) -> Option<Entry> {
        self.input.remove(&key)
    }

    /// Look up an entry.
    pub fn entry(&self, key: EntryKey) -> Option<&Entry> {
        self.input.get(&key)
    }

    /// First entry past the cursor.
    pub fn next_pending(&self) -> Option<(EntryKey, &Entry)> {
        let lower = self.cursor.map_or(Bound::Unbounded, Bound::Excluded);
        self.input.range((lower, Bound::Unbounded)).next().map(|(k, e)| (*k, e))
    }

    /// Time of the first entry past the cursor.
    pub fn next_time(&self) -> Option<VirtualTime> {
        self.next_pending().map(|(key, _)| key.time)
    }

    /// Mark `key` processed. Keys must be taken from
    /// [`next_pending`](Self::next_pending).
    pub fn advance(&mut self, key: EntryKey) {
        self.cursor = Some(key);
        self.since_checkpoint += 1;
    }

    /// Move the cursor back to a restored checkpoint.
    pub fn rewind(&mut self, cursor: Option<EntryKey>) {
        self.cursor = cursor;
        self.since_checkpoint = 0;
    }

    /// Entries after `after` with time strictly before `before`, for silent
    /// re-execution.
    pub fn replay_window(&self, after: Option<EntryKey>, before: VirtualTime) -> Vec<(EntryKey, Entry)> {
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        self.input
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.time < before)
            .map(|(key, entry)| (*key, entry.clone()))
            .collect()
    }

    /// Entries processed since the last checkpoint.
    pub fn since_checkpoint(&self) -> u32 {
        self.since_checkpoint
    }

    /// A checkpoint was just taken.
    pub fn checkpointed(&mut self) {
        self.since_checkpoint = 0;
    }

    /// Allocate the next sequence number towards `dest`.
    pub fn allocate_seq(&mut self, dest: LpId) -> SeqNo {
        let next = self.next_seq.entry(dest).or_insert(1);
        let seq = *next;
        *next += 1;
        seq
    }

    /// Remember a sent message.
    pub fn record(&mut self, record: OutgoingRecord) {
        self.outgoing.push(record);
    }

    /// Outgoing records, in send order.
    pub fn records(&self) -> &[OutgoingRecord] {
        &self.outgoing
    }

    /// Remove every record with send time at or after `from`, rewinding
    /// sequence counters so re-sent messages reuse the freed numbers.
    pub fn take_records_from(&mut self, from: VirtualTime) -> Vec<OutgoingRecord> {
        let split = self.outgoing.partition_point(|r| r.key.send_time < from);
        let undone = self.outgoing.split_off(split);
        for record in &undone {
            let next = self.next_seq.entry(record.key.destination).or_insert(1);
            *next = (*next).min(record.key.seq);
        }
        undone
    }

    /// Time the LP is blocked at, waiting for a rendezvous.
    pub fn blocked_at(&self) -> Option<VirtualTime> {
        self.blocked_at
    }

    /// Block at `time`.
    pub fn block(&mut self, time: VirtualTime) {
        self.blocked_at = Some(time);
    }

    /// Resume processing.
    pub fn unblock(&mut self) {
        self.blocked_at = None;
    }

    /// Park the state produced by a borrowed page until the owner confirms.
    pub fn set_pending_page(&mut self, state: S) {
        self.pending_page = Some(state);
    }

    /// The parked state, if a borrowed page is waiting for confirmation.
    pub fn pending_page_mut(&mut self) -> Option<&mut S> {
        self.pending_page.as_mut()
    }

    /// Take the parked state.
    pub fn take_pending_page(&mut self) -> Option<S> {
        self.pending_page.take()
    }

    /// Events committed so far.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// True once fossil collection dropped history. From then on recovery
    /// needs a checkpoint; replaying from the initial state is no longer
    /// possible.
    pub fn is_trimmed(&self) -> bool {
        self.trimmed
    }

    /// Entries held in the input queue, processed or not.
    pub fn queued(&self) -> usize {
        self.input.len()
    }

    /// Commit everything processed before `gvt` and drop history the
    /// retained checkpoint makes unnecessary. Returns newly committed
    /// events.
    pub fn fossil(&mut self, gvt: VirtualTime, retained: Option<Retained>) -> u64 {
        let lower = self.committed_through.map_or(Bound::Unbounded, Bound::Excluded);
        let mut newly = 0;
        let mut last = None;
        for (key, entry) in self.input.range((lower, Bound::Unbounded)) {
            if key.time >= gvt || !self.cursor.is_some_and(|c| *key <= c) {
                break;
            }
            if entry.code.is_none() {
                newly += 1;
            }
            last = Some(*key);
        }
        if last.is_some() {
            self.committed_through = last;
        }
        self.committed += newly;

        if let Some(Retained { cursor: Some(base), .. }) = retained {
            let mut kept = self.input.split_off(&base);
            kept.remove(&base);
            self.input = kept;
            self.trimmed = true;
        }

        let split = self.outgoing.partition_point(|r| r.key.send_time < gvt);
        self.outgoing.drain(..split);
        newly
    }
}
