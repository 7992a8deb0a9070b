//! Rendezvous engine.
//!
//! Bookkeeping for cross-node page borrowing. The engine never sends
//! anything itself; the node calls it for every step and acts on what it
//! returns.
//!
//! ## Requester sessions
//!
//! ```text
//! IDLE ─> START_SENT ─> WAITING_ACK ─> ACKED ─> PAGE_REQUESTED
//!   ▲          │             │                         │
//!   └── busy / timeout ──────┘                  PAGE_RECEIVED
//!                                                      │
//!                               DONE <─ completed ─ WRITEBACK_SENT
//!
//! ROLLED_BACK: any state except DONE, on RENDEZVOUS_ROLLBACK or local rollback
//! ```
//!
//! Every state from WAITING_ACK to WRITEBACK_SENT carries a reply deadline;
//! [`RendezvousEngine::poll`] returns the sessions that missed it.
//!
//! At most one active session exists per `(requester, page)`. Each attempt
//! gets a fresh mark, unique per requester, and replies are matched by
//! mark. Marks of replaced or undone attempts are kept as tombstones so
//! late replies are recognised as stale rather than reported as unknown.
//!
//! ## Owner lends
//!
//! An owner that served a START is blocked at the session time until the
//! write-back completes. An owner may lend while it is itself waiting for a
//! page at the same time, but only to a requester with a lower id; that
//! keeps same-time borrowing free of cycles. The page is copied when the
//! lend opens, so the requester sees it as of the session time whatever
//! the owner does meanwhile.
//!
//! Completed lends are remembered until GVT passes them: if the owner later
//! rolls back past one, the requester has to be told.

use std::{
    collections::HashMap,
    ops::{Add, Sub},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;
use warpline_proto::{
    LpId, PageId, VirtualTime,
    payloads::{RendezvousPayload, UnblockReason},
};

use crate::config::RetryPolicy;

/// Requester-side session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Previous attempt abandoned; waiting to retry
    Idle,
    /// START queued
    StartSent,
    /// START transmitted, waiting for ACK
    WaitingAck,
    /// Owner accepted
    Acked,
    /// GET_PAGE sent
    PageRequested,
    /// Every chunk of the page arrived
    PageReceived,
    /// Modified page sent back
    WritebackSent,
    /// Owner applied the write-back
    Done,
    /// Abandoned
    RolledBack,
}

impl SessionState {
    /// `Done` or `RolledBack`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::RolledBack)
    }

    /// An attempt is in flight.
    pub const fn is_active(self) -> bool {
        !self.is_terminal() && !matches!(self, Self::Idle)
    }
}

/// Rendezvous bookkeeping failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RendezvousError {
    /// A session for this pair is already in flight. Retry later.
    #[error("LP {requester} already has an active session for page {page}")]
    SessionActive {
        /// Requesting LP
        requester: LpId,
        /// Page
        page: PageId,
    },

    /// The step does not apply in the current state.
    #[error("{step} not valid in state {state:?}")]
    InvalidTransition {
        /// Current state
        state: SessionState,
        /// Step attempted
        step: &'static str,
    },

    /// Mark never issued, or never lent.
    #[error("no session for requester {requester} mark {mark}")]
    UnknownSession {
        /// Requesting LP
        requester: LpId,
        /// Session mark
        mark: u64,
    },

    /// Mark belongs to an abandoned or finished attempt.
    #[error("stale traffic for requester {requester} mark {mark}")]
    Stale {
        /// Requesting LP
        requester: LpId,
        /// Session mark
        mark: u64,
    },

    /// Page snapshot taken at a different time than the session.
    #[error("snapshot at {got} does not match session time {expected}")]
    SnapshotMismatch {
        /// Session time
        expected: VirtualTime,
        /// Snapshot time received
        got: VirtualTime,
    },

    /// Chunk does not belong to the transfer in progress.
    #[error("chunk {index}/{count} does not fit a transfer of {expected} chunks")]
    ChunkMismatch {
        /// Chunk index
        index: u16,
        /// Chunk count claimed
        count: u16,
        /// Count of the transfer in progress
        expected: u16,
    },

    /// Busy or timed out too many times.
    #[error("LP {requester} gave up on page {page} after {attempts} attempts")]
    Exhausted {
        /// Requesting LP
        requester: LpId,
        /// Page
        page: PageId,
        /// Attempts made
        attempts: u32,
    },
}

impl RendezvousError {
    /// Late traffic for an attempt that already ended. Expected under
    /// rollback; not a protocol violation.
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

/// Reassembles a chunked page.
#[derive(Debug, Default, Clone)]
struct Assembly {
    parts: Vec<Option<Bytes>>,
}

impl Assembly {
    fn accept(&mut self, index: u16, count: u16, data: Bytes) -> Result<Option<Bytes>, RendezvousError> {
        if self.parts.is_empty() {
            if count == 0 {
                return Err(RendezvousError::ChunkMismatch { index, count, expected: 0 });
            }
            self.parts = vec![None; usize::from(count)];
        }
        let expected = u16::try_from(self.parts.len()).unwrap_or(u16::MAX);
        let Some(slot) = self.parts.get_mut(usize::from(index)).filter(|_| count == expected) else {
            return Err(RendezvousError::ChunkMismatch { index, count, expected });
        };
        *slot = Some(data);

        if self.parts.iter().any(Option::is_none) {
            return Ok(None);
        }
        let mut page = BytesMut::new();
        for part in self.parts.drain(..).flatten() {
            page.extend_from_slice(&part);
        }
        Ok(Some(page.freeze()))
    }
}

/// One requester-side attempt.
#[derive(Debug, Clone)]
pub struct Session<I> {
    /// Requesting LP
    pub requester: LpId,
    /// Owning LP
    pub owner: LpId,
    /// Page
    pub page: PageId,
    /// Attempt mark
    pub mark: u64,
    /// Time of the requesting event
    pub time: VirtualTime,
    /// Current state
    pub state: SessionState,
    /// Reply deadline, if one applies in this state
    pub deadline: Option<I>,
    /// Attempts made for this request, including this one
    pub attempts: u32,
    page_data: Assembly,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    time: VirtualTime,
    /// A finished attempt whose effect the requester still carries
    effective: bool,
}

/// An owner-side lend.
#[derive(Debug, Clone)]
pub struct Lend {
    /// Owning LP
    pub owner: LpId,
    /// Requesting LP
    pub requester: LpId,
    /// Attempt mark
    pub mark: u64,
    /// Page
    pub page: PageId,
    /// Time of the START entry
    pub time: VirtualTime,
    /// Page contents when the lend opened
    pub snapshot: Bytes,
    writeback: Assembly,
}

/// Lend that may have to be revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LendRecord {
    /// Owning LP
    pub owner: LpId,
    /// Requesting LP
    pub requester: LpId,
    /// Attempt mark
    pub mark: u64,
    /// Page
    pub page: PageId,
    /// Time of the START entry
    pub time: VirtualTime,
}

impl From<&Lend> for LendRecord {
    fn from(lend: &Lend) -> Self {
        Self {
            owner: lend.owner,
            requester: lend.requester,
            mark: lend.mark,
            page: lend.page,
            time: lend.time,
        }
    }
}

/// Requester reaction to RENDEZVOUS_UNBLOCK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockOutcome {
    /// Owner applied the write-back
    Completed {
        /// Session time
        time: VirtualTime,
    },
    /// Owner could not serve; retry after backoff
    Retry {
        /// Session time
        time: VirtualTime,
        /// Attempts so far
        attempts: u32,
    },
}

/// Requester reaction to RENDEZVOUS_ROLLBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Attempt in flight abandoned
    Aborted {
        /// Session time
        time: VirtualTime,
    },
    /// A finished attempt was undone by the owner; the requester must roll
    /// back to `time`
    ReopenDone {
        /// Session time
        time: VirtualTime,
    },
}

/// A session whose reply deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    /// Requesting LP
    pub requester: LpId,
    /// Page
    pub page: PageId,
    /// Attempt mark
    pub mark: u64,
    /// Session time
    pub time: VirtualTime,
    /// Attempts so far
    pub attempts: u32,
}

/// Both sides of the rendezvous protocol for one node.
#[derive(Debug)]
pub struct RendezvousEngine<I> {
    timeout: Duration,
    retry: RetryPolicy,
    sessions: HashMap<(LpId, PageId), Session<I>>,
    marks: HashMap<(LpId, u64), PageId>,
    retired: HashMap<(LpId, u64), Tombstone>,
    next_mark: HashMap<LpId, u64>,
    lends: HashMap<(LpId, u64), Lend>,
    lent: Vec<LendRecord>,
    revoked: HashMap<(LpId, u64), VirtualTime>,
}

impl<I> RendezvousEngine<I>
where
    I: Copy + Ord + Add<Duration, Output = I> + Sub<Output = Duration>,
{
    /// Engine with a reply `timeout` and retry policy.
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            timeout,
            retry,
            sessions: HashMap::new(),
            marks: HashMap::new(),
            retired: HashMap::new(),
            next_mark: HashMap::new(),
            lends: HashMap::new(),
            lent: Vec::new(),
            revoked: HashMap::new(),
        }
    }

    /// Session for `(requester, page)`, if any.
    pub fn session(&self, requester: LpId, page: PageId) -> Option<&Session<I>> {
        self.sessions.get(&(requester, page))
    }

    /// Open lend for `(requester, mark)`.
    pub fn lend(&self, requester: LpId, mark: u64) -> Option<&Lend> {
        self.lends.get(&(requester, mark))
    }

    /// Open lends.
    pub fn open_lends(&self) -> usize {
        self.lends.len()
    }

    /// Backoff before retry number `attempts`.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        self.retry.backoff(attempts)
    }

    // Requester side

    /// Start an attempt. Returns the mark to put in RENDEZVOUS_START.
    pub fn begin(
        &mut self,
        requester: LpId,
        owner: LpId,
        page: PageId,
        time: VirtualTime,
    ) -> Result<u64, RendezvousError> {
        let attempts = match self.sessions.get(&(requester, page)) {
            Some(session) if session.state.is_active() => {
                return Err(RendezvousError::SessionActive { requester, page });
            },
            Some(session) if session.state == SessionState::Idle => session.attempts + 1,
            _ => 1,
        };
        if attempts > self.retry.max_attempts {
            return Err(RendezvousError::Exhausted { requester, page, attempts: attempts - 1 });
        }

        if let Some(previous) = self.sessions.remove(&(requester, page)) {
            self.retire(&previous);
        }

        let counter = self.next_mark.entry(requester).or_insert(0);
        *counter += 1;
        let mark = *counter;

        self.marks.insert((requester, mark), page);
        self.sessions.insert(
            (requester, page),
            Session {
                requester,
                owner,
                page,
                mark,
                time,
                state: SessionState::StartSent,
                deadline: None,
                attempts,
                page_data: Assembly::default(),
            },
        );
        debug!(requester, owner, page, mark, %time, attempts, "rendezvous started");
        Ok(mark)
    }

    fn retire(&mut self, session: &Session<I>) {
        self.marks.remove(&(session.requester, session.mark));
        self.retired.insert(
            (session.requester, session.mark),
            Tombstone { time: session.time, effective: session.state == SessionState::Done },
        );
    }

    fn locate(&self, requester: LpId, mark: u64) -> Result<(LpId, PageId), RendezvousError> {
        let current = self
            .marks
            .get(&(requester, mark))
            .copied()
            .filter(|page| self.sessions.get(&(requester, *page)).is_some_and(|s| s.mark == mark));
        match current {
            Some(page) => Ok((requester, page)),
            None if self.retired.contains_key(&(requester, mark)) => {
                Err(RendezvousError::Stale { requester, mark })
            },
            None => Err(RendezvousError::UnknownSession { requester, mark }),
        }
    }

    fn session_mut(&mut self, requester: LpId, mark: u64) -> Result<&mut Session<I>, RendezvousError> {
        let key = self.locate(requester, mark)?;
        self.sessions.get_mut(&key).ok_or(RendezvousError::UnknownSession { requester, mark })
    }

    /// Live session for a reply, treating replies to finished or idle
    /// attempts as stale.
    fn live_mut(&mut self, requester: LpId, mark: u64) -> Result<&mut Session<I>, RendezvousError> {
        let session = self.session_mut(requester, mark)?;
        if !session.state.is_active() {
            return Err(RendezvousError::Stale { requester, mark });
        }
        Ok(session)
    }

    fn step(
        session: &mut Session<I>,
        from: &[SessionState],
        to: SessionState,
        step: &'static str,
    ) -> Result<(), RendezvousError> {
        if !from.contains(&session.state) {
            return Err(RendezvousError::InvalidTransition { state: session.state, step });
        }
        session.state = to;
        Ok(())
    }

    /// The START left the node; the ACK is due within the reply timeout.
    pub fn transmitted(&mut self, requester: LpId, page: PageId, now: I) -> Result<(), RendezvousError> {
        let timeout = self.timeout;
        let session = self
            .sessions
            .get_mut(&(requester, page))
            .ok_or(RendezvousError::UnknownSession { requester, mark: 0 })?;
        Self::step(session, &[SessionState::StartSent], SessionState::WaitingAck, "transmit")?;
        session.deadline = Some(now + timeout);
        Ok(())
    }

    /// RENDEZVOUS_ACK arrived. Returns `(owner, page, time)` for GET_PAGE.
    pub fn on_ack(
        &mut self,
        requester: LpId,
        mark: u64,
        now: I,
    ) -> Result<(LpId, PageId, VirtualTime), RendezvousError> {
        let timeout = self.timeout;
        let session = self.live_mut(requester, mark)?;
        Self::step(
            session,
            &[SessionState::StartSent, SessionState::WaitingAck],
            SessionState::Acked,
            "ack",
        )?;
        session.deadline = Some(now + timeout);
        Ok((session.owner, session.page, session.time))
    }

    /// GET_PAGE sent.
    pub fn page_requested(&mut self, requester: LpId, page: PageId, now: I) -> Result<(), RendezvousError> {
        let timeout = self.timeout;
        let session = self
            .sessions
            .get_mut(&(requester, page))
            .ok_or(RendezvousError::UnknownSession { requester, mark: 0 })?;
        Self::step(session, &[SessionState::Acked], SessionState::PageRequested, "get_page")?;
        session.deadline = Some(now + timeout);
        Ok(())
    }

    /// A GET_PAGE_ACK chunk arrived. Returns the page once complete.
    pub fn on_page_chunk(
        &mut self,
        requester: LpId,
        chunk: &RendezvousPayload,
        now: I,
    ) -> Result<Option<(PageId, Bytes)>, RendezvousError> {
        let timeout = self.timeout;
        let session = self.live_mut(requester, chunk.mark)?;
        if session.state != SessionState::PageRequested {
            return Err(RendezvousError::InvalidTransition { state: session.state, step: "page_chunk" });
        }
        if chunk.snapshot_time != session.time {
            return Err(RendezvousError::SnapshotMismatch {
                expected: session.time,
                got: chunk.snapshot_time,
            });
        }
        session.deadline = Some(now + timeout);
        match session.page_data.accept(chunk.chunk_index, chunk.chunk_count, chunk.data.clone())? {
            Some(page) => {
                session.state = SessionState::PageReceived;
                Ok(Some((session.page, page)))
            },
            None => Ok(None),
        }
    }

    /// Write-back chunks sent.
    pub fn writeback_sent(&mut self, requester: LpId, page: PageId, now: I) -> Result<(), RendezvousError> {
        let timeout = self.timeout;
        let session = self
            .sessions
            .get_mut(&(requester, page))
            .ok_or(RendezvousError::UnknownSession { requester, mark: 0 })?;
        Self::step(session, &[SessionState::PageReceived], SessionState::WritebackSent, "writeback")?;
        session.deadline = Some(now + timeout);
        Ok(())
    }

    /// RENDEZVOUS_UNBLOCK arrived.
    pub fn on_unblock(
        &mut self,
        requester: LpId,
        mark: u64,
        reason: UnblockReason,
    ) -> Result<UnblockOutcome, RendezvousError> {
        let session = self.live_mut(requester, mark)?;
        session.deadline = None;
        match reason {
            UnblockReason::Completed => {
                Self::step(session, &[SessionState::WritebackSent], SessionState::Done, "unblock")?;
                Ok(UnblockOutcome::Completed { time: session.time })
            },
            UnblockReason::Busy => {
                Self::step(
                    session,
                    &[SessionState::StartSent, SessionState::WaitingAck],
                    SessionState::Idle,
                    "busy",
                )?;
                Ok(UnblockOutcome::Retry { time: session.time, attempts: session.attempts })
            },
        }
    }

    /// RENDEZVOUS_ROLLBACK arrived.
    pub fn on_rollback(&mut self, requester: LpId, mark: u64) -> Result<RollbackOutcome, RendezvousError> {
        if let Some(tombstone) = self.retired.get_mut(&(requester, mark)) {
            if tombstone.effective {
                tombstone.effective = false;
                return Ok(RollbackOutcome::ReopenDone { time: tombstone.time });
            }
            return Err(RendezvousError::Stale { requester, mark });
        }

        let session = self.session_mut(requester, mark)?;
        session.deadline = None;
        match session.state {
            SessionState::Done => Ok(RollbackOutcome::ReopenDone { time: session.time }),
            state if state.is_active() => {
                session.state = SessionState::RolledBack;
                session.page_data = Assembly::default();
                Ok(RollbackOutcome::Aborted { time: session.time })
            },
            _ => Err(RendezvousError::Stale { requester, mark }),
        }
    }

    /// The requester rolled back to `from`: attempts at or after it are
    /// abandoned and finished ones no longer count. Returns the pages of
    /// aborted in-flight attempts.
    pub fn abort_from(&mut self, requester: LpId, from: VirtualTime) -> Vec<PageId> {
        let mut aborted = Vec::new();
        let mut undone = Vec::new();
        for ((lp, page), session) in &mut self.sessions {
            if *lp != requester || session.time < from {
                continue;
            }
            if session.state.is_active() {
                session.state = SessionState::RolledBack;
                session.deadline = None;
                session.page_data = Assembly::default();
                aborted.push(*page);
            } else if session.state == SessionState::Done {
                undone.push(*page);
            }
        }
        for page in undone {
            if let Some(session) = self.sessions.remove(&(requester, page)) {
                self.retire(&session);
                if let Some(tombstone) = self.retired.get_mut(&(requester, session.mark)) {
                    tombstone.effective = false;
                }
            }
        }
        for ((lp, _), tombstone) in &mut self.retired {
            if *lp == requester && tombstone.time >= from {
                tombstone.effective = false;
            }
        }
        aborted
    }

    /// Sessions whose deadline passed move to `Idle` and are returned for
    /// retry.
    pub fn poll(&mut self, now: I) -> Vec<Expired> {
        let mut expired = Vec::new();
        for session in self.sessions.values_mut() {
            if session.state.is_active() && session.deadline.is_some_and(|d| d <= now) {
                session.state = SessionState::Idle;
                session.deadline = None;
                session.page_data = Assembly::default();
                expired.push(Expired {
                    requester: session.requester,
                    page: session.page,
                    mark: session.mark,
                    time: session.time,
                    attempts: session.attempts,
                });
            }
        }
        expired.sort_by_key(|e| (e.requester, e.page));
        expired
    }

    /// True if `requester` is blocked on an attempt at exactly `time`.
    pub fn requesting_at(&self, requester: LpId, time: VirtualTime) -> bool {
        self.owner_at(requester, time).is_some()
    }

    /// Owner of the page `requester` is waiting for at `time`.
    pub fn owner_at(&self, requester: LpId, time: VirtualTime) -> Option<LpId> {
        self.sessions
            .values()
            .find(|s| s.requester == requester && s.time == time && s.state.is_active())
            .map(|s| s.owner)
    }

    // Owner side

    /// The owner's timeline reached a START: it is now lending.
    pub fn open_lend(
        &mut self,
        owner: LpId,
        requester: LpId,
        mark: u64,
        page: PageId,
        time: VirtualTime,
        snapshot: Bytes,
    ) {
        self.revoked.remove(&(requester, mark));
        self.lends.insert(
            (requester, mark),
            Lend { owner, requester, mark, page, time, snapshot, writeback: Assembly::default() },
        );
    }

    /// True while `owner` has a page out on loan.
    pub fn lending(&self, owner: LpId) -> bool {
        self.lends.values().any(|l| l.owner == owner)
    }

    /// Open lend `owner` is serving to `requester` under `mark`.
    pub fn serving(&self, owner: LpId, requester: LpId, mark: u64) -> Result<&Lend, RendezvousError> {
        match self.lends.get(&(requester, mark)) {
            Some(lend) if lend.owner == owner => Ok(lend),
            _ if self.revoked.contains_key(&(requester, mark))
                || self.lent.iter().any(|l| l.requester == requester && l.mark == mark) =>
            {
                Err(RendezvousError::Stale { requester, mark })
            },
            _ => Err(RendezvousError::UnknownSession { requester, mark }),
        }
    }

    /// A PAGE_WRITE_BACK chunk arrived. Returns the complete page.
    pub fn on_writeback_chunk(
        &mut self,
        owner: LpId,
        requester: LpId,
        chunk: &RendezvousPayload,
    ) -> Result<Option<(LendRecord, Bytes)>, RendezvousError> {
        let mark = chunk.mark;
        self.serving(owner, requester, mark)?;
        let Some(lend) = self.lends.get_mut(&(requester, mark)) else {
            return Err(RendezvousError::UnknownSession { requester, mark });
        };
        let page = lend.writeback.accept(chunk.chunk_index, chunk.chunk_count, chunk.data.clone())?;
        Ok(page.map(|page| (LendRecord::from(&*lend), page)))
    }

    /// Write-back applied; keep the lend until GVT passes it.
    pub fn complete_lend(&mut self, requester: LpId, mark: u64) -> Option<LendRecord> {
        let lend = self.lends.remove(&(requester, mark))?;
        let record = LendRecord::from(&lend);
        self.lent.push(record);
        Some(record)
    }

    /// The owner rolled back to `from`: every lend at or after it, open or
    /// finished, is revoked.
    pub fn revoke_from(&mut self, owner: LpId, from: VirtualTime) -> Vec<LendRecord> {
        let mut revoked: Vec<LendRecord> = self
            .lends
            .values()
            .filter(|l| l.owner == owner && l.time >= from)
            .map(LendRecord::from)
            .collect();
        for record in &revoked {
            self.lends.remove(&(record.requester, record.mark));
        }
        let (undone, kept): (Vec<_>, Vec<_>) =
            self.lent.drain(..).partition(|l| l.owner == owner && l.time >= from);
        self.lent = kept;
        revoked.extend(undone);
        revoked.sort_by_key(|r| (r.time, r.requester, r.mark));
        for record in &revoked {
            self.revoked.insert((record.requester, record.mark), record.time);
        }
        revoked
    }

    // Shared

    /// Earliest time an open session or lend could still roll something
    /// back to.
    pub fn min_open_time(&self) -> Option<VirtualTime> {
        let sessions = self.sessions.values().filter(|s| s.state.is_active()).map(|s| s.time);
        let lends = self.lends.values().map(|l| l.time);
        sessions.chain(lends).min()
    }

    /// Forget everything GVT has passed.
    pub fn fossil_collect(&mut self, gvt: VirtualTime) {
        let finished: Vec<_> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.time < gvt && !s.state.is_active())
            .map(|(key, s)| (*key, s.mark))
            .collect();
        for (key, mark) in finished {
            self.sessions.remove(&key);
            self.marks.remove(&(key.0, mark));
        }
        self.retired.retain(|_, t| t.time >= gvt);
        self.lent.retain(|l| l.time >= gvt);
        self.revoked.retain(|_, time| *time >= gvt);
    }
}
