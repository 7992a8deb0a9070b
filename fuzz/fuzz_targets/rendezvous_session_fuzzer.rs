//! Fuzz target for the rendezvous session machine
//!
//! Replies can be late, duplicated or meant for an attempt that no longer
//! exists. The engine must sort that out without ever reaching a state the
//! protocol does not allow.
//!
//! # Strategy
//!
//! - Requester steps: begin, transmit, ACK, page chunks, write-back,
//!   UNBLOCK and ROLLBACK with arbitrary marks
//! - Owner steps: open, serve, complete and revoke lends
//! - Time: clock advances, deadline polling, local rollbacks, fossil
//!   collection
//!
//! # Invariants
//!
//! - `Done` is only reached from `WritebackSent`
//! - A new attempt always carries a mark above every earlier one
//! - A rejected step leaves every session state as it was
//! - Expired sessions come back `Idle`
//! - A session left waiting for an ACK expires like any other
//! - Completed and revoked lends are reported stale, never unknown
//! - NEVER panic on unexpected marks or out-of-order replies

#![no_main]

use std::{
    collections::HashMap,
    ops::{Add, Sub},
    time::Duration,
};

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use warpline_core::{Lend, RendezvousEngine, RendezvousError, RetryPolicy, RollbackOutcome, SessionState};
use warpline_proto::{
    VirtualTime,
    payloads::{RendezvousPayload, UnblockReason},
};

const REQUESTERS: u32 = 4;
const PAGES: u32 = 2;
const TIMEOUT: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FuzzInstant(Duration);

impl Add<Duration> for FuzzInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0.saturating_add(rhs))
    }
}

impl Sub for FuzzInstant {
    type Output = Duration;

    fn sub(self, other: Self) -> Duration {
        self.0.saturating_sub(other.0)
    }
}

#[derive(Debug, Clone, Arbitrary)]
enum Step {
    Begin { requester: u8, owner: u8, page: u8, time: u8 },
    Transmit { requester: u8, page: u8 },
    Ack { requester: u8, mark: u8 },
    PageRequested { requester: u8, page: u8 },
    PageChunk { requester: u8, mark: u8, time: u8, index: u8, count: u8, data: Vec<u8> },
    WritebackSent { requester: u8, page: u8 },
    Unblock { requester: u8, mark: u8, busy: bool },
    Rollback { requester: u8, mark: u8 },
    AbortFrom { requester: u8, from: u8 },
    Advance { millis: u8 },
    Poll,
    OpenLend { owner: u8, requester: u8, mark: u8, page: u8, time: u8, data: Vec<u8> },
    WritebackChunk { owner: u8, requester: u8, mark: u8, index: u8, count: u8, data: Vec<u8> },
    CompleteLend { requester: u8, mark: u8 },
    RevokeFrom { owner: u8, from: u8 },
    Fossil { gvt: u8 },
}

type Engine = RendezvousEngine<FuzzInstant>;
type Snapshot = Vec<Option<(u64, SessionState)>>;

fn lp(raw: u8) -> u32 {
    u32::from(raw) % REQUESTERS
}

fn page(raw: u8) -> u32 {
    u32::from(raw) % PAGES
}

fn mark(raw: u8) -> u64 {
    u64::from(raw % 16)
}

fn at(raw: u8) -> VirtualTime {
    VirtualTime::new(u64::from(raw))
}

fn chunk(mark: u64, time: u8, index: u8, count: u8, data: &[u8]) -> RendezvousPayload {
    RendezvousPayload::new(mark, 0).with_chunk(
        at(time),
        u16::from(index % 4),
        u16::from(count % 4),
        Bytes::copy_from_slice(&data[..data.len().min(64)]),
    )
}

fn snapshot(engine: &Engine) -> Snapshot {
    (0..REQUESTERS)
        .flat_map(|r| (0..PAGES).map(move |p| (r, p)))
        .map(|(r, p)| engine.session(r, p).map(|s| (s.mark, s.state)))
        .collect()
}

fn assert_stale(result: Result<&Lend, RendezvousError>) {
    assert!(
        matches!(result, Err(RendezvousError::Stale { .. })),
        "finished lend not reported stale: {result:?}"
    );
}

fuzz_target!(|steps: Vec<Step>| {
    let retry = RetryPolicy {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(8),
        max_attempts: 4,
    };
    let mut engine = Engine::new(TIMEOUT, retry);
    let mut now = FuzzInstant(Duration::ZERO);
    let mut highest_mark = [0u64; REQUESTERS as usize];
    let mut transmitted = HashMap::new();

    for step in steps {
        let before = snapshot(&engine);
        let rejected = match step {
            Step::Begin { requester, owner, page: p, time } => {
                let requester = lp(requester);
                match engine.begin(requester, lp(owner), page(p), at(time)) {
                    Ok(issued) => {
                        let slot = &mut highest_mark[requester as usize];
                        assert!(issued > *slot, "mark {issued} reused after {slot}");
                        *slot = issued;
                        false
                    },
                    Err(_) => true,
                }
            },
            Step::Transmit { requester, page: p } => {
                let (requester, p) = (lp(requester), page(p));
                let ok = engine.transmitted(requester, p, now).is_ok();
                if let Some(session) = engine.session(requester, p).filter(|_| ok) {
                    transmitted.insert((requester, p), (session.mark, now));
                }
                !ok
            },
            Step::Ack { requester, mark: m } => engine.on_ack(lp(requester), mark(m), now).is_err(),
            Step::PageRequested { requester, page: p } => {
                engine.page_requested(lp(requester), page(p), now).is_err()
            },
            Step::PageChunk { requester, mark: m, time, index, count, data } => {
                let chunk = chunk(mark(m), time, index, count, &data);
                engine.on_page_chunk(lp(requester), &chunk, now).is_err()
            },
            Step::WritebackSent { requester, page: p } => {
                engine.writeback_sent(lp(requester), page(p), now).is_err()
            },
            Step::Unblock { requester, mark: m, busy } => {
                let reason = if busy { UnblockReason::Busy } else { UnblockReason::Completed };
                engine.on_unblock(lp(requester), mark(m), reason).is_err()
            },
            Step::Rollback { requester, mark: m } => {
                let requester = lp(requester);
                match engine.on_rollback(requester, mark(m)) {
                    Ok(RollbackOutcome::Aborted { .. }) => {
                        let aborted = (0..PAGES)
                            .filter_map(|p| engine.session(requester, p))
                            .any(|s| s.mark == mark(m) && s.state == SessionState::RolledBack);
                        assert!(aborted, "aborted session not rolled back");
                        false
                    },
                    Ok(RollbackOutcome::ReopenDone { .. }) => false,
                    Err(_) => true,
                }
            },
            Step::AbortFrom { requester, from } => {
                let requester = lp(requester);
                for p in engine.abort_from(requester, at(from)) {
                    let state = engine.session(requester, p).map(|s| s.state);
                    assert_eq!(state, Some(SessionState::RolledBack));
                }
                false
            },
            Step::Advance { millis } => {
                now = now + Duration::from_millis(u64::from(millis));
                false
            },
            Step::Poll => {
                let expired = engine.poll(now);
                for (&(r, p), &(sent_mark, sent_at)) in &transmitted {
                    let waiting = engine
                        .session(r, p)
                        .is_some_and(|s| s.mark == sent_mark && s.state == SessionState::WaitingAck);
                    assert!(!waiting || now < sent_at + TIMEOUT, "START unanswered past its deadline");
                }
                for expired in expired {
                    let state = engine.session(expired.requester, expired.page).map(|s| s.state);
                    assert_eq!(state, Some(SessionState::Idle), "expired session not idle");
                }
                false
            },
            Step::OpenLend { owner, requester, mark: m, page: p, time, data } => {
                let (owner, requester) = (lp(owner), lp(requester));
                let snapshot = Bytes::copy_from_slice(&data[..data.len().min(64)]);
                engine.open_lend(owner, requester, mark(m), page(p), at(time), snapshot.clone());
                let lend = engine.serving(owner, requester, mark(m));
                assert!(lend.is_ok_and(|lend| lend.snapshot == snapshot));
                assert!(engine.lending(owner));
                false
            },
            Step::WritebackChunk { owner, requester, mark: m, index, count, data } => {
                let chunk = chunk(mark(m), 0, index, count, &data);
                engine.on_writeback_chunk(lp(owner), lp(requester), &chunk).is_err()
            },
            Step::CompleteLend { requester, mark: m } => {
                let requester = lp(requester);
                if let Some(record) = engine.complete_lend(requester, mark(m)) {
                    assert_stale(engine.serving(record.owner, requester, record.mark));
                }
                false
            },
            Step::RevokeFrom { owner, from } => {
                let owner = lp(owner);
                for record in engine.revoke_from(owner, at(from)) {
                    assert_stale(engine.serving(owner, record.requester, record.mark));
                }
                false
            },
            Step::Fossil { gvt } => {
                engine.fossil_collect(at(gvt));
                false
            },
        };

        let after = snapshot(&engine);
        if rejected {
            assert_eq!(before, after, "rejected step changed a session");
        }
        for (old, new) in before.iter().zip(&after) {
            if let (Some((old_mark, old_state)), Some((new_mark, SessionState::Done))) = (old, new) {
                if old_mark == new_mark && *old_state != SessionState::Done {
                    assert_eq!(*old_state, SessionState::WritebackSent, "Done reached from {old_state:?}");
                }
            }
        }
        let active_min = (0..REQUESTERS)
            .flat_map(|r| (0..PAGES).map(move |p| (r, p)))
            .filter_map(|(r, p)| engine.session(r, p))
            .filter(|s| s.state.is_active())
            .map(|s| s.time)
            .min();
        if let Some(active) = active_min {
            assert!(engine.min_open_time().is_some_and(|t| t <= active));
        }
    }
});
