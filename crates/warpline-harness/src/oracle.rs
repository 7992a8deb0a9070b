//! Sequential reference simulator.
//!
//! Executes the same [`Model`] one event at a time in global timestamp
//! order, with no speculation, no rollback and no network. Entries are keyed
//! exactly as the optimistic engine keys them: `(time, sender, seq)` per
//! destination, sequence numbers counted per LP pair from 1, and initial
//! events sent by [`INITIAL_SENDER`] numbered in seeding order. A correct
//! optimistic run must therefore commit the same events in the same order
//! and end in the same LP states.
//!
//! Rendezvous are out of scope: a model that requests a page makes the
//! oracle fail.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use bytes::Bytes;
use warpline_core::{EventContext, INITIAL_SENDER, Model, Route, Scheduled, route};
use warpline_proto::{ControlCode, LpId, SeqNo, VirtualTime};

/// Why the oracle could not finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// The model asked for a page.
    PageRequested {
        /// Requesting LP
        lp: LpId,
        /// Time of the request
        at: VirtualTime,
    },
    /// A message named an LP outside the simulation.
    UnknownLp(LpId),
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PageRequested { lp, at } => write!(f, "LP {lp} requested a page at {at}"),
            Self::UnknownLp(lp) => write!(f, "unknown LP {lp}"),
        }
    }
}

impl std::error::Error for OracleError {}

/// What the sequential run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRun<S> {
    /// Final state of every LP
    pub states: BTreeMap<LpId, S>,
    /// Application events executed at or before the end time
    pub committed: u64,
}

/// `(time, destination, sender, seq)`: destination-major within a
/// timestamp, `(time, sender, seq)` within one destination.
type Key = (VirtualTime, LpId, LpId, SeqNo);

/// Run `model` over `lps` LPs from `initial` until no event at or before
/// `end` remains.
pub fn sequential<M: Model>(
    model: &M,
    lps: u32,
    initial: &[(LpId, VirtualTime, Bytes)],
    end: VirtualTime,
) -> Result<OracleRun<M::State>, OracleError> {
    let mut states: BTreeMap<LpId, M::State> = (0..lps).map(|lp| (lp, model.init(lp))).collect();
    let mut pending: BTreeMap<Key, (Option<ControlCode>, Bytes)> = BTreeMap::new();
    let mut seqs: HashMap<(LpId, LpId), SeqNo> = HashMap::new();

    let mut seeded: HashMap<LpId, SeqNo> = HashMap::new();
    for (lp, at, payload) in initial {
        if *lp >= lps {
            return Err(OracleError::UnknownLp(*lp));
        }
        let seq = seeded.entry(*lp).or_default();
        *seq += 1;
        pending.insert((*at, *lp, INITIAL_SENDER, *seq), (None, payload.clone()));
    }

    let mut committed = 0;
    while let Some(((time, lp, _, _), (code, payload))) = pending.pop_first() {
        if time > end {
            break;
        }
        let state = states.get_mut(&lp).ok_or(OracleError::UnknownLp(lp))?;
        let mut ctx = EventContext::new(lp, time, false);
        match code.map(route) {
            None => {
                model.on_event(&mut ctx, state, &payload);
                committed += 1;
            },
            Some(Route::Topology) => model.on_topology_update(&mut ctx, state, &payload),
            Some(Route::Agent(event)) => model.on_agent(&mut ctx, state, event, &payload),
            Some(Route::Rendezvous(_)) => {},
        }

        let (scheduled, request) = ctx.into_parts();
        if request.is_some() {
            return Err(OracleError::PageRequested { lp, at: time });
        }
        for out in scheduled {
            let (dest, at, code, payload) = match out {
                Scheduled::Event { dest, at, payload } => (dest, at, None, payload),
                Scheduled::Control { dest, at, code, payload } => (dest, at, Some(code), payload),
            };
            if dest >= lps {
                return Err(OracleError::UnknownLp(dest));
            }
            let seq = seqs.entry((lp, dest)).or_default();
            *seq += 1;
            pending.insert((at, dest, lp, *seq), (code, payload));
        }
    }

    Ok(OracleRun { states, committed })
}
