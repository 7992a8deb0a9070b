//! GVT computation.
//!
//! Mattern-style cut with message colouring. Every message is stamped with
//! the sender's current [`PhaseColour`] and counted per colour on both
//! sides. A round flips every node to the next colour; the master then
//! learns how many messages of the closing colour each node must receive.
//! Once a node has received that many, nothing of the old colour is in
//! flight towards it, and it reports
//!
//! ```text
//! local_min = min(next unprocessed entry per LP,
//!                 messages queued or sent since the flip,
//!                 open rendezvous sessions)
//! ```
//!
//! The master reduces with `min`, clamps to stay monotone and publishes the
//! value. The next round starts only after every node adopted the previous
//! one.
//!
//! # Round flow
//!
//! ```text
//! master                       participant i
//!   Start{r}        ─────────>   flush queues, flip colour
//!                   <─────────   WhiteCounts{r, sent per destination}
//!   Expected{r, n_i} ────────>   wait until n_i old-colour messages arrived
//!                   <─────────   LocalMin{r, min}
//!   NewGvt{r, gvt}  ─────────>   fossil collect, statistics_on_gvt
//!                   <─────────   Adopted{r}
//! ```

use std::{
    collections::BTreeSet,
    ops::{Add, Sub},
    time::Duration,
};

use tracing::{debug, error, info};
use warpline_proto::{NodeId, PhaseColour, VirtualTime, payloads::GvtMessage};

use crate::error::CoreError;

/// Node that drives rounds.
pub const MASTER: NodeId = 0;

/// Per-node send/receive accounting by colour.
#[derive(Debug, Clone)]
pub struct PhaseLedger {
    colour: PhaseColour,
    sent: [Vec<u64>; 4],
    received: [u64; 4],
    closing: Option<PhaseColour>,
    min_since_flip: VirtualTime,
}

impl PhaseLedger {
    /// Ledger for a federation of `nodes` nodes.
    pub fn new(nodes: u32) -> Self {
        let per_node = vec![0; nodes as usize];
        Self {
            colour: PhaseColour::default(),
            sent: [per_node.clone(), per_node.clone(), per_node.clone(), per_node],
            received: [0; 4],
            closing: None,
            min_since_flip: VirtualTime::INFINITY,
        }
    }

    /// Colour stamped on messages sent now.
    pub fn colour(&self) -> PhaseColour {
        self.colour
    }

    /// Account for a message to `dest` taking effect at `recv_time`.
    /// Returns the colour to stamp.
    pub fn on_send(&mut self, dest: NodeId, recv_time: VirtualTime) -> PhaseColour {
        if let Some(count) = self.sent[self.colour.index()].get_mut(dest as usize) {
            *count += 1;
        }
        self.min_since_flip = self.min_since_flip.min(recv_time);
        self.colour
    }

    /// Account for a message received with `colour`.
    pub fn on_receive(&mut self, colour: PhaseColour) {
        self.received[colour.index()] += 1;
    }

    /// Move to the next colour, returning what was sent in the old one per
    /// destination node.
    pub fn flip(&mut self) -> Vec<u64> {
        let old = self.colour;
        let counts = self.sent[old.index()].clone();
        self.sent[old.index()].fill(0);
        self.closing = Some(old);
        self.colour = old.next();
        self.min_since_flip = VirtualTime::INFINITY;
        counts
    }

    /// Messages of the closing colour received so far.
    pub fn closing_received(&self) -> u64 {
        self.closing.map_or(0, |c| self.received[c.index()])
    }

    /// Earliest receive time among messages sent since the last flip.
    pub fn min_since_flip(&self) -> VirtualTime {
        self.min_since_flip
    }

    /// The closing colour has been fully received; forget its count.
    pub fn settle(&mut self, expected: u64) {
        if let Some(closing) = self.closing.take() {
            let slot = &mut self.received[closing.index()];
            *slot = slot.saturating_sub(expected);
        }
    }
}

/// A GVT round as the master sees it.
#[derive(Debug)]
struct RoundInFlight<I> {
    round: u64,
    started_at: I,
    counts: Vec<Option<Vec<u64>>>,
    minima: Vec<Option<VirtualTime>>,
    adopted: Vec<bool>,
}

impl<I> RoundInFlight<I> {
    fn new(round: u64, started_at: I, nodes: usize) -> Self {
        Self {
            round,
            started_at,
            counts: vec![None; nodes],
            minima: vec![None; nodes],
            adopted: vec![false; nodes],
        }
    }

    fn missing(&self) -> Vec<NodeId> {
        let pending: Vec<bool> = if self.counts.iter().any(Option::is_none) {
            self.counts.iter().map(Option::is_none).collect()
        } else if self.minima.iter().any(Option::is_none) {
            self.minima.iter().map(Option::is_none).collect()
        } else {
            self.adopted.iter().map(|a| !a).collect()
        };
        pending
            .iter()
            .enumerate()
            .filter(|(_, missing)| **missing)
            .filter_map(|(node, _)| NodeId::try_from(node).ok())
            .collect()
    }
}

#[derive(Debug, Default)]
struct Participant {
    round: u64,
    expected: Option<u64>,
    reported: bool,
}

/// Completed round, kept as immutable history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundRecord {
    /// Round number
    pub round: u64,
    /// Adopted GVT
    pub gvt: VirtualTime,
}

/// Result of adopting a published GVT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adoption {
    /// Round adopted
    pub round: u64,
    /// GVT before this round
    pub previous: VirtualTime,
    /// GVT after this round
    pub gvt: VirtualTime,
}

/// Outbound GVT traffic: destination node and message.
pub type GvtOutbox = Vec<(NodeId, GvtMessage)>;

/// Both roles of the GVT protocol for one node.
#[derive(Debug)]
pub struct GvtCoordinator<I> {
    node: NodeId,
    nodes: u32,
    period: Duration,
    liveness: Duration,
    gvt: VirtualTime,
    participant: Participant,
    next_round: u64,
    in_flight: Option<RoundInFlight<I>>,
    last_finished: Option<I>,
    fini_from: BTreeSet<NodeId>,
    fini_sent: bool,
    history: Vec<RoundRecord>,
}

impl<I> GvtCoordinator<I>
where
    I: Copy + Ord + std::fmt::Debug + Add<Duration, Output = I> + Sub<Output = Duration>,
{
    /// Coordinator for `node` in a federation of `nodes`.
    pub fn new(node: NodeId, nodes: u32, period: Duration, liveness: Duration) -> Self {
        Self {
            node,
            nodes: nodes.max(1),
            period,
            liveness,
            gvt: VirtualTime::ZERO,
            participant: Participant::default(),
            next_round: 1,
            in_flight: None,
            last_finished: None,
            fini_from: BTreeSet::new(),
            fini_sent: false,
            history: Vec::new(),
        }
    }

    /// True on the node that drives rounds.
    pub fn is_master(&self) -> bool {
        self.node == MASTER
    }

    /// Last adopted GVT.
    pub fn gvt(&self) -> VirtualTime {
        self.gvt
    }

    /// Round this node last joined.
    pub fn round(&self) -> u64 {
        self.participant.round
    }

    /// Completed rounds, oldest first.
    pub fn history(&self) -> &[RoundRecord] {
        &self.history
    }

    /// True while the master has a round open.
    pub fn round_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    fn broadcast(&self, msg: &GvtMessage) -> GvtOutbox {
        (0..self.nodes).map(|node| (node, msg.clone())).collect()
    }

    /// Master timer: start a round when due, enforce the liveness bound.
    pub fn poll(&mut self, now: I) -> Result<GvtOutbox, CoreError> {
        if !self.is_master() {
            return Ok(Vec::new());
        }

        if let Some(round) = &self.in_flight {
            if now - round.started_at > self.liveness {
                let missing = round.missing();
                error!(round = round.round, ?missing, "GVT round exceeded liveness bound");
                return Err(CoreError::GvtRoundTimeout { round: round.round, missing });
            }
            return Ok(Vec::new());
        }

        if !self.fini_from.is_empty() || self.fini_sent {
            return Ok(Vec::new());
        }
        if self.last_finished.is_some_and(|last| now < last + self.period) {
            return Ok(Vec::new());
        }

        let round = self.next_round;
        self.next_round += 1;
        self.in_flight = Some(RoundInFlight::new(round, now, self.nodes as usize));
        debug!(round, "starting GVT round");
        Ok(self.broadcast(&GvtMessage::Start { round }))
    }

    /// Participant: round `round` opened.
    pub fn on_start(&mut self, round: u64) -> Result<(), CoreError> {
        let expected = self.participant.round + 1;
        if round != expected {
            return Err(CoreError::InvalidGvtRound { expected, got: round });
        }
        self.participant = Participant { round, expected: None, reported: false };
        Ok(())
    }

    fn current(&mut self, round: u64) -> Result<&mut RoundInFlight<I>, CoreError> {
        let expected = self.in_flight.as_ref().map_or(0, |r| r.round);
        match &mut self.in_flight {
            Some(open) if open.round == round => Ok(open),
            _ => Err(CoreError::InvalidGvtRound { expected, got: round }),
        }
    }

    /// Master: a participant's per-destination counts of the closing colour.
    pub fn on_white_counts(
        &mut self,
        round: u64,
        node: NodeId,
        sent: Vec<u64>,
    ) -> Result<GvtOutbox, CoreError> {
        let nodes = self.nodes as usize;
        let open = self.current(round)?;
        if let Some(slot) = open.counts.get_mut(node as usize) {
            *slot = Some(sent);
        }
        if open.counts.iter().any(Option::is_none) {
            return Ok(Vec::new());
        }

        let mut expected = vec![0u64; nodes];
        for counts in open.counts.iter().flatten() {
            for (dest, count) in counts.iter().enumerate().take(nodes) {
                expected[dest] += count;
            }
        }
        Ok(expected
            .into_iter()
            .enumerate()
            .filter_map(|(dest, count)| {
                NodeId::try_from(dest).ok().map(|dest| (dest, GvtMessage::Expected { round, count }))
            })
            .collect())
    }

    /// Participant: how many closing-colour messages to wait for.
    pub fn on_expected(&mut self, round: u64, count: u64) -> Result<(), CoreError> {
        if round != self.participant.round {
            return Err(CoreError::InvalidGvtRound { expected: self.participant.round, got: round });
        }
        self.participant.expected = Some(count);
        Ok(())
    }

    /// Participant: count still awaited before the local minimum can be
    /// reported, if a report is due at all.
    pub fn pending_report(&self) -> Option<u64> {
        if self.participant.reported { None } else { self.participant.expected }
    }

    /// Participant: build the local minimum report.
    pub fn report(&mut self, min: VirtualTime) -> (NodeId, GvtMessage) {
        self.participant.reported = true;
        let round = self.participant.round;
        debug!(node = self.node, round, %min, "reporting local minimum");
        (MASTER, GvtMessage::LocalMin { round, node: self.node, min })
    }

    /// Master: a participant's local minimum.
    pub fn on_local_min(
        &mut self,
        round: u64,
        node: NodeId,
        min: VirtualTime,
    ) -> Result<GvtOutbox, CoreError> {
        let floor = self.gvt;
        let open = self.current(round)?;
        if let Some(slot) = open.minima.get_mut(node as usize) {
            *slot = Some(min);
        }
        if open.minima.iter().any(Option::is_none) {
            return Ok(Vec::new());
        }

        let reduced = open.minima.iter().flatten().copied().min().unwrap_or(VirtualTime::INFINITY);
        let gvt = reduced.max(floor);
        if gvt != reduced {
            debug!(round, %reduced, %floor, "reduced GVT below previous value, clamped");
        }
        Ok(self.broadcast(&GvtMessage::NewGvt { round, gvt }))
    }

    /// Participant: adopt a published value.
    pub fn on_new_gvt(&mut self, round: u64, gvt: VirtualTime) -> Result<Adoption, CoreError> {
        if round != self.participant.round {
            return Err(CoreError::InvalidGvtRound { expected: self.participant.round, got: round });
        }
        let previous = self.gvt;
        self.gvt = gvt.max(previous);
        self.history.push(RoundRecord { round, gvt: self.gvt });
        info!(node = self.node, round, gvt = %self.gvt, "GVT adopted");
        Ok(Adoption { round, previous, gvt: self.gvt })
    }

    /// Participant: acknowledgement for the master.
    pub fn adopted(&self, round: u64) -> (NodeId, GvtMessage) {
        (MASTER, GvtMessage::Adopted { round, node: self.node })
    }

    /// Master: a participant adopted. Returns the round duration once every
    /// node has.
    pub fn on_adopted(&mut self, round: u64, node: NodeId, now: I) -> Result<Option<Duration>, CoreError> {
        let open = self.current(round)?;
        if let Some(slot) = open.adopted.get_mut(node as usize) {
            *slot = true;
        }
        if !open.adopted.iter().all(|a| *a) {
            return Ok(None);
        }
        let took = now - open.started_at;
        self.in_flight = None;
        self.last_finished = Some(now);
        Ok(Some(took))
    }

    /// Announce termination once. Returns the broadcast the first time.
    pub fn finish(&mut self) -> GvtOutbox {
        if self.fini_sent {
            return Vec::new();
        }
        self.fini_sent = true;
        self.broadcast(&GvtMessage::Fini { node: self.node })
    }

    /// `node` announced termination.
    pub fn on_fini(&mut self, node: NodeId) {
        self.fini_from.insert(node);
    }

    /// Every node announced termination.
    pub fn is_finished(&self) -> bool {
        self.fini_from.len() >= self.nodes as usize
    }
}
