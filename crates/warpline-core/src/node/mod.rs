//! The per-node engine.
//!
//! A [`Node`] owns one partition of LPs and drives them forward. It is
//! sans-IO: the driver hands it inbound transport bodies through
//! [`Node::receive`], calls [`Node::step`] in a loop and performs whatever
//! [`NodeAction`]s come back.
//!
//! Messages for LPs on this node take the same path as remote ones (queue,
//! pack, ingest) so sequence checking and GVT accounting see every message
//! exactly once.

mod rounds;
mod sessions;
mod timeline;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};
use warpline_proto::{
    ChannelTag, LpId, Message, MessageKey, NodeId, VirtualTime, payloads::GvtMessage,
};

use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    comm::{Communicator, Inbound, Shutdown},
    config::NodeConfig,
    env::Environment,
    error::{CoreError, Violation},
    gvt::GvtCoordinator,
    lp::{Entry, EntryKey, LogicalProcess, Rank},
    metrics::{MetricsSink, Stat},
    model::Model,
    placement::Placement,
    pool::{SlabBuffer, SlabPool},
    rendezvous::RendezvousEngine,
    scheduler::{LowestTimestampFirst, Runnable, Scheduler},
};

/// Sender id used in the entry keys of initial events.
pub const INITIAL_SENDER: LpId = LpId::MAX;

/// Work for the driver.
#[derive(Debug)]
pub enum NodeAction {
    /// Transmit these slab images, in order, on the event channel to `to`,
    /// then release the slabs.
    SendBatch {
        /// Destination node
        to: NodeId,
        /// Packed messages
        slabs: Vec<SlabBuffer>,
    },

    /// Transmit a GVT control body.
    SendControl {
        /// Destination node
        to: NodeId,
        /// Channel
        tag: ChannelTag,
        /// CBOR body
        body: Bytes,
    },

    /// A GVT round completed on this node.
    GvtPublished {
        /// Round number
        round: u64,
        /// Adopted value
        gvt: VirtualTime,
    },

    /// Every node announced termination. Stop stepping and call
    /// [`Node::fini`].
    Terminated,
}

/// End-of-run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    /// Node id
    pub node: NodeId,
    /// Last adopted GVT
    pub gvt: VirtualTime,
    /// Events committed on this node
    pub committed: u64,
    /// Entries executed, including re-executions
    pub processed: u64,
    /// Rollbacks performed
    pub rollbacks: u64,
    /// Antimessages sent
    pub antimessages: u64,
    /// Protocol violations observed
    pub violations: u32,
    /// Communication shutdown findings
    pub shutdown: Shutdown,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    processed: u64,
    rollbacks: u64,
    antimessages: u64,
}

/// One simulation node.
pub struct Node<E, M, C, X>
where
    E: Environment,
    M: Model,
    C: CheckpointStore<M::State>,
    X: MetricsSink,
{
    id: NodeId,
    placement: Placement,
    config: NodeConfig,
    env: E,
    model: M,
    checkpoints: C,
    metrics: X,
    scheduler: Box<dyn Scheduler>,
    lps: BTreeMap<LpId, LogicalProcess<M::State>>,
    comm: Communicator,
    rendezvous: RendezvousEngine<E::Instant>,
    gvt: GvtCoordinator<E::Instant>,
    holds: HashMap<LpId, E::Instant>,
    control: VecDeque<GvtMessage>,
    due: BTreeSet<NodeId>,
    actions: Vec<NodeAction>,
    counters: Counters,
    terminated: bool,
}

impl<E, M, C, X> Node<E, M, C, X>
where
    E: Environment,
    M: Model,
    C: CheckpointStore<M::State>,
    X: MetricsSink,
{
    /// Build node `id`: initialise communication and every local LP, saving
    /// each LP's initial state as its first checkpoint.
    pub fn new(
        id: NodeId,
        placement: Placement,
        config: NodeConfig,
        env: E,
        model: M,
        mut checkpoints: C,
        metrics: X,
    ) -> Self {
        let comm = Communicator::new(id, placement, &config);
        let lps: BTreeMap<_, _> = placement
            .lps_on(id)
            .map(|lp| {
                let state = model.init(lp);
                checkpoints.save(lp, Checkpoint { time: VirtualTime::ZERO, cursor: None, state: state.clone() });
                (lp, LogicalProcess::new(lp, state))
            })
            .collect();
        info!(node = id, lps = lps.len(), nodes = placement.nodes(), "node initialised");

        Self {
            id,
            placement,
            rendezvous: RendezvousEngine::new(config.rendezvous_timeout, config.rendezvous_retry),
            gvt: GvtCoordinator::new(id, placement.nodes(), config.gvt_period, config.gvt_liveness),
            config,
            env,
            model,
            checkpoints,
            metrics,
            scheduler: Box::new(LowestTimestampFirst),
            lps,
            comm,
            holds: HashMap::new(),
            control: VecDeque::new(),
            due: BTreeSet::new(),
            actions: Vec::new(),
            counters: Counters::default(),
            terminated: false,
        }
    }

    /// Replace the LP selection policy.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }

    /// Seed `lp` with an initial event before the run starts.
    ///
    /// Initial events are never cancelled. They are keyed with
    /// [`INITIAL_SENDER`] and numbered in seeding order, so at equal times
    /// they run after every real event and before any page lend.
    pub fn schedule_initial(&mut self, lp: LpId, at: VirtualTime, payload: impl Into<Bytes>) -> Result<(), CoreError> {
        let process = self.lps.get_mut(&lp).ok_or(CoreError::UnknownLp(lp))?;
        let seq = process.queued() as u64 + 1;
        let key = EntryKey { time: at, rank: Rank::Regular, sender: INITIAL_SENDER, seq };
        process.insert(key, Entry { send_time: VirtualTime::ZERO, code: None, payload: payload.into() });
        Ok(())
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Last adopted GVT.
    pub fn gvt(&self) -> VirtualTime {
        self.gvt.gvt()
    }

    /// GVT bookkeeping, for inspection.
    pub fn coordinator(&self) -> &GvtCoordinator<E::Instant> {
        &self.gvt
    }

    /// Rendezvous bookkeeping, for inspection.
    pub fn rendezvous(&self) -> &RendezvousEngine<E::Instant> {
        &self.rendezvous
    }

    /// Communication layer, for inspection.
    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    /// Slab pool; the driver releases [`NodeAction::SendBatch`] slabs here.
    pub fn pool(&self) -> &SlabPool {
        self.comm.pool()
    }

    /// Statistics sink.
    pub fn metrics(&self) -> &X {
        &self.metrics
    }

    /// Checkpoint store.
    pub fn checkpoints(&self) -> &C {
        &self.checkpoints
    }

    /// An LP hosted here.
    pub fn lp(&self, lp: LpId) -> Option<&LogicalProcess<M::State>> {
        self.lps.get(&lp)
    }

    /// Current speculative state of `lp`.
    pub fn lp_state(&self, lp: LpId) -> Option<&M::State> {
        self.lps.get(&lp).map(LogicalProcess::state)
    }

    /// Events committed on this node.
    pub fn committed(&self) -> u64 {
        self.lps.values().map(LogicalProcess::committed).sum()
    }

    /// Rollbacks performed so far.
    pub fn rollbacks(&self) -> u64 {
        self.counters.rollbacks
    }

    /// True once every node announced termination.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// True if a `step` would do something besides GVT polling.
    pub fn has_work(&self) -> bool {
        let now = self.env.now();
        !self.control.is_empty() || self.comm.queued() > 0 || self.runnable(now).next().is_some()
    }

    /// Feed one inbound transport body from `from`.
    ///
    /// GVT traffic is handled immediately, ahead of any application event
    /// still pending. [`CoreError::PoolExhausted`] means no slab was free to
    /// ingest the batch: nothing was consumed and the driver should offer
    /// the same body again later.
    pub fn receive(&mut self, from: NodeId, tag: ChannelTag, body: &Bytes) -> Result<(), CoreError> {
        if self.terminated {
            return Ok(());
        }
        match tag {
            ChannelTag::Event => {
                let inbound = self.comm.ingest(from, body)?;
                self.deliver_all(inbound)?;
            },
            _ => match GvtMessage::decode(tag, body) {
                Ok(msg) => self.handle_gvt(msg)?,
                Err(e) => self.comm.report(from, &Violation::Malformed(e))?,
            },
        }
        Ok(())
    }

    /// Run one scheduling cycle and return what the driver must do.
    pub fn step(&mut self) -> Result<Vec<NodeAction>, CoreError> {
        if self.terminated {
            return Ok(std::mem::take(&mut self.actions));
        }
        let now = self.env.now();

        self.drain_control()?;
        let outbox = self.gvt.poll(now)?;
        self.dispatch_gvt(outbox)?;
        self.drain_control()?;

        self.expire_sessions(now)?;

        let mut executed = 0;
        while executed < self.config.events_per_step && !self.terminated {
            let Some(lp) = self.pick(now) else { break };
            self.process_next(lp)?;
            executed += 1;
            self.flush_due()?;
        }
        if executed == 0 {
            self.metrics.record(None, Stat::IdleCycles, 1.0);
        }

        self.try_report()?;
        self.flush(None)?;
        self.drain_control()?;
        Ok(std::mem::take(&mut self.actions))
    }

    /// `communication_fini`: tear down and summarise.
    pub fn fini(&mut self) -> NodeReport {
        let shutdown = self.comm.fini();
        self.metrics.flush();
        let report = NodeReport {
            node: self.id,
            gvt: self.gvt.gvt(),
            committed: self.committed(),
            processed: self.counters.processed,
            rollbacks: self.counters.rollbacks,
            antimessages: self.counters.antimessages,
            violations: self.comm.violations().total(),
            shutdown,
        };
        info!(
            node = self.id,
            gvt = %report.gvt,
            committed = report.committed,
            rollbacks = report.rollbacks,
            "node finished"
        );
        report
    }

    fn runnable(&self, now: E::Instant) -> impl Iterator<Item = Runnable> + '_ {
        let end = self.config.end_time;
        self.lps.values().filter_map(move |lp| {
            if self.holds.get(&lp.id()).is_some_and(|until| *until > now) {
                return None;
            }
            if lp.blocked_at().is_some() && !self.lends_while_waiting(lp) {
                return None;
            }
            lp.next_time().filter(|next| *next <= end).map(|next| Runnable { lp: lp.id(), next })
        })
    }

    /// A requester blocked at `t` still serves a START at `t` from a lower
    /// LP id when it is next in line and the LP is not already lending.
    fn lends_while_waiting(&self, lp: &LogicalProcess<M::State>) -> bool {
        let Some(at) = lp.blocked_at() else {
            return false;
        };
        let Some((key, _)) = lp.next_pending() else {
            return false;
        };
        key.time == at
            && key.rank == Rank::Lend
            && key.sender < lp.id()
            && self.rendezvous.requesting_at(lp.id(), at)
            && !self.rendezvous.lending(lp.id())
    }

    fn pick(&mut self, now: E::Instant) -> Option<LpId> {
        let runnable: Vec<Runnable> = self.runnable(now).collect();
        let lp = self.scheduler.select(&runnable)?;
        self.holds.remove(&lp);
        Some(lp)
    }

    /// Queue a message; remember its node if it asked for an early flush.
    fn queue(&mut self, msg: Message) -> Result<(), CoreError> {
        if let Some(node) = self.comm.insert_outgoing_msg(msg)? {
            self.due.insert(node);
        }
        Ok(())
    }

    fn flush_due(&mut self) -> Result<(), CoreError> {
        while let Some(node) = self.due.pop_first() {
            self.flush(Some(node))?;
        }
        Ok(())
    }

    /// Pack and hand off queued messages. Batches for this node are
    /// ingested straight away; that can queue more (antimessages after a
    /// rollback), so keep going until nothing local is left.
    fn flush(&mut self, only: Option<NodeId>) -> Result<(), CoreError> {
        loop {
            let mut local = None;
            for batch in self.comm.send_outgoing_msgs(only) {
                if batch.node == self.id {
                    local = Some(batch.into_body());
                } else {
                    trace!(node = self.id, to = batch.node, count = batch.slabs.len(), "batch ready");
                    self.actions.push(NodeAction::SendBatch { to: batch.node, slabs: batch.slabs });
                }
            }
            let Some(body) = local else { break };
            let inbound = self.comm.ingest(self.id, &body)?;
            self.deliver_all(inbound)?;
        }
        if let Some(node) = only {
            self.due.remove(&node);
        } else {
            self.due.clear();
        }
        Ok(())
    }

    fn deliver_all(&mut self, inbound: Vec<Inbound>) -> Result<(), CoreError> {
        for msg in inbound {
            match msg {
                Inbound::Positive(msg) => self.deliver_positive(msg)?,
                Inbound::Anti(msg) => self.deliver_anti(msg)?,
                Inbound::Control(msg) => self.dispatch_control(msg)?,
            }
        }
        Ok(())
    }

    /// Report a violation, blaming the node hosting the sender of `key`.
    fn report_violation(&mut self, key: &MessageKey, violation: &Violation) -> Result<(), CoreError> {
        if let Some(peer) = self.placement.node_of(key.sender) {
            return self.comm.report(peer, violation);
        }
        warn!(node = self.id, %violation, "violation from unknown sender");
        Ok(())
    }

    fn lp_mut(&mut self, lp: LpId) -> Result<&mut LogicalProcess<M::State>, CoreError> {
        self.lps.get_mut(&lp).ok_or(CoreError::UnknownLp(lp))
    }

    fn hold(&mut self, lp: LpId, attempts: u32) {
        let delay = self.rendezvous.retry_delay(attempts);
        debug!(node = self.id, lp, attempts, ?delay, "holding LP before retry");
        self.holds.insert(lp, self.env.now() + delay);
    }
}

impl<E, M, C, X> std::fmt::Debug for Node<E, M, C, X>
where
    E: Environment,
    M: Model,
    C: CheckpointStore<M::State>,
    X: MetricsSink,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("lps", &self.lps.len())
            .field("gvt", &self.gvt.gvt())
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
