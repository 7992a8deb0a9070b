//! Deterministic multi-node cluster.
//!
//! Nodes never run concurrently. Each turn the cluster either steps one node
//! or delivers the oldest body on one link, choosing with a seeded RNG. A
//! link is an ordered pair of nodes plus a lane (events or GVT control), so
//! bodies between two nodes keep their order while traffic from different
//! pairs interleaves differently for every seed.
//!
//! Tests that need a specific interleaving drive the same machinery by hand
//! with [`SimCluster::step`], [`SimCluster::deliver`] and
//! [`SimCluster::inject`].

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    time::Duration,
};

use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;
use warpline_core::{
    CoreError, CounterSink, MemoryCheckpoints, Model, Node, NodeAction, NodeConfig, NodeReport, Placement,
    SlabBuffer,
};
use warpline_proto::{ChannelTag, LpId, Message, NodeId, PhaseColour, ProtocolError, SLAB_MSG_SIZE, VirtualTime};

use crate::sim_env::SimEnv;

/// A node as the cluster runs it.
pub type SimNode<M> = Node<SimEnv, M, MemoryCheckpoints<<M as Model>::State>, CounterSink>;

/// Cluster scheduling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// Seed for the interleaving
    pub seed: u64,
    /// Clock advance per turn
    pub tick: Duration,
    /// Chance, in percent, that a turn delivers rather than steps
    pub deliver_percent: u8,
    /// Give up after this many turns
    pub max_turns: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { seed: 0, tick: Duration::from_micros(100), deliver_percent: 60, max_turns: 2_000_000 }
    }
}

/// Why a cluster run stopped.
#[derive(Debug)]
pub enum SimError {
    /// A node returned an error.
    Node {
        /// Failing node
        node: NodeId,
        /// What it reported
        error: CoreError,
    },
    /// Not every node terminated within the turn limit.
    Stalled {
        /// Turns taken
        turns: u64,
    },
    /// No such node.
    UnknownNode(NodeId),
    /// No node hosts this LP.
    UnknownLp(LpId),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node { node, error } => write!(f, "node {node} failed: {error}"),
            Self::Stalled { turns } => write!(f, "cluster did not terminate within {turns} turns"),
            Self::UnknownNode(node) => write!(f, "no node {node}"),
            Self::UnknownLp(lp) => write!(f, "no node hosts LP {lp}"),
        }
    }
}

impl std::error::Error for SimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Node { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug)]
pub struct SimRun<S> {
    /// One report per node, in node order
    pub reports: Vec<NodeReport>,
    /// Final state of every LP
    pub states: BTreeMap<LpId, S>,
    /// Turns taken
    pub turns: u64,
}

impl<S> SimRun<S> {
    /// Events committed across all nodes.
    pub fn committed(&self) -> u64 {
        self.reports.iter().map(|r| r.committed).sum()
    }

    /// Protocol violations across all nodes.
    pub fn violations(&self) -> u32 {
        self.reports.iter().map(|r| r.violations).sum()
    }

    /// Slabs not returned to their pools.
    pub fn leaked(&self) -> usize {
        self.reports.iter().map(|r| r.shutdown.leaked).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Lane {
    Control,
    Event,
}

type Link = (NodeId, NodeId, Lane);

/// Nodes plus the links between them.
pub struct SimCluster<M: Model> {
    placement: Placement,
    env: SimEnv,
    nodes: Vec<SimNode<M>>,
    links: BTreeMap<Link, VecDeque<(ChannelTag, Bytes)>>,
    rng: ChaCha8Rng,
    config: SimConfig,
    turns: u64,
}

impl<M: Model + Clone> SimCluster<M> {
    /// One node per placement slot, all sharing a fresh clock.
    pub fn new(placement: Placement, node_config: &NodeConfig, model: M, config: SimConfig) -> Self {
        let env = SimEnv::new();
        let nodes = (0..placement.nodes())
            .map(|id| {
                Node::new(
                    id,
                    placement,
                    node_config.clone(),
                    env.clone(),
                    model.clone(),
                    MemoryCheckpoints::new(),
                    CounterSink::new(),
                )
            })
            .collect();
        Self {
            placement,
            env,
            nodes,
            links: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            turns: 0,
        }
    }
}

impl<M: Model> SimCluster<M> {
    /// The shared clock.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Node `id`.
    pub fn node(&self, id: NodeId) -> Option<&SimNode<M>> {
        self.nodes.get(id as usize)
    }

    /// Current state of `lp`, wherever it lives.
    pub fn lp_state(&self, lp: LpId) -> Option<&M::State> {
        self.placement.node_of(lp).and_then(|id| self.node(id)).and_then(|node| node.lp_state(lp))
    }

    /// Seed an initial event on the node hosting `lp`.
    pub fn schedule_initial(&mut self, lp: LpId, at: VirtualTime, payload: impl Into<Bytes>) -> Result<(), SimError> {
        let id = self.placement.node_of(lp).ok_or(SimError::UnknownLp(lp))?;
        let node = self.nodes.get_mut(id as usize).ok_or(SimError::UnknownNode(id))?;
        node.schedule_initial(lp, at, payload).map_err(|error| SimError::Node { node: id, error })
    }

    /// Seed a whole initial population, in order.
    pub fn seed(&mut self, events: &[(LpId, VirtualTime, Bytes)]) -> Result<(), SimError> {
        for (lp, at, payload) in events {
            self.schedule_initial(*lp, *at, payload.clone())?;
        }
        Ok(())
    }

    /// True once every node terminated.
    pub fn is_finished(&self) -> bool {
        self.nodes.iter().all(Node::is_terminated)
    }

    /// Run one step of node `id` and put its output on the links.
    pub fn step(&mut self, id: NodeId) -> Result<(), SimError> {
        let node = self.nodes.get_mut(id as usize).ok_or(SimError::UnknownNode(id))?;
        let actions = node.step().map_err(|error| SimError::Node { node: id, error })?;
        self.route(id, actions);
        Ok(())
    }

    /// Event bodies waiting on the link `from -> to`.
    pub fn pending(&self, from: NodeId, to: NodeId) -> usize {
        self.links.get(&(from, to, Lane::Event)).map_or(0, VecDeque::len)
    }

    /// Deliver the oldest event body on `from -> to`. False if there was
    /// none, or the receiver had no slab free.
    pub fn deliver(&mut self, from: NodeId, to: NodeId) -> Result<bool, SimError> {
        self.deliver_link((from, to, Lane::Event))
    }

    /// Hand `to` a body that never went through a link, as if `from` had
    /// sent it.
    pub fn inject(&mut self, from: NodeId, to: NodeId, body: &Bytes) -> Result<(), SimError> {
        let node = self.nodes.get_mut(to as usize).ok_or(SimError::UnknownNode(to))?;
        node.receive(from, ChannelTag::Event, body).map_err(|error| SimError::Node { node: to, error })
    }

    /// Step and deliver in seeded order until every node terminates.
    pub fn run_to_end(&mut self) -> Result<(), SimError> {
        while !self.is_finished() {
            if self.turns >= self.config.max_turns {
                return Err(SimError::Stalled { turns: self.turns });
            }
            self.turns += 1;
            self.env.advance(self.config.tick);

            let ready: Vec<Link> = self.links.iter().filter(|(_, q)| !q.is_empty()).map(|(link, _)| *link).collect();
            let deliver = !ready.is_empty() && self.rng.gen_range(0..100) < self.config.deliver_percent;
            if deliver {
                let link = ready[self.rng.gen_range(0..ready.len())];
                self.deliver_link(link)?;
                continue;
            }

            let live: Vec<NodeId> =
                (0..).zip(&self.nodes).filter(|(_, node)| !node.is_terminated()).map(|(id, _)| id).collect();
            if !live.is_empty() {
                let id = live[self.rng.gen_range(0..live.len())];
                self.step(id)?;
            }
        }
        Ok(())
    }

    /// Run to the end, then tear every node down.
    pub fn run(mut self) -> Result<SimRun<M::State>, SimError> {
        self.run_to_end()?;
        Ok(self.finish())
    }

    /// Tear every node down and collect reports and final LP states.
    pub fn finish(mut self) -> SimRun<M::State> {
        let mut states = BTreeMap::new();
        let mut reports = Vec::new();
        for (id, node) in (0..).zip(self.nodes.iter_mut()) {
            for lp in self.placement.lps_on(id) {
                if let Some(state) = node.lp_state(lp) {
                    states.insert(lp, state.clone());
                }
            }
            reports.push(node.fini());
        }
        SimRun { reports, states, turns: self.turns }
    }

    fn deliver_link(&mut self, link: Link) -> Result<bool, SimError> {
        let (from, to, _) = link;
        let Some((tag, body)) = self.links.get_mut(&link).and_then(VecDeque::pop_front) else {
            return Ok(false);
        };
        let node = self.nodes.get_mut(to as usize).ok_or(SimError::UnknownNode(to))?;
        match node.receive(from, tag, &body) {
            Ok(()) => Ok(true),
            Err(CoreError::PoolExhausted(_)) => {
                trace!(from, to, "receiver out of slabs, body stays queued");
                self.links.entry(link).or_default().push_front((tag, body));
                Ok(false)
            },
            Err(error) => Err(SimError::Node { node: to, error }),
        }
    }

    fn route(&mut self, from: NodeId, actions: Vec<NodeAction>) {
        for action in actions {
            match action {
                NodeAction::SendBatch { to, slabs } => {
                    let body = concat(slabs);
                    self.links.entry((from, to, Lane::Event)).or_default().push_back((ChannelTag::Event, body));
                },
                NodeAction::SendControl { to, tag, body } => {
                    self.links.entry((from, to, Lane::Control)).or_default().push_back((tag, body));
                },
                NodeAction::GvtPublished { round, gvt } => trace!(node = from, round, %gvt, "GVT published"),
                NodeAction::Terminated => trace!(node = from, "terminated"),
            }
        }
    }
}

fn concat(slabs: Vec<SlabBuffer>) -> Bytes {
    let mut body = Vec::with_capacity(slabs.iter().map(SlabBuffer::len).sum());
    for slab in slabs {
        body.extend_from_slice(slab.as_bytes());
        slab.release();
    }
    Bytes::from(body)
}

/// Encode one message as an event-channel body, the way a peer would.
pub fn message_body(msg: &Message) -> Result<Bytes, ProtocolError> {
    let mut image = vec![0u8; SLAB_MSG_SIZE];
    let len = msg.encode_into(PhaseColour::default(), &mut image)?;
    image.truncate(len);
    Ok(Bytes::from(image))
}
