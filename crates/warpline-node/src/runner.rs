//! Async driver for a sans-IO [`Node`].
//!
//! The runner owns the only loop in a node process. Each turn it drains
//! whatever the transport already holds (GVT and FINI traffic first, then
//! event batches in arrival order), lets the node run one step, and
//! performs the returned actions. When the node has nothing to execute it
//! parks on the transport with a short timer so GVT polling and rendezvous
//! deadlines still fire.
//!
//! Event bodies that cannot be ingested because the slab pool is empty are
//! parked on a deferred queue and offered again on later turns. Later event
//! bodies queue behind them so per-pair order survives the detour.

use std::{collections::VecDeque, time::Duration};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};
use warpline_core::{
    CheckpointStore, CoreError, Environment, MetricsSink, Model, Node, NodeAction, NodeReport, SlabBuffer,
};
use warpline_proto::{ChannelTag, NodeId};

use crate::{
    error::{RunnerError, TransportError},
    transport::{Envelope, Transport},
};

/// How long an idle runner waits for traffic before stepping again.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(1);

/// Drives one node over one transport until termination.
pub struct NodeRunner<E, M, C, X, T>
where
    E: Environment,
    M: Model,
    C: CheckpointStore<M::State>,
    X: MetricsSink,
    T: Transport,
{
    node: Node<E, M, C, X>,
    transport: T,
    env: E,
    idle_wait: Duration,
    deferred: VecDeque<Envelope>,
    terminated: bool,
}

impl<E, M, C, X, T> NodeRunner<E, M, C, X, T>
where
    E: Environment,
    M: Model,
    C: CheckpointStore<M::State> + Send,
    X: MetricsSink,
    T: Transport,
{
    /// Pair a node with its transport. `env` must be the node's environment.
    pub fn new(node: Node<E, M, C, X>, transport: T, env: E) -> Self {
        Self { node, transport, env, idle_wait: DEFAULT_IDLE_WAIT, deferred: VecDeque::new(), terminated: false }
    }

    /// Override the idle wait.
    #[must_use]
    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }

    /// The driven node.
    pub fn node(&self) -> &Node<E, M, C, X> {
        &self.node
    }

    /// Event bodies waiting for a free slab.
    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Give the node back, e.g. to inspect final LP states.
    pub fn into_node(self) -> Node<E, M, C, X> {
        self.node
    }

    /// Run until every node has finished, then tear the node down.
    pub async fn run(&mut self) -> Result<NodeReport, RunnerError> {
        let id = self.node.id();
        info!(node = id, "runner started");

        while !self.terminated {
            self.drain_inbox()?;
            self.retry_deferred()?;

            let actions = match self.node.step() {
                Ok(actions) => actions,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(node = id, error = %e, "step failed, continuing");
                    Vec::new()
                },
            };
            self.perform(actions).await?;
            if self.terminated {
                break;
            }

            if self.node.has_work() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                received = self.transport.recv() => self.offer(received?)?,
                () = self.env.sleep(self.idle_wait) => {},
            }
        }

        if !self.deferred.is_empty() {
            debug!(node = id, deferred = self.deferred.len(), "dropping bodies that arrived after termination");
            self.deferred.clear();
        }
        Ok(self.node.fini())
    }

    /// Hand everything already received to the node, priority channels
    /// first.
    fn drain_inbox(&mut self) -> Result<(), RunnerError> {
        let mut events = Vec::new();
        while let Some(envelope) = self.transport.try_recv()? {
            if envelope.tag.is_priority() {
                self.offer(envelope)?;
            } else {
                events.push(envelope);
            }
        }
        for envelope in events {
            self.offer(envelope)?;
        }
        Ok(())
    }

    fn offer(&mut self, envelope: Envelope) -> Result<(), RunnerError> {
        if envelope.tag == ChannelTag::Event && !self.deferred.is_empty() {
            self.deferred.push_back(envelope);
            return Ok(());
        }
        if let Some(envelope) = self.deliver(envelope)? {
            self.deferred.push_back(envelope);
        }
        Ok(())
    }

    fn retry_deferred(&mut self) -> Result<(), RunnerError> {
        while let Some(envelope) = self.deferred.pop_front() {
            if let Some(envelope) = self.deliver(envelope)? {
                self.deferred.push_front(envelope);
                break;
            }
        }
        Ok(())
    }

    /// Feed one envelope. Gives it back if the pool had no slab for it.
    fn deliver(&mut self, envelope: Envelope) -> Result<Option<Envelope>, RunnerError> {
        match self.node.receive(envelope.from, envelope.tag, &envelope.body) {
            Ok(()) => Ok(None),
            Err(CoreError::PoolExhausted(e)) => {
                debug!(node = self.node.id(), from = envelope.from, error = %e, "deferring body");
                Ok(Some(envelope))
            },
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!(node = self.node.id(), from = envelope.from, tag = ?envelope.tag, error = %e, "body rejected");
                Ok(None)
            },
        }
    }

    async fn perform(&mut self, actions: Vec<NodeAction>) -> Result<(), RunnerError> {
        for action in actions {
            match action {
                NodeAction::SendBatch { to, slabs } => {
                    let mut body = BytesMut::with_capacity(slabs.iter().map(SlabBuffer::len).sum());
                    for slab in &slabs {
                        body.extend_from_slice(slab.as_bytes());
                    }
                    self.send(to, ChannelTag::Event, body.freeze()).await?;
                    for slab in slabs {
                        slab.release();
                    }
                },
                NodeAction::SendControl { to, tag, body } => self.send(to, tag, body).await?,
                NodeAction::GvtPublished { round, gvt } => {
                    debug!(node = self.node.id(), round, %gvt, "GVT adopted");
                },
                NodeAction::Terminated => self.terminated = true,
            }
        }
        Ok(())
    }

    async fn send(&mut self, to: NodeId, tag: ChannelTag, body: Bytes) -> Result<(), RunnerError> {
        match self.transport.send(to, tag, body).await {
            Ok(()) => Ok(()),
            Err(TransportError::Closed(peer)) => {
                warn!(node = self.node.id(), peer, ?tag, "peer gone, dropping body");
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }
}
