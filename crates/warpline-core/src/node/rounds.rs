//! GVT rounds and termination, node side.

use tracing::{debug, info};
use warpline_proto::{VirtualTime, payloads::GvtMessage};

use super::{Node, NodeAction};
use crate::{
    checkpoint::CheckpointStore,
    env::Environment,
    error::CoreError,
    gvt::{GvtOutbox, MASTER},
    metrics::{MetricsSink, Stat},
    model::Model,
};

impl<E, M, C, X> Node<E, M, C, X>
where
    E: Environment,
    M: Model,
    C: CheckpointStore<M::State>,
    X: MetricsSink,
{
    /// Handle one GVT message, in either role.
    pub(super) fn handle_gvt(&mut self, msg: GvtMessage) -> Result<(), CoreError> {
        match msg {
            GvtMessage::Start { round } => {
                self.gvt.on_start(round)?;
                // everything already produced belongs to the closing colour
                self.flush(None)?;
                let sent = self.comm.ledger_mut().flip();
                debug!(node = self.id, round, ?sent, "colour flipped");
                self.dispatch_gvt(vec![(MASTER, GvtMessage::WhiteCounts { round, node: self.id, sent })])?;
                self.try_report()
            },
            GvtMessage::WhiteCounts { round, node, sent } => {
                let out = self.gvt.on_white_counts(round, node, sent)?;
                self.dispatch_gvt(out)
            },
            GvtMessage::Expected { round, count } => {
                self.gvt.on_expected(round, count)?;
                self.try_report()
            },
            GvtMessage::LocalMin { round, node, min } => {
                let out = self.gvt.on_local_min(round, node, min)?;
                self.dispatch_gvt(out)
            },
            GvtMessage::NewGvt { round, gvt } => self.adopt(round, gvt),
            GvtMessage::Adopted { round, node } => {
                if let Some(took) = self.gvt.on_adopted(round, node, self.env.now())? {
                    self.metrics.record(None, Stat::GvtRoundTime, took.as_secs_f64());
                }
                Ok(())
            },
            GvtMessage::Fini { node } => {
                self.gvt.on_fini(node);
                if self.gvt.is_finished() && !self.terminated {
                    info!(node = self.id, gvt = %self.gvt.gvt(), "all nodes finished");
                    self.terminated = true;
                    self.actions.push(NodeAction::Terminated);
                }
                Ok(())
            },
        }
    }

    /// Report the local minimum once every closing-colour message addressed
    /// here has arrived.
    pub(super) fn try_report(&mut self) -> Result<(), CoreError> {
        let Some(expected) = self.gvt.pending_report() else {
            return Ok(());
        };
        let received = self.comm.ledger().closing_received();
        if received < expected {
            debug!(node = self.id, received, expected, "waiting for in-flight messages");
            return Ok(());
        }
        let min = self.local_min();
        self.comm.ledger_mut().settle(expected);
        let report = self.gvt.report(min);
        self.dispatch_gvt(vec![report])
    }

    /// Lower bound on any time this node can still roll back to.
    fn local_min(&self) -> VirtualTime {
        let lps = self
            .lps
            .values()
            .filter_map(|lp| lp.blocked_at().or_else(|| lp.next_time()))
            .min()
            .unwrap_or(VirtualTime::INFINITY);
        let sessions = self.rendezvous.min_open_time().unwrap_or(VirtualTime::INFINITY);
        lps.min(self.comm.min_queued_time()).min(self.comm.ledger().min_since_flip()).min(sessions)
    }

    /// Adopt a published GVT: commit, fossil collect, report statistics
    /// and announce termination once past the end time.
    fn adopt(&mut self, round: u64, gvt: VirtualTime) -> Result<(), CoreError> {
        let adoption = self.gvt.on_new_gvt(round, gvt)?;
        let gvt = adoption.gvt;

        for (id, lp) in &mut self.lps {
            let retained = self.checkpoints.fossil_collect(*id, gvt);
            let newly = lp.fossil(gvt, retained);
            if newly > 0 {
                #[allow(clippy::cast_precision_loss)]
                self.metrics.record(Some(*id), Stat::Committed, newly as f64);
            }
        }
        self.rendezvous.fossil_collect(gvt);

        if !gvt.is_infinite() {
            #[allow(clippy::cast_precision_loss)]
            let advanced = gvt.ticks().saturating_sub(adoption.previous.ticks()) as f64;
            self.metrics.record(None, Stat::SimTimeAdvancement, advanced);
        }
        self.metrics.on_gvt(gvt);
        self.metrics.flush();
        self.actions.push(NodeAction::GvtPublished { round, gvt });

        let ack = self.gvt.adopted(round);
        self.dispatch_gvt(vec![ack])?;

        if gvt.is_infinite() || gvt > self.config.end_time {
            let out = self.gvt.finish();
            if !out.is_empty() {
                info!(node = self.id, %gvt, end = %self.config.end_time, "past end time, finishing");
            }
            self.dispatch_gvt(out)?;
        }
        Ok(())
    }

    /// Route GVT traffic: to ourselves through the local control queue,
    /// to peers as control bodies.
    pub(super) fn dispatch_gvt(&mut self, outbox: GvtOutbox) -> Result<(), CoreError> {
        for (to, msg) in outbox {
            if to == self.id {
                self.control.push_back(msg);
            } else {
                let body = msg.encode()?;
                self.actions.push(NodeAction::SendControl { to, tag: msg.tag(), body });
            }
        }
        Ok(())
    }

    /// Handle GVT messages this node sent itself.
    pub(super) fn drain_control(&mut self) -> Result<(), CoreError> {
        while let Some(msg) = self.control.pop_front() {
            self.handle_gvt(msg)?;
        }
        Ok(())
    }
}
