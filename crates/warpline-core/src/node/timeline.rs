//! Event execution, delivery and rollback.

use tracing::{debug, error, trace};
use warpline_proto::{ControlCode, LpId, Message, MessageKey, VirtualTime, payloads::RendezvousPayload};

use super::Node;
use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    dispatch::{Route, route},
    env::Environment,
    error::{CoreError, Violation},
    lp::{Entry, EntryKey, Insert, OutgoingRecord},
    metrics::{MetricsSink, Stat},
    model::{EventContext, Model, PageRequest, Scheduled},
    rollback::{RollbackReport, send_antimessages},
};

impl<E, M, C, X> Node<E, M, C, X>
where
    E: Environment,
    M: Model,
    C: CheckpointStore<M::State>,
    X: MetricsSink,
{
    /// Execute the next pending entry of `lp_id`.
    ///
    /// Once the cursor has moved there is no going back: a failure past that
    /// point leaves the LP inconsistent and is always reported as fatal.
    pub(super) fn process_next(&mut self, lp_id: LpId) -> Result<(), CoreError> {
        let lp = self.lp_mut(lp_id)?;
        let Some((key, entry)) = lp.next_pending().map(|(k, e)| (k, e.clone())) else {
            return Ok(());
        };
        lp.advance(key);
        self.counters.processed += 1;
        trace!(node = self.id, lp = lp_id, time = %key.time, sender = key.sender, "executing");

        self.run_entry(lp_id, key, &entry).map_err(|source| {
            if source.is_fatal() {
                return source;
            }
            error!(node = self.id, lp = lp_id, time = %key.time, error = %source, "entry failed mid-execution");
            CoreError::EventAborted { lp: lp_id, time: key.time, source: Box::new(source) }
        })
    }

    fn run_entry(&mut self, lp_id: LpId, key: EntryKey, entry: &Entry) -> Result<(), CoreError> {
        if entry.code == Some(ControlCode::RendezvousStart) {
            return self.serve_start(lp_id, key, entry);
        }

        let started = self.env.now();
        let (scheduled, request) = self.execute(lp_id, key.time, entry, false)?;
        let took = self.env.now() - started;
        self.metrics.record(Some(lp_id), Stat::EventTime, took.as_secs_f64());
        if entry.code.is_none() {
            self.metrics.record(Some(lp_id), Stat::Event, 1.0);
        }

        for out in scheduled {
            self.emit(lp_id, key.time, out)?;
        }
        match request {
            Some(request) => self.request_page(lp_id, key.time, request),
            None => self.checkpoint(lp_id, false),
        }
    }

    /// Run the model callback for one entry.
    fn execute(
        &mut self,
        lp_id: LpId,
        now: VirtualTime,
        entry: &Entry,
        silent: bool,
    ) -> Result<(Vec<Scheduled>, Option<PageRequest>), CoreError> {
        let lp = self.lps.get_mut(&lp_id).ok_or(CoreError::UnknownLp(lp_id))?;
        let mut ctx = EventContext::new(lp_id, now, silent);
        let state = lp.state_mut();
        match entry.code.map(route) {
            None => self.model.on_event(&mut ctx, state, &entry.payload),
            Some(Route::Topology) => self.model.on_topology_update(&mut ctx, state, &entry.payload),
            Some(Route::Agent(event)) => self.model.on_agent(&mut ctx, state, event, &entry.payload),
            Some(Route::Rendezvous(_)) => {},
        }
        Ok(ctx.into_parts())
    }

    /// Sequence, record and queue one message produced by `lp_id` at `now`.
    pub(super) fn emit(&mut self, lp_id: LpId, now: VirtualTime, out: Scheduled) -> Result<(), CoreError> {
        let (dest, at, code, payload) = match out {
            Scheduled::Event { dest, at, payload } => (dest, at, None, payload),
            Scheduled::Control { dest, at, code, payload } => (dest, at, Some(code), payload),
        };
        if self.placement.node_of(dest).is_none() {
            return Err(CoreError::UnknownLp(dest));
        }

        let lp = self.lp_mut(lp_id)?;
        let seq = lp.allocate_seq(dest);
        let key = MessageKey { sender: lp_id, destination: dest, send_time: now, recv_time: at, seq };
        lp.record(OutgoingRecord { key, code });

        let msg = match code {
            None => Message::event(key, payload),
            Some(code) => Message::control(key, code, payload),
        };
        self.queue(msg)
    }

    /// Save a checkpoint of `lp_id` if the interval elapsed, or always when
    /// `force` is set.
    pub(super) fn checkpoint(&mut self, lp_id: LpId, force: bool) -> Result<(), CoreError> {
        let interval = self.config.checkpoint_interval.max(1);
        let started = self.env.now();
        let lp = self.lps.get_mut(&lp_id).ok_or(CoreError::UnknownLp(lp_id))?;
        if !force && lp.since_checkpoint() < interval {
            return Ok(());
        }

        let state = lp.state().clone();
        let size = self.model.state_size(&state);
        self.checkpoints.save(lp_id, Checkpoint { time: lp.now(), cursor: lp.cursor(), state });
        lp.checkpointed();

        self.metrics.record(Some(lp_id), Stat::Checkpoint, 1.0);
        self.metrics.record(Some(lp_id), Stat::CheckpointTime, (self.env.now() - started).as_secs_f64());
        #[allow(clippy::cast_precision_loss)]
        self.metrics.record(Some(lp_id), Stat::CheckpointMemory, size as f64);
        Ok(())
    }

    /// Queue a positive on its LP, rolling back if it is a straggler.
    pub(super) fn deliver_positive(&mut self, msg: Message) -> Result<(), CoreError> {
        let (msg_key, code) = (msg.key, msg.code);
        let dest = msg_key.destination;
        let gvt = self.gvt.gvt();
        if msg_key.recv_time < gvt {
            error!(node = self.id, key = %msg_key, %gvt, "message below GVT");
            return Err(CoreError::CausalityViolation { lp: dest, gvt, requested: msg_key.recv_time });
        }

        let start = match code {
            Some(ControlCode::RendezvousStart) => match RendezvousPayload::decode(&msg.payload) {
                Ok(payload) => Some(payload),
                Err(e) => return self.report_violation(&msg_key, &Violation::Malformed(e)),
            },
            _ => None,
        };

        let key = EntryKey::of(&msg_key, code);
        let entry = Entry { send_time: msg_key.send_time, code, payload: msg.payload };
        match self.lp_mut(dest)?.insert(key, entry) {
            Insert::Queued => {},
            Insert::Duplicate => return self.report_violation(&msg_key, &Violation::Duplicate(msg_key)),
            Insert::Straggler => {
                debug!(node = self.id, lp = dest, key = %msg_key, "straggler");
                self.rollback_lp(dest, key.time)?;
            },
        }

        match start {
            Some(payload) => self.refuse_if_busy(dest, &msg_key, &payload),
            None => Ok(()),
        }
    }

    /// Cancel a positive. If it was already executed, roll back first.
    pub(super) fn deliver_anti(&mut self, msg: Message) -> Result<(), CoreError> {
        let key = EntryKey::of(&msg.key, msg.code);
        let dest = msg.key.destination;
        let lp = self.lp_mut(dest)?;
        if !lp.contains(key) {
            return self.report_violation(&msg.key, &Violation::OrphanAntimessage(msg.key));
        }
        if lp.is_processed(key) {
            debug!(node = self.id, lp = dest, key = %msg.key, "antimessage for executed entry");
            self.rollback_lp(dest, key.time)?;
        }
        self.lp_mut(dest)?.remove(key);
        Ok(())
    }

    /// Undo everything `lp_id` did at or after `to`.
    ///
    /// Cancels its messages, abandons or revokes rendezvous touching the
    /// undone range, restores the latest checkpoint strictly before `to` and
    /// silently re-executes up to `to`.
    pub(super) fn rollback_lp(&mut self, lp_id: LpId, to: VirtualTime) -> Result<RollbackReport, CoreError> {
        let gvt = self.gvt.gvt();
        if to < gvt {
            error!(node = self.id, lp = lp_id, %to, %gvt, "rollback below GVT");
            return Err(CoreError::CausalityViolation { lp: lp_id, gvt, requested: to });
        }
        let started = self.env.now();

        let lp = self.lps.get_mut(&lp_id).ok_or(CoreError::UnknownLp(lp_id))?;
        let antis = send_antimessages(lp, to);
        if lp.blocked_at().is_some_and(|at| at >= to) {
            lp.unblock();
            drop(lp.take_pending_page());
        }
        let (state, cursor) = match self.checkpoints.get_state_before(lp_id, to) {
            Some(cp) => (cp.state.clone(), cp.cursor),
            None if !lp.is_trimmed() => (self.model.init(lp_id), None),
            None => {
                error!(node = self.id, lp = lp_id, %to, "no checkpoint to restore");
                return Err(CoreError::CheckpointMissing { lp: lp_id, time: to });
            },
        };
        lp.set_state(state);
        lp.rewind(cursor);
        self.checkpoints.discard_from(lp_id, to);

        let aborted = self.rendezvous.abort_from(lp_id, to);
        let revoked = self.rendezvous.revoke_from(lp_id, to);

        let antimessages = antis.len();
        for anti in antis {
            self.queue(anti)?;
        }
        for lend in &revoked {
            debug!(node = self.id, owner = lp_id, requester = lend.requester, mark = lend.mark, "revoking lend");
            self.send_rendezvous(
                lp_id,
                lend.requester,
                lend.time,
                ControlCode::RendezvousRollback,
                &RendezvousPayload::new(lend.mark, lend.page),
            )?;
        }

        let silent = self.replay(lp_id, cursor, to)?;

        let report = RollbackReport {
            lp: lp_id,
            to,
            antimessages,
            aborted_sessions: aborted.len(),
            revoked_lends: revoked.len(),
            silent,
        };
        self.counters.rollbacks += 1;
        self.counters.antimessages += antimessages as u64;
        self.record_rollback(&report, self.env.now() - started);
        debug!(
            node = self.id,
            lp = lp_id,
            %to,
            antimessages,
            aborted = report.aborted_sessions,
            revoked = report.revoked_lends,
            silent,
            "rolled back"
        );
        Ok(report)
    }

    /// Re-execute entries after `after` and before `before` without
    /// sending anything.
    fn replay(&mut self, lp_id: LpId, after: Option<EntryKey>, before: VirtualTime) -> Result<usize, CoreError> {
        let window = self.lp_mut(lp_id)?.replay_window(after, before);
        let count = window.len();
        for (key, entry) in window {
            // lends and page requests below `before` are captured by the
            // checkpoints forced when they completed
            if entry.code != Some(ControlCode::RendezvousStart) {
                drop(self.execute(lp_id, key.time, &entry, true)?);
            }
            self.lp_mut(lp_id)?.advance(key);
        }
        Ok(count)
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_rollback(&mut self, report: &RollbackReport, took: std::time::Duration) {
        let lp = Some(report.lp);
        self.metrics.record(lp, Stat::Rollback, 1.0);
        self.metrics.record(lp, Stat::Recovery, 1.0);
        self.metrics.record(lp, Stat::RecoveryTime, took.as_secs_f64());
        if report.antimessages > 0 {
            self.metrics.record(lp, Stat::AntiMessage, report.antimessages as f64);
        }
        if report.silent > 0 {
            self.metrics.record(lp, Stat::Silent, report.silent as f64);
        }
    }
}
