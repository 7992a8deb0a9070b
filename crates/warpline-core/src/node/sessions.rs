//! Rendezvous plumbing: turning session transitions into messages and
//! timeline effects.
//!
//! The requester side runs inside the event that asked for a page: it sends
//! RENDEZVOUS_START on its own timeline and blocks. The owner side runs
//! when the owner's timeline reaches that START. All other steps travel as
//! unsequenced control messages and are handled on arrival.
//!
//! An LP blocked on its own request at time `t` can still lend at `t` to a
//! requester with a lower id. It stays blocked until both its request and
//! the lend are over.

use bytes::Bytes;
use tracing::{debug, warn};
use warpline_proto::{
    ControlCode, LpId, Message, MessageKey, VirtualTime,
    payloads::{RendezvousPayload, UnblockReason, page_chunks},
};

use super::Node;
use crate::{
    checkpoint::CheckpointStore,
    dispatch::{RendezvousStep, Route, route},
    env::Environment,
    error::{CoreError, Violation},
    lp::{Entry, EntryKey},
    metrics::MetricsSink,
    model::{Model, PageRequest, Scheduled},
    rendezvous::{RendezvousError, RollbackOutcome, UnblockOutcome},
};

/// Why a rendezvous message went nowhere.
enum Fault {
    Session(RendezvousError),
    Core(CoreError),
    Rejected(&'static str),
}

impl From<RendezvousError> for Fault {
    fn from(err: RendezvousError) -> Self {
        Self::Session(err)
    }
}

impl From<CoreError> for Fault {
    fn from(err: CoreError) -> Self {
        Self::Core(err)
    }
}

impl From<warpline_proto::ProtocolError> for Fault {
    fn from(err: warpline_proto::ProtocolError) -> Self {
        Self::Core(CoreError::Encode(err))
    }
}

impl<E, M, C, X> Node<E, M, C, X>
where
    E: Environment,
    M: Model,
    C: CheckpointStore<M::State>,
    X: MetricsSink,
{
    /// Requester: the event at `at` asked for a page. Send START on the
    /// timeline and block until the owner releases us.
    pub(super) fn request_page(&mut self, lp: LpId, at: VirtualTime, request: PageRequest) -> Result<(), CoreError> {
        let mark = self.rendezvous.begin(lp, request.owner, request.page, at)?;
        let payload = RendezvousPayload::new(mark, request.page).encode()?;
        self.emit(
            lp,
            at,
            Scheduled::Control { dest: request.owner, at, code: ControlCode::RendezvousStart, payload },
        )?;
        self.rendezvous.transmitted(lp, request.page, self.env.now())?;
        self.lp_mut(lp)?.block(at);
        debug!(node = self.id, lp, owner = request.owner, page = request.page, mark, %at, "page requested");
        Ok(())
    }

    /// Owner: the timeline reached a START. Lend the page and block.
    pub(super) fn serve_start(&mut self, owner: LpId, key: EntryKey, entry: &Entry) -> Result<(), CoreError> {
        let start = match RendezvousPayload::decode(&entry.payload) {
            Ok(start) => start,
            Err(e) => {
                warn!(node = self.id, lp = owner, sender = key.sender, error = %e, "unreadable START skipped");
                return Ok(());
            },
        };
        let lp = self.lps.get_mut(&owner).ok_or(CoreError::UnknownLp(owner))?;
        let snapshot = Bytes::from(self.model.read_page(lp.state(), start.page));
        lp.block(key.time);
        self.rendezvous.open_lend(owner, key.sender, start.mark, start.page, key.time, snapshot);
        debug!(node = self.id, owner, requester = key.sender, page = start.page, mark = start.mark, "lending page");
        self.send_rendezvous(
            owner,
            key.sender,
            key.time,
            ControlCode::RendezvousAck,
            &RendezvousPayload::new(start.mark, start.page),
        )
    }

    /// Owner: a START arrived for the time at which the owner is itself
    /// blocked waiting for a page.
    ///
    /// A requester with a lower id is served in place. The LP the owner is
    /// waiting on keeps its START queued, since it serves the owner first.
    /// Anyone else is refused with UNBLOCK(Busy) and retries later.
    pub(super) fn refuse_if_busy(
        &mut self,
        owner: LpId,
        key: &MessageKey,
        start: &RendezvousPayload,
    ) -> Result<(), CoreError> {
        let time = key.recv_time;
        let requester = key.sender;
        let lp = self.lps.get(&owner).ok_or(CoreError::UnknownLp(owner))?;
        let start_key = EntryKey::of(key, Some(ControlCode::RendezvousStart));
        if lp.blocked_at() != Some(time) || lp.is_processed(start_key) {
            return Ok(());
        }
        match self.rendezvous.owner_at(owner, time) {
            Some(waiting_on) if requester > owner && waiting_on != requester => {},
            _ => return Ok(()),
        }
        debug!(node = self.id, owner, requester, %time, mark = start.mark, "owner busy, refusing");
        self.send_rendezvous(
            owner,
            key.sender,
            time,
            ControlCode::RendezvousUnblock,
            &RendezvousPayload::new(start.mark, start.page).with_reason(UnblockReason::Busy),
        )
    }

    /// Queue an unsequenced rendezvous step.
    pub(super) fn send_rendezvous(
        &mut self,
        from: LpId,
        to: LpId,
        time: VirtualTime,
        code: ControlCode,
        payload: &RendezvousPayload,
    ) -> Result<(), CoreError> {
        let key = MessageKey { sender: from, destination: to, send_time: time, recv_time: time, seq: 0 };
        self.queue(Message::control(key, code, payload.encode()?))
    }

    /// Handle one unsequenced rendezvous message.
    pub(super) fn dispatch_control(&mut self, msg: Message) -> Result<(), CoreError> {
        let key = msg.key;
        // header validation guarantees a code on control messages
        let Some(code) = msg.code else {
            warn!(node = self.id, %key, "control message without code");
            return Ok(());
        };
        let payload = match RendezvousPayload::decode(&msg.payload) {
            Ok(payload) => payload,
            Err(e) => return self.report_violation(&key, &Violation::Malformed(e)),
        };

        let outcome = match route(code) {
            Route::Rendezvous(RendezvousStep::Ack) => self.on_ack(&key, &payload),
            Route::Rendezvous(RendezvousStep::GetPage) => self.on_get_page(&key, &payload),
            Route::Rendezvous(RendezvousStep::GetPageAck) => self.on_page_chunk(&key, &payload),
            Route::Rendezvous(RendezvousStep::WriteBack) => self.on_writeback(&key, &payload),
            Route::Rendezvous(RendezvousStep::Unblock) => self.on_unblock(&key, &payload),
            Route::Rendezvous(RendezvousStep::Rollback) => self.on_revoked(&key, &payload),
            Route::Rendezvous(RendezvousStep::Start) => Err(Fault::Rejected("START outside the timeline")),
            Route::Topology | Route::Agent(_) => Err(Fault::Rejected("timeline control without sequence")),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(Fault::Core(e)) => Err(e),
            Err(Fault::Session(e)) if e.is_stale() => {
                debug!(node = self.id, ?code, %key, error = %e, "stale rendezvous message dropped");
                Ok(())
            },
            Err(Fault::Session(RendezvousError::UnknownSession { mark, .. })) => {
                self.report_violation(&key, &Violation::UnknownSession { code, key, mark })
            },
            Err(Fault::Session(e @ RendezvousError::Exhausted { .. })) => Err(e.into()),
            Err(Fault::Session(e)) => self.report_violation(
                &key,
                &Violation::RendezvousRejected { code, key, reason: e.to_string() },
            ),
            Err(Fault::Rejected(reason)) => self.report_violation(
                &key,
                &Violation::RendezvousRejected { code, key, reason: reason.to_string() },
            ),
        }
    }

    /// Requester: the owner is blocked and lending. Ask for the page.
    fn on_ack(&mut self, key: &MessageKey, ack: &RendezvousPayload) -> Result<(), Fault> {
        let requester = key.destination;
        let (owner, page, time) = self.rendezvous.on_ack(requester, ack.mark, self.env.now())?;
        if owner != key.sender {
            return Err(Fault::Rejected("ACK from a different owner"));
        }
        self.send_rendezvous(requester, owner, time, ControlCode::GetPage, &RendezvousPayload::new(ack.mark, page))?;
        self.rendezvous.page_requested(requester, page, self.env.now())?;
        Ok(())
    }

    /// Owner: send the page, chunked, as of the lend time.
    fn on_get_page(&mut self, key: &MessageKey, request: &RendezvousPayload) -> Result<(), Fault> {
        let (owner, requester) = (key.destination, key.sender);
        let lend = self.rendezvous.serving(owner, requester, request.mark)?;
        let (page, time, data) = (lend.page, lend.time, lend.snapshot.clone());
        if page != request.page {
            return Err(Fault::Rejected("GET_PAGE names another page"));
        }

        for (index, count, chunk) in page_chunks(&data)? {
            self.send_rendezvous(
                owner,
                requester,
                time,
                ControlCode::GetPageAck,
                &RendezvousPayload::new(request.mark, page).with_chunk(time, index, count, chunk),
            )?;
        }
        Ok(())
    }

    /// Requester: a page chunk. Once the page is whole, let the model work
    /// on it, park the resulting state and write the page back.
    fn on_page_chunk(&mut self, key: &MessageKey, chunk: &RendezvousPayload) -> Result<(), Fault> {
        let requester = key.destination;
        let Some((page, data)) = self.rendezvous.on_page_chunk(requester, chunk, self.env.now())? else {
            return Ok(());
        };
        let Some(session) = self.rendezvous.session(requester, page) else {
            return Err(Fault::Rejected("page for a forgotten session"));
        };
        let (owner, time, mark) = (session.owner, session.time, session.mark);

        let lp = self.lps.get_mut(&requester).ok_or(CoreError::UnknownLp(requester))?;
        let mut state = lp.state().clone();
        let mut data = data.to_vec();
        self.model.on_page(requester, &mut state, page, &mut data);
        lp.set_pending_page(state);

        for (index, count, chunk) in page_chunks(&Bytes::from(data))? {
            self.send_rendezvous(
                requester,
                owner,
                time,
                ControlCode::PageWriteBack,
                &RendezvousPayload::new(mark, page).with_chunk(time, index, count, chunk),
            )?;
        }
        self.rendezvous.writeback_sent(requester, page, self.env.now())?;
        Ok(())
    }

    /// Owner: a write-back chunk. Once whole, install the page, resume and
    /// release the requester. An owner that is also borrowing installs the
    /// page in its parked state too, and stays blocked for its own request.
    fn on_writeback(&mut self, key: &MessageKey, chunk: &RendezvousPayload) -> Result<(), Fault> {
        let (owner, requester) = (key.destination, key.sender);
        let Some((lend, data)) = self.rendezvous.on_writeback_chunk(owner, requester, chunk)? else {
            return Ok(());
        };

        self.rendezvous.complete_lend(requester, lend.mark);
        let waiting = self.rendezvous.requesting_at(owner, lend.time);
        let lp = self.lps.get_mut(&owner).ok_or(CoreError::UnknownLp(owner))?;
        self.model.write_page(lp.state_mut(), lend.page, &data);
        if let Some(parked) = lp.pending_page_mut() {
            self.model.write_page(parked, lend.page, &data);
        }
        if !waiting {
            lp.unblock();
        }
        self.checkpoint(owner, true)?;
        debug!(node = self.id, owner, requester, page = lend.page, mark = lend.mark, "lend completed");

        self.send_rendezvous(
            owner,
            requester,
            lend.time,
            ControlCode::RendezvousUnblock,
            &RendezvousPayload::new(lend.mark, lend.page).with_reason(UnblockReason::Completed),
        )?;
        Ok(())
    }

    /// Requester: released. Either commit the parked state or back off and
    /// retry.
    fn on_unblock(&mut self, key: &MessageKey, unblock: &RendezvousPayload) -> Result<(), Fault> {
        let requester = key.destination;
        let Some(reason) = unblock.reason else {
            return Err(Fault::Rejected("UNBLOCK without a reason"));
        };
        match self.rendezvous.on_unblock(requester, unblock.mark, reason)? {
            UnblockOutcome::Completed { time } => {
                let lending = self.rendezvous.lending(requester);
                let lp = self.lp_mut(requester)?;
                if let Some(state) = lp.take_pending_page() {
                    lp.set_state(state);
                }
                if !lending {
                    lp.unblock();
                }
                self.checkpoint(requester, true)?;
                debug!(node = self.id, requester, %time, mark = unblock.mark, "rendezvous done");
            },
            UnblockOutcome::Retry { time, attempts } => {
                debug!(node = self.id, requester, %time, attempts, "owner busy");
                self.rollback_lp(requester, time)?;
                self.hold(requester, attempts);
            },
        }
        Ok(())
    }

    /// Requester: the owner undid its side. Re-execute from the request.
    fn on_revoked(&mut self, key: &MessageKey, revoked: &RendezvousPayload) -> Result<(), Fault> {
        let requester = key.destination;
        let time = match self.rendezvous.on_rollback(requester, revoked.mark)? {
            RollbackOutcome::Aborted { time } | RollbackOutcome::ReopenDone { time } => time,
        };
        debug!(node = self.id, requester, owner = key.sender, %time, mark = revoked.mark, "rendezvous revoked");
        self.rollback_lp(requester, time)?;
        Ok(())
    }

    /// Requesters whose owner went quiet: back to the request time and
    /// retry after a pause.
    pub(super) fn expire_sessions(&mut self, now: E::Instant) -> Result<(), CoreError> {
        for expired in self.rendezvous.poll(now) {
            warn!(
                node = self.id,
                requester = expired.requester,
                page = expired.page,
                mark = expired.mark,
                attempts = expired.attempts,
                "rendezvous timed out"
            );
            self.rollback_lp(expired.requester, expired.time)?;
            self.hold(expired.requester, expired.attempts);
        }
        Ok(())
    }
}
