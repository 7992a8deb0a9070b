//! The simulation model seam.
//!
//! A [`Model`] turns an event into a new LP state plus scheduled messages.
//! It never sees the network: everything it wants to send goes through the
//! [`EventContext`], which the engine drains after the callback returns.
//! During silent re-execution the context is marked silent and whatever it
//! collects is thrown away.

use bytes::Bytes;
use thiserror::Error;
use warpline_proto::{ControlCode, LpId, PAYLOAD_CAPACITY, PageId, VirtualTime};

use crate::dispatch::AgentEvent;

/// Why the context refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Messages must take effect strictly after the current time.
    #[error("cannot schedule at {at}: current time is {now}")]
    InPast {
        /// Current time
        now: VirtualTime,
        /// Requested time
        at: VirtualTime,
    },

    /// Payload does not fit in a slab.
    #[error("payload of {len} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Payload size
        len: usize,
        /// Slab payload capacity
        max: usize,
    },

    /// Only topology and agent codes may be scheduled directly.
    #[error("{0:?} cannot be scheduled by a model")]
    NotSchedulable(ControlCode),

    /// One page request per event.
    #[error("a page was already requested by this event")]
    PageAlreadyRequested,

    /// An LP cannot borrow its own page.
    #[error("LP cannot request its own page")]
    SelfRendezvous,
}

/// Something the model asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduled {
    /// Application event
    Event {
        /// Destination LP
        dest: LpId,
        /// Receive time
        at: VirtualTime,
        /// Event data
        payload: Bytes,
    },
    /// Topology or agent notification
    Control {
        /// Destination LP
        dest: LpId,
        /// Receive time
        at: VirtualTime,
        /// Control code
        code: ControlCode,
        /// Notification body
        payload: Bytes,
    },
}

/// A page the event wants to borrow before it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// LP owning the page
    pub owner: LpId,
    /// Page id
    pub page: PageId,
}

/// What a model callback can do besides mutating state.
#[derive(Debug)]
pub struct EventContext {
    lp: LpId,
    now: VirtualTime,
    silent: bool,
    scheduled: Vec<Scheduled>,
    page_request: Option<PageRequest>,
}

impl EventContext {
    /// Context for `lp` executing at `now`.
    pub fn new(lp: LpId, now: VirtualTime, silent: bool) -> Self {
        Self { lp, now, silent, scheduled: Vec::new(), page_request: None }
    }

    /// LP executing.
    pub fn lp(&self) -> LpId {
        self.lp
    }

    /// Current simulation time.
    pub fn now(&self) -> VirtualTime {
        self.now
    }

    /// True during silent re-execution after a rollback. Anything scheduled
    /// is discarded.
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    fn check(&self, at: VirtualTime, len: usize) -> Result<(), ScheduleError> {
        if at <= self.now {
            return Err(ScheduleError::InPast { now: self.now, at });
        }
        if len > PAYLOAD_CAPACITY {
            return Err(ScheduleError::PayloadTooLarge { len, max: PAYLOAD_CAPACITY });
        }
        Ok(())
    }

    /// Schedule an event for `dest` at time `at`.
    pub fn schedule(
        &mut self,
        dest: LpId,
        at: VirtualTime,
        payload: impl Into<Bytes>,
    ) -> Result<(), ScheduleError> {
        let payload = payload.into();
        self.check(at, payload.len())?;
        self.scheduled.push(Scheduled::Event { dest, at, payload });
        Ok(())
    }

    /// Schedule a topology or agent notification.
    pub fn schedule_control(
        &mut self,
        dest: LpId,
        at: VirtualTime,
        code: ControlCode,
        payload: impl Into<Bytes>,
    ) -> Result<(), ScheduleError> {
        if !code.is_timeline() || code == ControlCode::RendezvousStart {
            return Err(ScheduleError::NotSchedulable(code));
        }
        let payload = payload.into();
        self.check(at, payload.len())?;
        self.scheduled.push(Scheduled::Control { dest, at, code, payload });
        Ok(())
    }

    /// Borrow `page` from `owner`. The LP blocks at the current time until
    /// the page has been handed over, modified by [`Model::on_page`] and
    /// written back.
    pub fn request_page(&mut self, owner: LpId, page: PageId) -> Result<(), ScheduleError> {
        if owner == self.lp {
            return Err(ScheduleError::SelfRendezvous);
        }
        if self.page_request.is_some() {
            return Err(ScheduleError::PageAlreadyRequested);
        }
        self.page_request = Some(PageRequest { owner, page });
        Ok(())
    }

    /// Messages scheduled so far.
    pub fn scheduled(&self) -> &[Scheduled] {
        &self.scheduled
    }

    /// Consume the context.
    pub fn into_parts(self) -> (Vec<Scheduled>, Option<PageRequest>) {
        (self.scheduled, self.page_request)
    }
}

/// Application logic run by the engine.
pub trait Model: Send + 'static {
    /// Per-LP state. Cloned for checkpoints.
    type State: Clone + Send + 'static;

    /// Initial state of `lp`.
    fn init(&self, lp: LpId) -> Self::State;

    /// Apply one event.
    fn on_event(&self, ctx: &mut EventContext, state: &mut Self::State, payload: &[u8]);

    /// A topology update reached this LP.
    fn on_topology_update(&self, _ctx: &mut EventContext, _state: &mut Self::State, _payload: &[u8]) {}

    /// An agent notification reached this LP.
    fn on_agent(
        &self,
        _ctx: &mut EventContext,
        _state: &mut Self::State,
        _event: AgentEvent,
        _payload: &[u8],
    ) {
    }

    /// Owner side: current contents of `page`.
    fn read_page(&self, _state: &Self::State, _page: PageId) -> Vec<u8> {
        Vec::new()
    }

    /// Owner side: install the modified `page`.
    fn write_page(&self, _state: &mut Self::State, _page: PageId, _data: &[u8]) {}

    /// Requester side: work on the borrowed page. Changes to `data` are
    /// written back to the owner; changes to `state` stick once the owner
    /// confirms.
    fn on_page(&self, _lp: LpId, _state: &mut Self::State, _page: PageId, _data: &mut Vec<u8>) {}

    /// Approximate size of a snapshot, for checkpoint statistics.
    fn state_size(&self, _state: &Self::State) -> usize {
        std::mem::size_of::<Self::State>()
    }
}
