//! A small model that shares pages between LPs.
//!
//! Every LP owns [`PAGES_PER_LP`] pages, initially `lp{owner}p{page}`. Events
//! carry a [`Command`]:
//!
//! - `Borrow` asks for another LP's page; the borrower appends `+{lp}` to it
//!   and records the page in its `borrowed` list
//! - `Send` schedules a `Note` on another LP
//! - `Note` only records its timestamp
//!
//! Every executed event appends its timestamp to `log`, so rollbacks and
//! re-executions show up directly in the final state.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;
use warpline_core::{EventContext, Model};
use warpline_proto::{LpId, PageId, VirtualTime};

/// Pages owned by each LP.
pub const PAGES_PER_LP: PageId = 4;

/// What an event does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Record the timestamp.
    Note,
    /// Schedule a `Note` on `dest` after `delay` ticks.
    Send {
        /// Destination LP
        dest: LpId,
        /// Distance in virtual time
        delay: u64,
    },
    /// Borrow `page` from `owner`.
    Borrow {
        /// Owning LP
        owner: LpId,
        /// Page id
        page: PageId,
    },
}

impl Command {
    /// Wire form used as the event payload.
    pub fn encode(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(13);
        match self {
            Self::Note => buf.put_u8(0),
            Self::Send { dest, delay } => {
                buf.put_u8(1);
                buf.put_u32(dest);
                buf.put_u64(delay);
            },
            Self::Borrow { owner, page } => {
                buf.put_u8(2);
                buf.put_u32(owner);
                buf.put_u32(page);
            },
        }
        buf.freeze()
    }

    /// Parse a payload.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&tag, rest) = bytes.split_first()?;
        let u32_at = |at: usize| rest.get(at..at + 4).and_then(|b| b.try_into().ok()).map(u32::from_be_bytes);
        match tag {
            0 => Some(Self::Note),
            1 => {
                let delay = rest.get(4..12).and_then(|b| b.try_into().ok()).map(u64::from_be_bytes)?;
                Some(Self::Send { dest: u32_at(0)?, delay })
            },
            2 => Some(Self::Borrow { owner: u32_at(0)?, page: u32_at(4)? }),
            _ => None,
        }
    }
}

/// Per-LP state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageState {
    /// Owned pages
    pub pages: BTreeMap<PageId, Vec<u8>>,
    /// Pages this LP borrowed and wrote back
    pub borrowed: Vec<(LpId, PageId)>,
    /// Timestamps of executed events
    pub log: Vec<u64>,
}

impl PageState {
    /// Contents of an owned page.
    pub fn page(&self, page: PageId) -> Option<&[u8]> {
        self.pages.get(&page).map(Vec::as_slice)
    }
}

/// The page-sharing model.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageModel;

impl Model for PageModel {
    type State = PageState;

    fn init(&self, lp: LpId) -> PageState {
        let pages = (0..PAGES_PER_LP).map(|page| (page, format!("lp{lp}p{page}").into_bytes())).collect();
        PageState { pages, borrowed: Vec::new(), log: Vec::new() }
    }

    fn on_event(&self, ctx: &mut EventContext, state: &mut PageState, payload: &[u8]) {
        let now = ctx.now();
        state.log.push(now.ticks());
        let result = match Command::decode(payload) {
            Some(Command::Note) => Ok(()),
            Some(Command::Send { dest, delay }) => {
                ctx.schedule(dest, now.saturating_add(delay.max(1)), Command::Note.encode())
            },
            Some(Command::Borrow { owner, page }) => ctx.request_page(owner, page),
            None => {
                warn!(lp = ctx.lp(), %now, "undecodable command");
                Ok(())
            },
        };
        if let Err(e) = result {
            warn!(lp = ctx.lp(), %now, error = %e, "command refused");
        }
    }

    fn read_page(&self, state: &PageState, page: PageId) -> Vec<u8> {
        state.pages.get(&page).cloned().unwrap_or_default()
    }

    fn write_page(&self, state: &mut PageState, page: PageId, data: &[u8]) {
        state.pages.insert(page, data.to_vec());
    }

    fn on_page(&self, lp: LpId, state: &mut PageState, page: PageId, data: &mut Vec<u8>) {
        data.extend_from_slice(format!("+{lp}").as_bytes());
        let owner = data
            .strip_prefix(b"lp")
            .and_then(|rest| rest.split(|b| *b == b'p').next())
            .and_then(|digits| std::str::from_utf8(digits).ok())
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(LpId::MAX);
        state.borrowed.push((owner, page));
    }

    fn state_size(&self, state: &PageState) -> usize {
        state.pages.values().map(Vec::len).sum::<usize>() + state.log.len() * 8
    }
}

/// Initial event that borrows `page` from `owner` at `at`.
pub fn borrow(owner: LpId, page: PageId, at: u64) -> (VirtualTime, Bytes) {
    (VirtualTime::new(at), Command::Borrow { owner, page }.encode())
}
