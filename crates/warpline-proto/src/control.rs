//! Control sub-codes.
//!
//! The byte values are wire-stable. The reserved, minimum and maximum
//! sentinels occupy their historical slots (0, 5 and 13) but are not
//! variants: a sub-code is valid exactly when it decodes to a
//! [`ControlCode`].

use crate::ProtocolError;

/// Reserved sentinel. Never sent.
pub const RESERVED_CONTROL: u8 = 0;

/// Lower range marker separating model-level codes from rendezvous codes.
pub const MIN_VALUE_CONTROL: u8 = 5;

/// Upper range marker. Never sent.
pub const MAX_VALUE_CONTROL: u8 = 13;

/// Sub-code of a `Control` kind message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ControlCode {
    /// Routing/topology change for the destination LP.
    TopologyUpdate = 1,
    /// Agent state update (agent-based models).
    AbmUpdate = 2,
    /// Agent arrives at the destination LP.
    AbmVisiting = 3,
    /// Agent departs the destination LP.
    AbmLeaving = 4,
    /// Requester asks an owner to lend a page at a timestamp.
    RendezvousStart = 6,
    /// Owner accepted the rendezvous and is blocked serving it.
    RendezvousAck = 7,
    /// Owner releases the requester, either completed or busy.
    RendezvousUnblock = 8,
    /// Owner rolled back past the rendezvous; the requester must abandon it.
    RendezvousRollback = 9,
    /// Requester asks for the page contents.
    GetPage = 10,
    /// One chunk of the page snapshot.
    GetPageAck = 11,
    /// One chunk of the requester's modified page.
    PageWriteBack = 12,
}

impl ControlCode {
    /// Every real code in wire order.
    pub const ALL: [Self; 11] = [
        Self::TopologyUpdate,
        Self::AbmUpdate,
        Self::AbmVisiting,
        Self::AbmLeaving,
        Self::RendezvousStart,
        Self::RendezvousAck,
        Self::RendezvousUnblock,
        Self::RendezvousRollback,
        Self::GetPage,
        Self::GetPageAck,
        Self::PageWriteBack,
    ];

    /// Decode a wire byte. Sentinels and out-of-range values yield `None`.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::TopologyUpdate),
            2 => Some(Self::AbmUpdate),
            3 => Some(Self::AbmVisiting),
            4 => Some(Self::AbmLeaving),
            6 => Some(Self::RendezvousStart),
            7 => Some(Self::RendezvousAck),
            8 => Some(Self::RendezvousUnblock),
            9 => Some(Self::RendezvousRollback),
            10 => Some(Self::GetPage),
            11 => Some(Self::GetPageAck),
            12 => Some(Self::PageWriteBack),
            _ => None,
        }
    }

    /// Wire byte.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Codes that are sequenced, recorded for cancellation and placed on the
    /// destination LP's timeline like events.
    pub const fn is_timeline(self) -> bool {
        matches!(
            self,
            Self::TopologyUpdate
                | Self::AbmUpdate
                | Self::AbmVisiting
                | Self::AbmLeaving
                | Self::RendezvousStart
        )
    }

    /// Codes handled by the rendezvous sub-protocol.
    pub const fn is_rendezvous(self) -> bool {
        (self as u8) > MIN_VALUE_CONTROL && (self as u8) < MAX_VALUE_CONTROL
    }
}

impl TryFrom<u8> for ControlCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(ProtocolError::UnknownControlCode(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_never_decode() {
        for sentinel in [RESERVED_CONTROL, MIN_VALUE_CONTROL, MAX_VALUE_CONTROL, 0xff] {
            assert_eq!(ControlCode::from_u8(sentinel), None);
        }
    }

    #[test]
    fn every_code_round_trips() {
        for code in ControlCode::ALL {
            assert_eq!(ControlCode::from_u8(code.to_u8()), Some(code));
        }
    }

    #[test]
    fn rendezvous_codes_sit_between_sentinels() {
        let rendezvous: Vec<_> = ControlCode::ALL.into_iter().filter(|c| c.is_rendezvous()).collect();
        assert_eq!(rendezvous.len(), 7);
        assert!(rendezvous.iter().all(|c| c.to_u8() > MIN_VALUE_CONTROL));
        assert!(!ControlCode::TopologyUpdate.is_rendezvous());
    }

    #[test]
    fn start_is_the_only_rendezvous_timeline_code() {
        let both: Vec<_> =
            ControlCode::ALL.into_iter().filter(|c| c.is_rendezvous() && c.is_timeline()).collect();
        assert_eq!(both, vec![ControlCode::RendezvousStart]);
    }
}
