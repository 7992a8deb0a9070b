//! Transport channel tags and stream framing.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, byteorder::big_endian::U32};

use crate::ProtocolError;

/// Transport-level tag. Everything except `Event` belongs to the GVT
/// control channel, which is processed ahead of application traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelTag {
    /// Batch of slab images (`MSG_EVENT`)
    Event = 2,
    /// Master to participants: round start and expected counts (`MSG_COMPUTE_GVT`)
    ComputeGvt = 50,
    /// Participants to master: counts, local minima, adoption (`MSG_INFO_GVT`)
    InfoGvt = 51,
    /// Published GVT (`MSG_NEW_GVT`)
    NewGvt = 52,
    /// Termination (`MSG_FINI`)
    Fini = 55,
}

impl ChannelTag {
    /// Decode a wire byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            2 => Some(Self::Event),
            50 => Some(Self::ComputeGvt),
            51 => Some(Self::InfoGvt),
            52 => Some(Self::NewGvt),
            55 => Some(Self::Fini),
            _ => None,
        }
    }

    /// Processed before any pending application events.
    pub const fn is_priority(self) -> bool {
        !matches!(self, Self::Event)
    }
}

/// 8-byte frame header used when envelopes travel over a byte stream.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct EnvelopeHeader {
    tag: u8,
    reserved: [u8; 3],
    len: U32,
}

const _: () = assert!(std::mem::size_of::<EnvelopeHeader>() == EnvelopeHeader::SIZE);

impl EnvelopeHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 8;

    /// Upper bound on a body, to refuse absurd lengths from a corrupt stream.
    pub const MAX_BODY: usize = 16 * 1024 * 1024;

    /// Frame `len` body bytes on channel `tag`.
    pub fn new(tag: ChannelTag, len: u32) -> Self {
        Self { tag: tag as u8, reserved: [0; 3], len: U32::new(len) }
    }

    /// Parse and check a received header.
    pub fn parse(bytes: &[u8; Self::SIZE]) -> Result<(ChannelTag, usize), ProtocolError> {
        let header = Self::read_from_bytes(bytes.as_slice())
            .map_err(|_| ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() })?;
        let tag = ChannelTag::from_u8(header.tag).ok_or(ProtocolError::UnknownTag(header.tag))?;
        let len = header.len.get() as usize;
        if len > Self::MAX_BODY {
            return Err(ProtocolError::PayloadTooLarge { len, max: Self::MAX_BODY });
        }
        Ok((tag, len))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = EnvelopeHeader::new(ChannelTag::NewGvt, 300);
        let bytes: [u8; EnvelopeHeader::SIZE] = header.as_bytes().try_into().unwrap();
        assert_eq!(EnvelopeHeader::parse(&bytes).unwrap(), (ChannelTag::NewGvt, 300));
    }

    #[test]
    fn unknown_tag_rejected() {
        let bytes = [9, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(EnvelopeHeader::parse(&bytes), Err(ProtocolError::UnknownTag(9)));
    }

    #[test]
    fn only_events_are_not_priority() {
        assert!(!ChannelTag::Event.is_priority());
        assert!(ChannelTag::Fini.is_priority());
        assert!(ChannelTag::NewGvt.is_priority());
    }
}
