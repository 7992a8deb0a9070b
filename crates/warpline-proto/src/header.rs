//! Slab message header.
//!
//! Every slab image starts with a [`MessageHeader`]. The layout is fixed and
//! big-endian:
//!
//! ```text
//! offset  size  field
//!      0     4  sender LP
//!      4     4  destination LP
//!      8     1  kind
//!      9     1  sub-code (Control kind, or the cancelled code for AntiMessage)
//!     10     1  GVT phase colour
//!     11     1  reserved
//!     12     8  send time
//!     20     8  receive time
//!     28     8  sequence number
//!     36     4  payload length
//! ```

use std::fmt;

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U32, U64},
};

use crate::{ControlCode, LpId, MessageKey, ProtocolError, SeqNo, VirtualTime};

/// Total size of one slab buffer.
pub const SLAB_MSG_SIZE: usize = 512;

/// Payload bytes available after the header.
pub const PAYLOAD_CAPACITY: usize = SLAB_MSG_SIZE - MessageHeader::SIZE;

/// Kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Application event (positive).
    Event = 1,
    /// Cancellation of a previously sent sequenced message.
    AntiMessage = 2,
    /// Control message; the sub-code selects the [`ControlCode`].
    Control = 3,
}

impl MessageKind {
    /// Decode a wire byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Event),
            2 => Some(Self::AntiMessage),
            3 => Some(Self::Control),
            _ => None,
        }
    }

    /// Wire byte.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Routing predicate: does this kind go to the control dispatcher?
pub const fn is_control_msg(kind: MessageKind) -> bool {
    matches!(kind, MessageKind::Control)
}

/// GVT phase a message was sent in.
///
/// Each GVT round moves a node one step along
/// `White0 -> Red0 -> White1 -> Red1 -> White0`. Messages are counted per
/// colour, so a round can wait until every message sent in the colour it
/// closes has been received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PhaseColour {
    /// First white phase.
    #[default]
    White0 = 0,
    /// Red phase following `White0`.
    Red0 = 1,
    /// Second white phase.
    White1 = 2,
    /// Red phase following `White1`.
    Red1 = 3,
}

impl PhaseColour {
    /// Decode a wire byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::White0),
            1 => Some(Self::Red0),
            2 => Some(Self::White1),
            3 => Some(Self::Red1),
            _ => None,
        }
    }

    /// True during a GVT computation.
    pub const fn is_red(self) -> bool {
        matches!(self, Self::Red0 | Self::Red1)
    }

    /// Position in the cycle, usable as an array index (0..4).
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Next colour in the cycle.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::White0 => Self::Red0,
            Self::Red0 => Self::White1,
            Self::White1 => Self::Red1,
            Self::Red1 => Self::White0,
        }
    }
}

/// Fixed 40-byte header at the start of every slab image.
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MessageHeader {
    sender: U32,
    destination: U32,
    kind: u8,
    subcode: u8,
    colour: u8,
    reserved: u8,
    send_time: U64,
    recv_time: U64,
    seq: U64,
    payload_len: U32,
}

const _: () = assert!(std::mem::size_of::<MessageHeader>() == MessageHeader::SIZE);

impl MessageHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 40;

    /// Build a header for `key`.
    pub fn new(key: &MessageKey, kind: MessageKind, subcode: u8, payload_len: u32) -> Self {
        Self {
            sender: U32::new(key.sender),
            destination: U32::new(key.destination),
            kind: kind.to_u8(),
            subcode,
            colour: PhaseColour::White0 as u8,
            reserved: 0,
            send_time: U64::new(key.send_time.ticks()),
            recv_time: U64::new(key.recv_time.ticks()),
            seq: U64::new(key.seq),
            payload_len: U32::new(payload_len),
        }
    }

    /// Borrow the header at the front of `bytes` without validating it.
    pub fn from_prefix(bytes: &[u8]) -> Result<&Self, ProtocolError> {
        Self::ref_from_prefix(bytes)
            .map(|(header, _)| header)
            .map_err(|_| ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() })
    }

    /// Sender LP.
    pub fn sender(&self) -> LpId {
        self.sender.get()
    }

    /// Destination LP.
    pub fn destination(&self) -> LpId {
        self.destination.get()
    }

    /// Raw kind byte.
    pub fn kind_byte(&self) -> u8 {
        self.kind
    }

    /// Raw sub-code byte.
    pub fn subcode(&self) -> u8 {
        self.subcode
    }

    /// Raw colour byte.
    pub fn colour_byte(&self) -> u8 {
        self.colour
    }

    /// Stamp the GVT phase colour.
    pub fn set_colour(&mut self, colour: PhaseColour) {
        self.colour = colour as u8;
    }

    /// Send time.
    pub fn send_time(&self) -> VirtualTime {
        VirtualTime::new(self.send_time.get())
    }

    /// Receive time.
    pub fn recv_time(&self) -> VirtualTime {
        VirtualTime::new(self.recv_time.get())
    }

    /// Sequence number.
    pub fn seq(&self) -> SeqNo {
        self.seq.get()
    }

    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload_len.get() as usize
    }

    /// Identifying key.
    pub fn key(&self) -> MessageKey {
        MessageKey {
            sender: self.sender(),
            destination: self.destination(),
            send_time: self.send_time(),
            recv_time: self.recv_time(),
            seq: self.seq(),
        }
    }

    /// Check well-formedness before any payload byte is interpreted.
    ///
    /// Returns the decoded kind, control code (for `Control`, or the
    /// cancelled code for `AntiMessage`) and colour.
    pub fn validate(
        &self,
    ) -> Result<(MessageKind, Option<ControlCode>, PhaseColour), ProtocolError> {
        let kind =
            MessageKind::from_u8(self.kind).ok_or(ProtocolError::UnknownKind(self.kind))?;
        let colour =
            PhaseColour::from_u8(self.colour).ok_or(ProtocolError::UnknownColour(self.colour))?;

        let len = self.payload_len();
        if len > PAYLOAD_CAPACITY {
            return Err(ProtocolError::PayloadTooLarge { len, max: PAYLOAD_CAPACITY });
        }

        let (send, recv) = (self.send_time(), self.recv_time());
        let code = match kind {
            MessageKind::Event => {
                if self.subcode != 0 {
                    return Err(ProtocolError::UnexpectedSubcode { kind, subcode: self.subcode });
                }
                if recv <= send {
                    return Err(ProtocolError::InvalidTimestamps { send, recv });
                }
                None
            },
            MessageKind::AntiMessage => match self.subcode {
                0 => None,
                byte => match ControlCode::from_u8(byte) {
                    Some(code) if code.is_timeline() => Some(code),
                    _ => return Err(ProtocolError::UnexpectedSubcode { kind, subcode: byte }),
                },
            },
            MessageKind::Control => {
                let code = ControlCode::try_from(self.subcode)?;
                if recv < send {
                    return Err(ProtocolError::InvalidTimestamps { send, recv });
                }
                Some(code)
            },
        };

        let sequenced = match kind {
            MessageKind::Event | MessageKind::AntiMessage => true,
            MessageKind::Control => code.is_some_and(ControlCode::is_timeline),
        };
        if sequenced && self.seq() == 0 {
            return Err(ProtocolError::MissingSequence(kind));
        }

        Ok((kind, code, colour))
    }
}

impl fmt::Debug for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHeader")
            .field("sender", &self.sender())
            .field("destination", &self.destination())
            .field("kind", &self.kind)
            .field("subcode", &self.subcode)
            .field("colour", &self.colour)
            .field("send_time", &self.send_time())
            .field("recv_time", &self.recv_time())
            .field("seq", &self.seq())
            .field("payload_len", &self.payload_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    fn key(send: u64, recv: u64, seq: u64) -> MessageKey {
        MessageKey {
            sender: 1,
            destination: 2,
            send_time: VirtualTime::new(send),
            recv_time: VirtualTime::new(recv),
            seq,
        }
    }

    #[test]
    fn golden_bytes() {
        let header = MessageHeader::new(&key(10, 15, 1), MessageKind::Event, 0, 3);
        assert_eq!(
            header.as_bytes(),
            hex!(
                "00000001 00000002 01 00 00 00"
                "000000000000000a 000000000000000f 0000000000000001 00000003"
            )
        );
    }

    #[test]
    fn event_requires_strictly_later_receive_time() {
        let header = MessageHeader::new(&key(10, 10, 1), MessageKind::Event, 0, 0);
        assert!(matches!(header.validate(), Err(ProtocolError::InvalidTimestamps { .. })));
    }

    #[test]
    fn control_sentinel_rejected() {
        let header = MessageHeader::new(&key(10, 10, 0), MessageKind::Control, 5, 0);
        assert_eq!(header.validate(), Err(ProtocolError::UnknownControlCode(5)));
    }

    #[test]
    fn unsequenced_rendezvous_reply_accepted() {
        let code = ControlCode::RendezvousAck.to_u8();
        let header = MessageHeader::new(&key(10, 10, 0), MessageKind::Control, code, 0);
        assert_eq!(
            header.validate(),
            Ok((MessageKind::Control, Some(ControlCode::RendezvousAck), PhaseColour::White0))
        );
    }

    #[test]
    fn start_needs_sequence() {
        let code = ControlCode::RendezvousStart.to_u8();
        let header = MessageHeader::new(&key(10, 10, 0), MessageKind::Control, code, 0);
        assert_eq!(
            header.validate(),
            Err(ProtocolError::MissingSequence(MessageKind::Control))
        );
    }

    #[test]
    fn antimessage_may_only_cancel_timeline_codes() {
        let ack = ControlCode::RendezvousAck.to_u8();
        let header = MessageHeader::new(&key(10, 15, 4), MessageKind::AntiMessage, ack, 0);
        assert!(matches!(header.validate(), Err(ProtocolError::UnexpectedSubcode { .. })));
    }

    #[test]
    fn oversize_payload_length_rejected() {
        let header =
            MessageHeader::new(&key(1, 2, 1), MessageKind::Event, 0, PAYLOAD_CAPACITY as u32 + 1);
        assert!(matches!(header.validate(), Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn colour_cycle() {
        let mut colour = PhaseColour::White0;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(colour);
            colour = colour.next();
        }
        assert_eq!(colour, PhaseColour::White0);
        assert_eq!(seen.iter().filter(|c| c.is_red()).count(), 2);
        assert_eq!(PhaseColour::Red1.index(), 3);
    }
}
