use thiserror::Error;

use crate::{ChannelTag, MessageKind, VirtualTime};

/// Decoding and validation failures for anything read off the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer bytes than the fixed layout requires
    #[error("buffer too short: {actual} bytes, need {expected}")]
    Truncated {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Kind byte does not name a message kind
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),

    /// Sub-code byte does not name a control code
    #[error("control sub-code {0:#04x} outside the valid range")]
    UnknownControlCode(u8),

    /// Sub-code present where the kind forbids it
    #[error("sub-code {subcode:#04x} not allowed on {kind:?} message")]
    UnexpectedSubcode {
        /// Message kind
        kind: MessageKind,
        /// Offending sub-code
        subcode: u8,
    },

    /// Colour byte does not name a GVT phase
    #[error("unknown phase colour {0:#04x}")]
    UnknownColour(u8),

    /// Envelope tag does not name a channel
    #[error("unknown channel tag {0}")]
    UnknownTag(u8),

    /// Payload does not fit in a slab
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload size
        len: usize,
        /// Capacity left after the header
        max: usize,
    },

    /// Receive time before send time (or equal, for events)
    #[error("receive time {recv} not after send time {send}")]
    InvalidTimestamps {
        /// Send time
        send: VirtualTime,
        /// Receive time
        recv: VirtualTime,
    },

    /// Sequenced message carrying sequence number zero
    #[error("{0:?} message without a sequence number")]
    MissingSequence(MessageKind),

    /// Rendezvous chunk index out of range
    #[error("invalid rendezvous chunk {index} of {count}")]
    InvalidChunk {
        /// Chunk index
        index: u16,
        /// Chunk count
        count: u16,
    },

    /// Unblock reason byte unknown
    #[error("unknown unblock reason {0}")]
    UnknownUnblockReason(u8),

    /// Page needs more chunks than the header can count
    #[error("page of {0} bytes exceeds transferable size")]
    PageTooLarge(usize),

    /// Control payload arrived on the wrong channel
    #[error("control payload on channel {actual:?}, expected {expected:?}")]
    TagMismatch {
        /// Channel the variant belongs to
        expected: ChannelTag,
        /// Channel it arrived on
        actual: ChannelTag,
    },

    /// CBOR encoding or decoding failed
    #[error("CBOR error: {0}")]
    Cbor(String),
}
