//! Warpline wire protocol.
//!
//! Everything that crosses a node boundary is defined here: the fixed-layout
//! slab header, the closed set of control sub-codes, transport channel tags
//! and the payload formats carried by the rendezvous and GVT sub-protocols.
//!
//! ## Layout
//!
//! ```text
//! slab image (<= SLAB_MSG_SIZE bytes)
//!   ├─ MessageHeader      (40 bytes, big-endian)
//!   └─ payload            (payload_len bytes)
//!
//! stream envelope
//!   ├─ EnvelopeHeader     (8 bytes: tag + length)
//!   └─ body               (slab images, or a CBOR GvtMessage)
//! ```
//!
//! All integers are fixed-width big-endian so images can be copied between
//! hosts verbatim. Parsing never trusts a length field before checking it
//! against the slab capacity.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod control;
mod error;
mod header;
mod message;
pub mod payloads;
mod time;

pub use channel::{ChannelTag, EnvelopeHeader};
pub use control::{ControlCode, MAX_VALUE_CONTROL, MIN_VALUE_CONTROL, RESERVED_CONTROL};
pub use error::ProtocolError;
pub use header::{
    MessageHeader, MessageKind, PAYLOAD_CAPACITY, PhaseColour, SLAB_MSG_SIZE, is_control_msg,
};
pub use message::{Message, MessageKey, image_len, validate_msg};
pub use time::VirtualTime;

/// Logical process identifier, global across the federation.
pub type LpId = u32;

/// Simulation node identifier.
pub type NodeId = u32;

/// Per (sender, destination) sequence number. Zero marks unsequenced traffic.
pub type SeqNo = u64;

/// Identifier of a shareable memory page owned by an LP.
pub type PageId = u32;
