//! Payload formats for the control sub-protocols.

pub mod gvt;
pub mod rendezvous;

pub use gvt::GvtMessage;
pub use rendezvous::{PAGE_CHUNK_SIZE, RendezvousHeader, RendezvousPayload, UnblockReason, page_chunks};
