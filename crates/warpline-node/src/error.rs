//! Runtime error types.

use thiserror::Error;
use warpline_core::CoreError;
use warpline_proto::{NodeId, ProtocolError};

/// Errors moving envelopes between nodes.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No channel or stream to this node.
    #[error("no route to node {0}")]
    UnknownPeer(NodeId),

    /// The peer hung up.
    #[error("node {0} closed its end")]
    Closed(NodeId),

    /// Every inbound source is gone.
    #[error("inbox closed")]
    InboxClosed,

    /// A stream delivered a frame that does not parse.
    #[error("bad frame: {0}")]
    Protocol(#[from] ProtocolError),

    /// Body longer than a frame can describe.
    #[error("body of {0} bytes does not fit in a frame")]
    FrameTooLarge(usize),

    /// Underlying socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a [`NodeRunner`](crate::NodeRunner) stopped early.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The core reported a fatal error.
    #[error("node failed: {0}")]
    Core(#[from] CoreError),

    /// The transport failed.
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    /// A runner task panicked or was cancelled.
    #[error("runner task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
