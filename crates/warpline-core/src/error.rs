//! Core error types.
//!
//! Two tiers. A [`Violation`] is a bad message from a peer: it is logged
//! with the offending key, the message is discarded and the peer's count
//! goes up. A [`CoreError`] is returned to the driver; [`CoreError::is_fatal`]
//! decides whether the run can continue.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{error, warn};
use warpline_proto::{ControlCode, LpId, MessageKey, NodeId, PageId, ProtocolError, SeqNo, VirtualTime};

use crate::{pool::PoolError, rendezvous::RendezvousError};

/// A message that could not be accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    /// Header or payload failed validation.
    #[error("malformed message: {0}")]
    Malformed(#[from] ProtocolError),

    /// Antimessage with no matching positive.
    #[error("antimessage with no matching positive: {0}")]
    OrphanAntimessage(MessageKey),

    /// Positive whose sequence number is not the next expected one.
    #[error("out-of-sequence message {key}: expected seq {expected}")]
    OutOfSequence {
        /// Offending key
        key: MessageKey,
        /// Next number the receiver expected
        expected: SeqNo,
    },

    /// Second positive with a key already in the input queue.
    #[error("duplicate message: {0}")]
    Duplicate(MessageKey),

    /// Destination LP is not hosted on this node.
    #[error("misrouted message: {0}")]
    Misrouted(MessageKey),

    /// Rendezvous message naming a session that never existed, or one that
    /// cannot take this step.
    #[error("rendezvous {code:?} for unknown session mark={mark}: {key}")]
    UnknownSession {
        /// Rendezvous step received
        code: ControlCode,
        /// Offending key
        key: MessageKey,
        /// Session mark from the payload
        mark: u64,
    },

    /// Well-formed rendezvous message the session state machine rejected.
    #[error("rendezvous {code:?} rejected ({reason}): {key}")]
    RendezvousRejected {
        /// Rendezvous step received
        code: ControlCode,
        /// Offending key
        key: MessageKey,
        /// Why it was rejected
        reason: String,
    },
}

/// Errors surfaced to the driver.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No free slab. Retry after releasing buffers.
    #[error(transparent)]
    PoolExhausted(#[from] PoolError),

    /// A message could not be encoded.
    #[error("encoding failed: {0}")]
    Encode(#[from] ProtocolError),

    /// LP id is not part of the placement, or not hosted here.
    #[error("unknown LP {0}")]
    UnknownLp(LpId),

    /// No snapshot old enough to restore.
    #[error("no checkpoint for LP {lp} before {time}")]
    CheckpointMissing {
        /// LP being rolled back
        lp: LpId,
        /// Rollback target
        time: VirtualTime,
    },

    /// Rollback requested below the committed horizon.
    #[error("LP {lp} asked to roll back to {requested}, below GVT {gvt}")]
    CausalityViolation {
        /// LP being rolled back
        lp: LpId,
        /// Current GVT
        gvt: VirtualTime,
        /// Rollback target
        requested: VirtualTime,
    },

    /// A peer kept sending uninterpretable traffic.
    #[error("peer node {node} exceeded {limit} protocol violations (last: {last})")]
    PeerCorrupted {
        /// Peer node
        node: NodeId,
        /// Configured limit
        limit: u32,
        /// Most recent violation
        last: String,
    },

    /// A GVT round did not complete within the liveness bound.
    #[error("GVT round {round} timed out waiting for nodes {missing:?}")]
    GvtRoundTimeout {
        /// Round number
        round: u64,
        /// Nodes that never answered
        missing: Vec<NodeId>,
    },

    /// GVT traffic for a round other than the current one.
    #[error("GVT message for round {got} while in round {expected}")]
    InvalidGvtRound {
        /// Current round
        expected: u64,
        /// Round named by the message
        got: u64,
    },

    /// A rendezvous kept being refused.
    #[error("LP {lp} gave up on page {page} after {attempts} attempts")]
    RendezvousExhausted {
        /// Requesting LP
        lp: LpId,
        /// Page requested
        page: PageId,
        /// Attempts made
        attempts: u32,
    },

    /// Rendezvous bookkeeping error.
    #[error("rendezvous error: {0}")]
    Rendezvous(RendezvousError),

    /// An entry failed after its LP had already started executing it. The
    /// LP is left half-way through the entry.
    #[error("LP {lp} failed while executing the entry at {time}: {source}")]
    EventAborted {
        /// LP executing
        lp: LpId,
        /// Time of the entry
        time: VirtualTime,
        /// What went wrong
        source: Box<CoreError>,
    },
}

impl CoreError {
    /// Returns true if the run must stop.
    ///
    /// Fatal errors mean simulation state can no longer be trusted.
    /// Everything else is backpressure or a single bad message.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::UnknownLp(_)
            | Self::CheckpointMissing { .. }
            | Self::CausalityViolation { .. }
            | Self::PeerCorrupted { .. }
            | Self::GvtRoundTimeout { .. }
            | Self::InvalidGvtRound { .. }
            | Self::RendezvousExhausted { .. }
            | Self::EventAborted { .. } => true,

            Self::PoolExhausted(_) | Self::Encode(_) | Self::Rendezvous(_) => false,
        }
    }
}

impl From<RendezvousError> for CoreError {
    fn from(err: RendezvousError) -> Self {
        match err {
            RendezvousError::Exhausted { requester, page, attempts } => {
                Self::RendezvousExhausted { lp: requester, page, attempts }
            },
            other => Self::Rendezvous(other),
        }
    }
}

/// Per-peer violation counter.
///
/// Every violation is logged with the offending message key. A peer that
/// exceeds the limit is declared corrupt.
#[derive(Debug)]
pub struct ViolationTracker {
    node: NodeId,
    limit: u32,
    counts: HashMap<NodeId, u32>,
}

impl ViolationTracker {
    /// Tracker for `node` tolerating `limit` violations per peer.
    pub fn new(node: NodeId, limit: u32) -> Self {
        Self { node, limit, counts: HashMap::new() }
    }

    /// Record a violation from `peer`.
    pub fn report(&mut self, peer: NodeId, violation: &Violation) -> Result<(), CoreError> {
        let count = self.counts.entry(peer).or_insert(0);
        *count += 1;
        warn!(node = self.node, peer, count = *count, %violation, "protocol violation, message discarded");

        if *count > self.limit {
            error!(node = self.node, peer, limit = self.limit, "peer exceeded violation limit");
            return Err(CoreError::PeerCorrupted {
                node: peer,
                limit: self.limit,
                last: violation.to_string(),
            });
        }
        Ok(())
    }

    /// Violations recorded from `peer`.
    pub fn count(&self, peer: NodeId) -> u32 {
        self.counts.get(&peer).copied().unwrap_or(0)
    }

    /// Violations recorded from all peers.
    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }
}
