//! GVT control-channel messages.
//!
//! These travel outside the slab stream, CBOR-encoded, on the channel given
//! by [`GvtMessage::tag`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{ChannelTag, NodeId, ProtocolError, VirtualTime};

/// One step of a GVT round or of termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GvtMessage {
    /// Master opens round `round`.
    Start {
        /// Round number
        round: u64,
    },
    /// Participant reports white messages sent per destination node during
    /// the phase that just closed.
    WhiteCounts {
        /// Round number
        round: u64,
        /// Reporting node
        node: NodeId,
        /// Indexed by destination node
        sent: Vec<u64>,
    },
    /// Master tells a participant how many white messages are addressed to
    /// it.
    Expected {
        /// Round number
        round: u64,
        /// White messages the participant must receive before reporting
        count: u64,
    },
    /// Participant's local lower bound.
    LocalMin {
        /// Round number
        round: u64,
        /// Reporting node
        node: NodeId,
        /// Local minimum
        min: VirtualTime,
    },
    /// Reduced value for the round.
    NewGvt {
        /// Round number
        round: u64,
        /// Published GVT
        gvt: VirtualTime,
    },
    /// Participant processed `NewGvt` for the round.
    Adopted {
        /// Round number
        round: u64,
        /// Reporting node
        node: NodeId,
    },
    /// `node` is finishing; no further rounds.
    Fini {
        /// Finishing node
        node: NodeId,
    },
}

impl GvtMessage {
    /// Channel this message travels on.
    pub const fn tag(&self) -> ChannelTag {
        match self {
            Self::Start { .. } | Self::Expected { .. } => ChannelTag::ComputeGvt,
            Self::WhiteCounts { .. } | Self::LocalMin { .. } | Self::Adopted { .. } => {
                ChannelTag::InfoGvt
            },
            Self::NewGvt { .. } => ChannelTag::NewGvt,
            Self::Fini { .. } => ChannelTag::Fini,
        }
    }

    /// CBOR encode.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out).map_err(|e| ProtocolError::Cbor(e.to_string()))?;
        Ok(Bytes::from(out))
    }

    /// CBOR decode a body received on `tag`.
    pub fn decode(tag: ChannelTag, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let msg: Self =
            ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Cbor(e.to_string()))?;
        if msg.tag() != tag {
            return Err(ProtocolError::TagMismatch { expected: msg.tag(), actual: tag });
        }
        Ok(msg)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let msgs = [
            GvtMessage::Start { round: 4 },
            GvtMessage::WhiteCounts { round: 4, node: 2, sent: vec![0, 7, 1] },
            GvtMessage::Expected { round: 4, count: 8 },
            GvtMessage::LocalMin { round: 4, node: 1, min: VirtualTime::new(85) },
            GvtMessage::NewGvt { round: 4, gvt: VirtualTime::INFINITY },
            GvtMessage::Adopted { round: 4, node: 0 },
            GvtMessage::Fini { node: 2 },
        ];
        for msg in msgs {
            let bytes = msg.encode().unwrap();
            assert_eq!(GvtMessage::decode(msg.tag(), &bytes).unwrap(), msg);
        }
    }

    #[test]
    fn wrong_channel_rejected() {
        let bytes = GvtMessage::Fini { node: 0 }.encode().unwrap();
        assert_eq!(
            GvtMessage::decode(ChannelTag::NewGvt, &bytes),
            Err(ProtocolError::TagMismatch { expected: ChannelTag::Fini, actual: ChannelTag::NewGvt })
        );
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(
            GvtMessage::decode(ChannelTag::NewGvt, &[0xff, 0x00, 0x13]),
            Err(ProtocolError::Cbor(_))
        ));
    }
}
