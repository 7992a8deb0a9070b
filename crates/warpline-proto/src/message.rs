//! Messages and their slab image codec.

use std::fmt;

use bytes::Bytes;
use zerocopy::IntoBytes;

use crate::{
    ControlCode, LpId, MessageHeader, MessageKind, PAYLOAD_CAPACITY, PhaseColour, ProtocolError,
    SeqNo, VirtualTime,
};

/// Identity of a sequenced message. An antimessage carries the same key as
/// the positive it cancels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    /// Sending LP
    pub sender: LpId,
    /// Receiving LP
    pub destination: LpId,
    /// Timestamp of the event that produced the message
    pub send_time: VirtualTime,
    /// Timestamp at which the message takes effect
    pub recv_time: VirtualTime,
    /// Per (sender, destination) sequence number
    pub seq: SeqNo,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{} seq={} send={} recv={}",
            self.sender, self.destination, self.seq, self.send_time, self.recv_time
        )
    }
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Identifying key
    pub key: MessageKey,
    /// Kind discriminant
    pub kind: MessageKind,
    /// Control code, or the cancelled code for an antimessage
    pub code: Option<ControlCode>,
    /// Opaque payload
    pub payload: Bytes,
}

impl Message {
    /// Application event.
    pub fn event(key: MessageKey, payload: Bytes) -> Self {
        Self { key, kind: MessageKind::Event, code: None, payload }
    }

    /// Control message with sub-code `code`.
    pub fn control(key: MessageKey, code: ControlCode, payload: Bytes) -> Self {
        Self { key, kind: MessageKind::Control, code: Some(code), payload }
    }

    /// Cancellation of a sequenced message identified by `key`.
    pub fn antimessage(key: MessageKey, code: Option<ControlCode>) -> Self {
        Self { key, kind: MessageKind::AntiMessage, code, payload: Bytes::new() }
    }

    /// True if this message is routed to the control dispatcher.
    pub fn is_control(&self) -> bool {
        crate::is_control_msg(self.kind)
    }

    /// Size of the packed image.
    pub fn encoded_len(&self) -> usize {
        MessageHeader::SIZE + self.payload.len()
    }

    /// Header describing this message.
    pub fn header(&self, colour: PhaseColour) -> Result<MessageHeader, ProtocolError> {
        let len = self.payload.len();
        if len > PAYLOAD_CAPACITY {
            return Err(ProtocolError::PayloadTooLarge { len, max: PAYLOAD_CAPACITY });
        }
        let subcode = self.code.map_or(0, ControlCode::to_u8);
        #[allow(clippy::cast_possible_truncation)] // bounded by PAYLOAD_CAPACITY
        let mut header = MessageHeader::new(&self.key, self.kind, subcode, len as u32);
        header.set_colour(colour);
        Ok(header)
    }

    /// Pack into `dst`, returning the number of bytes written.
    pub fn encode_into(&self, colour: PhaseColour, dst: &mut [u8]) -> Result<usize, ProtocolError> {
        let header = self.header(colour)?;
        let total = self.encoded_len();
        if dst.len() < total {
            return Err(ProtocolError::Truncated { expected: total, actual: dst.len() });
        }
        dst[..MessageHeader::SIZE].copy_from_slice(header.as_bytes());
        dst[MessageHeader::SIZE..total].copy_from_slice(&self.payload);
        Ok(total)
    }

    /// Validate and unpack one image. The payload is copied out, so the
    /// source buffer can be released immediately afterwards.
    pub fn decode(bytes: &[u8]) -> Result<(Self, PhaseColour), ProtocolError> {
        let total = validate_msg(bytes)?;
        let header = MessageHeader::from_prefix(bytes)?;
        let (kind, code, colour) = header.validate()?;
        let payload = Bytes::copy_from_slice(&bytes[MessageHeader::SIZE..total]);
        Ok((Self { key: header.key(), kind, code, payload }, colour))
    }
}

/// Well-formedness check on the image at the front of `bytes`: header
/// fields and length. Returns the image length.
pub fn validate_msg(bytes: &[u8]) -> Result<usize, ProtocolError> {
    let total = image_len(bytes)?;
    MessageHeader::from_prefix(bytes)?.validate()?;
    Ok(total)
}

/// Length of the image at the front of `bytes`, for splitting batches.
pub fn image_len(bytes: &[u8]) -> Result<usize, ProtocolError> {
    let header = MessageHeader::from_prefix(bytes)?;
    let len = header.payload_len();
    if len > PAYLOAD_CAPACITY {
        return Err(ProtocolError::PayloadTooLarge { len, max: PAYLOAD_CAPACITY });
    }
    let total = MessageHeader::SIZE + len;
    if bytes.len() < total {
        return Err(ProtocolError::Truncated { expected: total, actual: bytes.len() });
    }
    Ok(total)
}
