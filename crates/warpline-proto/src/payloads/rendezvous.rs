//! Rendezvous control payloads.
//!
//! Every rendezvous message carries the same 28-byte prefix naming the
//! session (`mark`, `page`). Page contents travel in chunks that fit one
//! slab each:
//!
//! ```text
//! RendezvousHeader (28 bytes) | chunk bytes (<= PAGE_CHUNK_SIZE)
//! ```

use bytes::Bytes;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U16, U32, U64},
};

use crate::{PAYLOAD_CAPACITY, PageId, ProtocolError, VirtualTime};

/// Page bytes carried by one GET_PAGE_ACK or PAGE_WRITE_BACK.
pub const PAGE_CHUNK_SIZE: usize = PAYLOAD_CAPACITY - RendezvousHeader::SIZE;

/// Why an owner released a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnblockReason {
    /// Write-back applied; the session is done.
    Completed = 1,
    /// Owner cannot serve at this timestamp; retry later.
    Busy = 2,
}

impl UnblockReason {
    /// Decode a wire byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Completed),
            2 => Some(Self::Busy),
            _ => None,
        }
    }
}

/// Fixed prefix of every rendezvous payload.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RendezvousHeader {
    mark: U64,
    page: U32,
    snapshot_time: U64,
    chunk_index: U16,
    chunk_count: U16,
    reason: u8,
    reserved: [u8; 3],
}

const _: () = assert!(std::mem::size_of::<RendezvousHeader>() == RendezvousHeader::SIZE);

impl RendezvousHeader {
    /// Prefix size in bytes.
    pub const SIZE: usize = 28;
}

/// Decoded rendezvous payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousPayload {
    /// Requester-assigned session mark, unique per requester LP
    pub mark: u64,
    /// Page being lent
    pub page: PageId,
    /// Owner time the page snapshot belongs to (GET_PAGE_ACK)
    pub snapshot_time: VirtualTime,
    /// Chunk position (GET_PAGE_ACK, PAGE_WRITE_BACK)
    pub chunk_index: u16,
    /// Total chunks in the transfer
    pub chunk_count: u16,
    /// Present on RENDEZVOUS_UNBLOCK
    pub reason: Option<UnblockReason>,
    /// Chunk bytes
    pub data: Bytes,
}

impl RendezvousPayload {
    /// Bare payload naming a session.
    pub fn new(mark: u64, page: PageId) -> Self {
        Self {
            mark,
            page,
            snapshot_time: VirtualTime::ZERO,
            chunk_index: 0,
            chunk_count: 0,
            reason: None,
            data: Bytes::new(),
        }
    }

    /// Attach an unblock reason.
    #[must_use]
    pub fn with_reason(mut self, reason: UnblockReason) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Attach one chunk of page data.
    #[must_use]
    pub fn with_chunk(mut self, snapshot_time: VirtualTime, index: u16, count: u16, data: Bytes) -> Self {
        self.snapshot_time = snapshot_time;
        self.chunk_index = index;
        self.chunk_count = count;
        self.data = data;
        self
    }

    /// Serialize into a slab payload.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if self.data.len() > PAGE_CHUNK_SIZE {
            return Err(ProtocolError::PayloadTooLarge { len: self.data.len(), max: PAGE_CHUNK_SIZE });
        }
        let header = RendezvousHeader {
            mark: U64::new(self.mark),
            page: U32::new(self.page),
            snapshot_time: U64::new(self.snapshot_time.ticks()),
            chunk_index: U16::new(self.chunk_index),
            chunk_count: U16::new(self.chunk_count),
            reason: self.reason.map_or(0, |r| r as u8),
            reserved: [0; 3],
        };
        let mut out = Vec::with_capacity(RendezvousHeader::SIZE + self.data.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.data);
        Ok(Bytes::from(out))
    }

    /// Parse a slab payload.
    pub fn decode(bytes: &Bytes) -> Result<Self, ProtocolError> {
        let (header, rest) = RendezvousHeader::read_from_prefix(bytes).map_err(|_| {
            ProtocolError::Truncated { expected: RendezvousHeader::SIZE, actual: bytes.len() }
        })?;
        if rest.len() > PAGE_CHUNK_SIZE {
            return Err(ProtocolError::PayloadTooLarge { len: rest.len(), max: PAGE_CHUNK_SIZE });
        }
        let (index, count) = (header.chunk_index.get(), header.chunk_count.get());
        if count > 0 && index >= count {
            return Err(ProtocolError::InvalidChunk { index, count });
        }
        let reason = match header.reason {
            0 => None,
            byte => Some(UnblockReason::from_u8(byte).ok_or(ProtocolError::UnknownUnblockReason(byte))?),
        };
        Ok(Self {
            mark: header.mark.get(),
            page: header.page.get(),
            snapshot_time: VirtualTime::new(header.snapshot_time.get()),
            chunk_index: index,
            chunk_count: count,
            reason,
            data: bytes.slice(RendezvousHeader::SIZE..),
        })
    }
}

/// Split a page into slab-sized chunks. An empty page still yields one
/// (empty) chunk so the transfer has a completion point.
pub fn page_chunks(data: &Bytes) -> Result<Vec<(u16, u16, Bytes)>, ProtocolError> {
    let count = data.len().div_ceil(PAGE_CHUNK_SIZE).max(1);
    let count = u16::try_from(count).map_err(|_| ProtocolError::PageTooLarge(data.len()))?;
    Ok((0..count)
        .map(|index| {
            let start = usize::from(index) * PAGE_CHUNK_SIZE;
            let end = (start + PAGE_CHUNK_SIZE).min(data.len());
            (index, count, data.slice(start..end))
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn chunk_fills_a_slab_exactly() {
        let payload = RendezvousPayload::new(7, 3).with_chunk(
            VirtualTime::new(40),
            0,
            1,
            Bytes::from(vec![0xab; PAGE_CHUNK_SIZE]),
        );
        assert_eq!(payload.encode().unwrap().len(), PAYLOAD_CAPACITY);
    }

    #[test]
    fn round_trip_with_reason() {
        let payload = RendezvousPayload::new(11, 3).with_reason(UnblockReason::Busy);
        let decoded = RendezvousPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn chunk_index_past_count_rejected() {
        let mut bytes = RendezvousPayload::new(1, 1)
            .with_chunk(VirtualTime::ZERO, 1, 2, Bytes::new())
            .encode()
            .unwrap()
            .to_vec();
        // chunk_index lives at offset 20
        bytes[20..22].copy_from_slice(&5u16.to_be_bytes());
        assert!(matches!(
            RendezvousPayload::decode(&Bytes::from(bytes)),
            Err(ProtocolError::InvalidChunk { index: 5, count: 2 })
        ));
    }

    #[test]
    fn page_chunking() {
        let page = Bytes::from(vec![1u8; PAGE_CHUNK_SIZE * 2 + 5]);
        let chunks = page_chunks(&page).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].2.len(), 5);
        assert!(chunks.iter().all(|(_, count, _)| *count == 3));

        let empty = page_chunks(&Bytes::new()).unwrap();
        assert_eq!(empty.len(), 1);
        assert!(empty[0].2.is_empty());
    }
}
