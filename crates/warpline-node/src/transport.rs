//! Transports carrying envelopes between nodes.
//!
//! A node only needs two guarantees from the network: bodies between one
//! ordered pair of nodes arrive in the order they were sent, and none are
//! lost. [`ChannelTransport`] wires nodes in one process through tokio
//! channels. [`StreamTransport`] runs over any byte stream (TCP, or turmoil's
//! simulated TCP) and frames each body with an
//! [`EnvelopeHeader`](warpline_proto::EnvelopeHeader).
//!
//! `recv` is cancel safe for both implementations, so runners can race it
//! against a timer.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, warn};
use warpline_proto::{ChannelTag, EnvelopeHeader, NodeId};
use zerocopy::IntoBytes;

use crate::error::TransportError;

/// One body received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sending node
    pub from: NodeId,
    /// Channel the body travelled on
    pub tag: ChannelTag,
    /// Slab images or a CBOR control body
    pub body: Bytes,
}

/// Reliable per-pair FIFO delivery between nodes.
#[async_trait]
pub trait Transport: Send {
    /// Node this transport belongs to.
    fn local(&self) -> NodeId;

    /// Queue `body` for node `to`.
    async fn send(&mut self, to: NodeId, tag: ChannelTag, body: Bytes) -> Result<(), TransportError>;

    /// Wait for the next envelope.
    async fn recv(&mut self) -> Result<Envelope, TransportError>;

    /// Next envelope if one is already waiting.
    fn try_recv(&mut self) -> Result<Option<Envelope>, TransportError>;
}

/// In-process transport over unbounded tokio channels.
#[derive(Debug)]
pub struct ChannelTransport {
    local: NodeId,
    peers: Vec<mpsc::UnboundedSender<Envelope>>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
}

impl ChannelTransport {
    /// Fully connected transports for `nodes` nodes, indexed by node id.
    pub fn mesh(nodes: u32) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..nodes).map(|_| mpsc::unbounded_channel()).unzip();
        receivers
            .into_iter()
            .zip(0..)
            .map(|(inbox, local)| Self { local, peers: senders.clone(), inbox })
            .collect()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn local(&self) -> NodeId {
        self.local
    }

    async fn send(&mut self, to: NodeId, tag: ChannelTag, body: Bytes) -> Result<(), TransportError> {
        let peer = self.peers.get(to as usize).ok_or(TransportError::UnknownPeer(to))?;
        peer.send(Envelope { from: self.local, tag, body }).map_err(|_| TransportError::Closed(to))
    }

    async fn recv(&mut self) -> Result<Envelope, TransportError> {
        self.inbox.recv().await.ok_or(TransportError::InboxClosed)
    }

    fn try_recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        match self.inbox.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(TransportError::InboxClosed),
        }
    }
}

/// Write one framed body.
pub async fn write_frame<W>(writer: &mut W, tag: ChannelTag, body: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + Send,
{
    let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge(body.len()))?;
    if body.len() > EnvelopeHeader::MAX_BODY {
        return Err(TransportError::FrameTooLarge(body.len()));
    }
    let header = EnvelopeHeader::new(tag, len);
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed body. `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(ChannelTag, Bytes)>, TransportError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut header = [0u8; EnvelopeHeader::SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let (tag, len) = EnvelopeHeader::parse(&header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some((tag, Bytes::from(body))))
}

/// Exchange node ids over a freshly opened stream. Returns the peer's id.
pub async fn handshake<S>(stream: &mut S, local: NodeId) -> Result<NodeId, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream.write_u32(local).await?;
    stream.flush().await?;
    Ok(stream.read_u32().await?)
}

/// Transport over one byte stream per peer.
///
/// Each stream's read half is drained by its own task into a shared inbox,
/// so a slow peer never blocks frames from the others.
pub struct StreamTransport<S> {
    local: NodeId,
    writers: HashMap<NodeId, WriteHalf<S>>,
    inbox: mpsc::UnboundedReceiver<Result<Envelope, TransportError>>,
    readers: Vec<JoinHandle<()>>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Take ownership of one connected stream per peer.
    pub fn new(local: NodeId, peers: impl IntoIterator<Item = (NodeId, S)>) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        let mut writers = HashMap::new();
        let mut readers = Vec::new();
        for (peer, stream) in peers {
            let (read, write) = tokio::io::split(stream);
            writers.insert(peer, write);
            readers.push(tokio::spawn(read_loop(local, peer, read, tx.clone())));
        }
        Self { local, writers, inbox, readers }
    }

    /// Number of connected peers.
    pub fn peers(&self) -> usize {
        self.writers.len()
    }
}

async fn read_loop<S>(
    local: NodeId,
    peer: NodeId,
    mut read: ReadHalf<S>,
    tx: mpsc::UnboundedSender<Result<Envelope, TransportError>>,
) where
    S: AsyncRead + Send,
{
    loop {
        let frame = read_frame(&mut read).await;
        let item = match frame {
            Ok(Some((tag, body))) => Ok(Envelope { from: peer, tag, body }),
            Ok(None) => {
                debug!(node = local, peer, "stream closed");
                return;
            },
            Err(e) => {
                warn!(node = local, peer, error = %e, "stream failed");
                Err(e)
            },
        };
        let failed = item.is_err();
        if tx.send(item).is_err() || failed {
            return;
        }
    }
}

impl<S> Drop for StreamTransport<S> {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn local(&self) -> NodeId {
        self.local
    }

    async fn send(&mut self, to: NodeId, tag: ChannelTag, body: Bytes) -> Result<(), TransportError> {
        let writer = self.writers.get_mut(&to).ok_or(TransportError::UnknownPeer(to))?;
        match write_frame(writer, tag, &body).await {
            Err(TransportError::Io(e))
                if matches!(e.kind(), std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset) =>
            {
                Err(TransportError::Closed(to))
            },
            other => other,
        }
    }

    async fn recv(&mut self) -> Result<Envelope, TransportError> {
        self.inbox.recv().await.ok_or(TransportError::InboxClosed)?
    }

    fn try_recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        match self.inbox.try_recv() {
            Ok(item) => item.map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(TransportError::InboxClosed),
        }
    }
}
