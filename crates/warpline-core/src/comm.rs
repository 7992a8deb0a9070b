//! Communication layer.
//!
//! Outbound messages are queued per destination node and packed lazily:
//! a message only becomes a slab image when its queue is flushed, and that
//! is also the moment it is stamped with the sender's GVT colour and
//! counted. Inbound batches are split into images, each copied into one
//! slab, validated, decoded and released before anything downstream sees
//! the message.
//!
//! Per `(sender, destination)` the receiver tracks the next expected
//! sequence number. Antimessages retract a suffix of that sequence; once a
//! retraction is complete the sender reuses the freed numbers.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use warpline_proto::{
    ControlCode, LpId, Message, MessageKey, MessageKind, NodeId, PhaseColour, SeqNo, VirtualTime, image_len,
};

use crate::{
    config::NodeConfig,
    error::{CoreError, Violation, ViolationTracker},
    gvt::PhaseLedger,
    placement::Placement,
    pool::{PoolError, SlabBuffer, SlabPool},
};

/// Packed slabs for one destination node, in send order.
#[derive(Debug)]
pub struct Batch {
    /// Destination node
    pub node: NodeId,
    /// One image per slab
    pub slabs: Vec<SlabBuffer>,
}

impl Batch {
    /// Concatenate the images into one transport body and release the
    /// slabs.
    pub fn into_body(self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.slabs.iter().map(SlabBuffer::len).sum());
        for slab in self.slabs {
            body.extend_from_slice(slab.as_bytes());
            slab.release();
        }
        body
    }
}

/// A received message, classified for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Event or timeline control message for an LP input queue
    Positive(Message),
    /// Cancellation of an earlier positive
    Anti(Message),
    /// Rendezvous step handled immediately by the control dispatcher
    Control(Message),
}

/// What [`Communicator::fini`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Shutdown {
    /// Queued messages never sent
    pub discarded: usize,
    /// Slabs still handed out
    pub leaked: usize,
}

/// Serialize `msg` into a freshly acquired slab, stamped with `colour`.
pub fn pack_msg(pool: &SlabPool, msg: &Message, colour: PhaseColour) -> Result<SlabBuffer, CoreError> {
    let mut slab = pool.acquire()?;
    match slab.write_with(|dst| msg.encode_into(colour, dst)) {
        Ok(_) => Ok(slab),
        Err(e) => {
            slab.release();
            Err(CoreError::Encode(e))
        },
    }
}

#[derive(Debug, Clone, Default)]
struct Stream {
    next: SeqNo,
    cancelled: BTreeSet<SeqNo>,
}

/// Receiver-side sequence bookkeeping per `(sender, destination)`.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    streams: HashMap<(LpId, LpId), Stream>,
}

impl SequenceTracker {
    fn stream(&mut self, key: &MessageKey) -> &mut Stream {
        self.streams
            .entry((key.sender, key.destination))
            .or_insert_with(|| Stream { next: 1, cancelled: BTreeSet::new() })
    }

    /// Next sequence number expected from `sender` to `destination`.
    pub fn expected(&self, sender: LpId, destination: LpId) -> SeqNo {
        self.streams.get(&(sender, destination)).map_or(1, |s| s.next)
    }

    /// A positive must carry exactly the next number.
    pub fn accept(&mut self, key: &MessageKey) -> Result<(), Violation> {
        let stream = self.stream(key);
        if key.seq != stream.next {
            return Err(Violation::OutOfSequence { key: *key, expected: stream.next });
        }
        stream.next += 1;
        Ok(())
    }

    /// An antimessage must name a number already accepted and not yet
    /// retracted. Once the retracted numbers form a suffix they become
    /// expected again.
    pub fn retract(&mut self, key: &MessageKey) -> Result<(), Violation> {
        let stream = self.stream(key);
        if key.seq >= stream.next || !stream.cancelled.insert(key.seq) {
            return Err(Violation::OrphanAntimessage(*key));
        }
        while stream.next > 1 && stream.cancelled.remove(&(stream.next - 1)) {
            stream.next -= 1;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OutgoingQueues {
    per_node: BTreeMap<NodeId, VecDeque<Message>>,
}

/// Batched transport bookkeeping for one node.
#[derive(Debug)]
pub struct Communicator {
    node: NodeId,
    placement: Placement,
    pool: SlabPool,
    queues: Mutex<OutgoingQueues>,
    threshold: usize,
    ledger: PhaseLedger,
    sequences: SequenceTracker,
    violations: ViolationTracker,
}

impl Communicator {
    /// `communication_init`: allocate the slab pool and empty queues.
    pub fn new(node: NodeId, placement: Placement, config: &NodeConfig) -> Self {
        let pool = SlabPool::new(config.pool_capacity, config.pool_growth);
        debug!(node, slabs = config.pool_capacity, "communication initialised");
        Self {
            node,
            placement,
            ledger: PhaseLedger::new(placement.nodes()),
            pool,
            queues: Mutex::new(OutgoingQueues::default()),
            threshold: config.flush_threshold.max(1),
            sequences: SequenceTracker::default(),
            violations: ViolationTracker::new(node, config.max_violations_per_peer),
        }
    }

    /// Slab pool shared with the driver.
    pub fn pool(&self) -> &SlabPool {
        &self.pool
    }

    /// GVT colour accounting.
    pub fn ledger(&self) -> &PhaseLedger {
        &self.ledger
    }

    /// Mutable GVT colour accounting.
    pub fn ledger_mut(&mut self) -> &mut PhaseLedger {
        &mut self.ledger
    }

    /// Receiver sequence state.
    pub fn sequences(&self) -> &SequenceTracker {
        &self.sequences
    }

    /// Violations counted so far.
    pub fn violations(&self) -> &ViolationTracker {
        &self.violations
    }

    /// Queue `msg` for its destination node. Returns that node when its
    /// queue should be flushed right away: the threshold was reached, or
    /// the message is a rendezvous step somebody is blocked on.
    pub fn insert_outgoing_msg(&self, msg: Message) -> Result<Option<NodeId>, CoreError> {
        let dest = msg.key.destination;
        let node = self.placement.node_of(dest).ok_or(CoreError::UnknownLp(dest))?;
        let urgent = msg.is_control()
            && (msg.key.seq == 0 || msg.code == Some(ControlCode::RendezvousStart));

        let mut queues = self.queues.lock();
        let queue = queues.per_node.entry(node).or_default();
        queue.push_back(msg);
        let full = queue.len() >= self.threshold;
        Ok((full || urgent).then_some(node))
    }

    /// Messages queued and not yet packed.
    pub fn queued(&self) -> usize {
        self.queues.lock().per_node.values().map(VecDeque::len).sum()
    }

    /// Earliest receive time among queued messages. They are not yet
    /// counted by the ledger, so GVT has to account for them here.
    pub fn min_queued_time(&self) -> VirtualTime {
        self.queues
            .lock()
            .per_node
            .values()
            .flatten()
            .map(|m| m.key.recv_time)
            .min()
            .unwrap_or(VirtualTime::INFINITY)
    }

    /// Pack queued messages into slabs, for every node or only `only`.
    ///
    /// If the pool runs dry the message being packed goes back to the front
    /// of its queue and packing stops; what was packed so far is returned
    /// and the rest waits for the next flush.
    pub fn send_outgoing_msgs(&mut self, only: Option<NodeId>) -> Vec<Batch> {
        let mut batches = Vec::new();
        let mut queues = self.queues.lock();

        'nodes: for (node, queue) in &mut queues.per_node {
            if only.is_some_and(|o| o != *node) {
                continue;
            }
            let mut slabs = Vec::new();
            let mut exhausted = false;
            while let Some(msg) = queue.pop_front() {
                match pack_msg(&self.pool, &msg, self.ledger.colour()) {
                    Ok(slab) => {
                        self.ledger.on_send(*node, msg.key.recv_time);
                        slabs.push(slab);
                    },
                    Err(CoreError::PoolExhausted(e)) => {
                        debug!(node = self.node, dest = *node, error = %e, "pool exhausted, flush deferred");
                        queue.push_front(msg);
                        exhausted = true;
                        break;
                    },
                    Err(e) => {
                        warn!(node = self.node, key = %msg.key, error = %e, "dropping unencodable message");
                    },
                }
            }
            if !slabs.is_empty() {
                trace!(node = self.node, dest = *node, count = slabs.len(), "batch packed");
                batches.push(Batch { node: *node, slabs });
            }
            if exhausted {
                break 'nodes;
            }
        }
        batches
    }

    /// Record a violation from `peer`, escalating past the limit.
    pub fn report(&mut self, peer: NodeId, violation: &Violation) -> Result<(), CoreError> {
        self.violations.report(peer, violation)
    }

    /// Split a received batch from `from` into messages.
    ///
    /// Each image passes through one slab: copied in, validated, decoded
    /// (copying the payload out) and released. Bad images are reported and
    /// skipped. A corrupt length makes the rest of the batch unreadable, so
    /// it is dropped as one violation.
    pub fn ingest(&mut self, from: NodeId, body: &[u8]) -> Result<Vec<Inbound>, CoreError> {
        let mut slab = self.pool.acquire()?;
        let result = self.ingest_with(&mut slab, from, body);
        slab.release();
        result
    }

    fn ingest_with(&mut self, slab: &mut SlabBuffer, from: NodeId, body: &[u8]) -> Result<Vec<Inbound>, CoreError> {
        let mut inbound = Vec::new();
        let mut rest = body;

        while !rest.is_empty() {
            let len = match image_len(rest) {
                Ok(len) => len,
                Err(e) => {
                    self.report(from, &Violation::Malformed(e))?;
                    break;
                },
            };
            let (image, tail) = rest.split_at(len);
            rest = tail;

            if let Err(PoolError::Overflow { len }) = slab.fill(image) {
                warn!(node = self.node, from, len, "image larger than a slab");
                continue;
            }
            let (msg, colour) = match Message::decode(slab.as_bytes()) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.report(from, &Violation::Malformed(e))?;
                    continue;
                },
            };
            self.ledger.on_receive(colour);

            match self.classify(msg) {
                Ok(msg) => inbound.push(msg),
                Err(violation) => self.report(from, &violation)?,
            }
        }
        Ok(inbound)
    }

    fn classify(&mut self, msg: Message) -> Result<Inbound, Violation> {
        if !self.placement.is_local(self.node, msg.key.destination) {
            return Err(Violation::Misrouted(msg.key));
        }
        // timeline control codes (RENDEZVOUS_START) are sequenced like events
        if msg.is_control() && !msg.code.is_some_and(|c| c.is_timeline()) {
            return Ok(Inbound::Control(msg));
        }
        if msg.kind == MessageKind::AntiMessage {
            self.sequences.retract(&msg.key)?;
            return Ok(Inbound::Anti(msg));
        }
        self.sequences.accept(&msg.key)?;
        Ok(Inbound::Positive(msg))
    }

    /// `communication_fini`: drop whatever is still queued and report
    /// slabs that never came back.
    pub fn fini(&mut self) -> Shutdown {
        let discarded = {
            let mut queues = self.queues.lock();
            let count = queues.per_node.values().map(VecDeque::len).sum();
            queues.per_node.clear();
            count
        };
        let leaked = self.pool.outstanding();
        if discarded > 0 || leaked > 0 {
            warn!(node = self.node, discarded, leaked, "communication finalised with leftovers");
        } else {
            debug!(node = self.node, "communication finalised");
        }
        Shutdown { discarded, leaked }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use bytes::Bytes;
    use warpline_proto::{ControlCode, MessageHeader};

    use super::*;
    use crate::config::PoolGrowth;

    fn key(sender: LpId, destination: LpId, seq: SeqNo) -> MessageKey {
        MessageKey {
            sender,
            destination,
            send_time: VirtualTime::new(10),
            recv_time: VirtualTime::new(15),
            seq,
        }
    }

    fn event(sender: LpId, destination: LpId, seq: SeqNo) -> Message {
        Message::event(key(sender, destination, seq), Bytes::from_static(b"ev"))
    }

    /// Two nodes, four LPs: 0,1 on node 0 and 2,3 on node 1.
    fn comm(node: NodeId, config: &NodeConfig) -> Communicator {
        Communicator::new(node, Placement::block(2, 4), config)
    }

    fn body(batches: Vec<Batch>) -> Vec<u8> {
        batches.into_iter().flat_map(Batch::into_body).collect()
    }

    #[test]
    fn threshold_triggers_flush() {
        let config = NodeConfig { flush_threshold: 2, ..NodeConfig::default() };
        let sender = comm(0, &config);
        assert_eq!(sender.insert_outgoing_msg(event(0, 2, 1)).unwrap(), None);
        assert_eq!(sender.insert_outgoing_msg(event(0, 2, 2)).unwrap(), Some(1));
        assert_eq!(sender.insert_outgoing_msg(event(0, 1, 1)).unwrap(), None);
        assert!(matches!(sender.insert_outgoing_msg(event(0, 9, 1)), Err(CoreError::UnknownLp(9))));
    }

    #[test]
    fn rendezvous_steps_flush_immediately() {
        let sender = comm(0, &NodeConfig::default());
        let ack = Message::control(key(0, 2, 0), ControlCode::RendezvousAck, Bytes::new());
        assert_eq!(sender.insert_outgoing_msg(ack).unwrap(), Some(1));
    }

    #[test]
    fn control_steps_bypass_sequencing() {
        let config = NodeConfig::default();
        let mut sender = comm(0, &config);
        let mut receiver = comm(1, &config);
        let ack = Message::control(key(0, 2, 0), ControlCode::RendezvousAck, Bytes::new());
        let start = Message::control(key(0, 2, 1), ControlCode::RendezvousStart, Bytes::new());
        sender.insert_outgoing_msg(ack).unwrap();
        sender.insert_outgoing_msg(start).unwrap();

        let inbound = receiver.ingest(0, &body(sender.send_outgoing_msgs(None))).unwrap();
        assert!(matches!(&inbound[0], Inbound::Control(m) if m.code == Some(ControlCode::RendezvousAck)));
        assert!(matches!(&inbound[1], Inbound::Positive(m) if m.key.seq == 1));
        assert_eq!(receiver.violations().count(0), 0);
    }

    #[test]
    fn batches_arrive_in_order_and_release_every_slab() {
        let config = NodeConfig::default();
        let mut sender = comm(0, &config);
        let mut receiver = comm(1, &config);
        for seq in 1..=3 {
            sender.insert_outgoing_msg(event(0, 2, seq)).unwrap();
        }
        let batches = sender.send_outgoing_msgs(Some(1));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].slabs.len(), 3);

        let inbound = receiver.ingest(0, &body(batches)).unwrap();
        let seqs: Vec<_> = inbound
            .iter()
            .map(|m| {
                let Inbound::Positive(m) = m else { unreachable!("{m:?}") };
                m.key.seq
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(sender.pool().outstanding(), 0);
        assert_eq!(receiver.pool().outstanding(), 0);
    }

    #[test]
    fn flush_counts_against_the_current_colour() {
        let mut sender = comm(0, &NodeConfig::default());
        sender.insert_outgoing_msg(event(0, 2, 1)).unwrap();
        assert_eq!(sender.min_queued_time(), VirtualTime::new(15));
        drop(body(sender.send_outgoing_msgs(None)));
        assert_eq!(sender.min_queued_time(), VirtualTime::INFINITY);
        assert_eq!(sender.ledger_mut().flip(), vec![0, 1]);
    }

    #[test]
    fn exhausted_pool_keeps_the_message_queued() {
        let config =
            NodeConfig { pool_capacity: 1, pool_growth: PoolGrowth::Fixed, ..NodeConfig::default() };
        let mut sender = comm(0, &config);
        sender.insert_outgoing_msg(event(0, 2, 1)).unwrap();
        sender.insert_outgoing_msg(event(0, 2, 2)).unwrap();

        let first = sender.send_outgoing_msgs(None);
        assert_eq!(first[0].slabs.len(), 1);
        assert_eq!(sender.queued(), 1);

        drop(body(first));
        let second = sender.send_outgoing_msgs(None);
        assert_eq!(second[0].slabs.len(), 1);
        assert_eq!(sender.queued(), 0);
        drop(body(second));
    }

    #[test]
    fn ingest_needs_a_slab() {
        let config =
            NodeConfig { pool_capacity: 1, pool_growth: PoolGrowth::Fixed, ..NodeConfig::default() };
        let mut receiver = comm(1, &config);
        let held = receiver.pool().acquire().unwrap();
        assert!(matches!(receiver.ingest(0, &[]), Err(CoreError::PoolExhausted(_))));
        held.release();
    }

    #[test]
    fn malformed_and_misrouted_are_reported_not_delivered() {
        let config = NodeConfig::default();
        let mut sender = comm(0, &config);
        let mut receiver = comm(1, &config);

        sender.insert_outgoing_msg(event(0, 2, 1)).unwrap();
        let mut bytes = body(sender.send_outgoing_msgs(None));
        // kind byte sits at offset 8
        bytes[8] = 0x7f;
        assert!(receiver.ingest(0, &bytes).unwrap().is_empty());

        let mut misrouted = [0u8; 64];
        let len = event(0, 1, 1).encode_into(PhaseColour::White0, &mut misrouted).unwrap();
        assert!(receiver.ingest(0, &misrouted[..len]).unwrap().is_empty());
        assert_eq!(receiver.violations().count(0), 2);
        assert_eq!(receiver.pool().outstanding(), 0);
    }

    #[test]
    fn truncated_tail_is_one_violation() {
        let mut receiver = comm(1, &NodeConfig::default());
        let mut image = [0u8; 64];
        let len = event(0, 2, 1).encode_into(PhaseColour::White0, &mut image).unwrap();
        let mut bytes = image[..len].to_vec();
        bytes.extend_from_slice(&image[..MessageHeader::SIZE - 1]);
        assert_eq!(receiver.ingest(0, &bytes).unwrap().len(), 1);
        assert_eq!(receiver.violations().count(0), 1);
    }

    #[test]
    fn repeated_violations_escalate() {
        let config = NodeConfig { max_violations_per_peer: 2, ..NodeConfig::default() };
        let mut receiver = comm(1, &config);
        let garbage = [0xffu8; 48];
        receiver.ingest(0, &garbage).unwrap();
        receiver.ingest(0, &garbage).unwrap();
        assert!(matches!(receiver.ingest(0, &garbage), Err(CoreError::PeerCorrupted { node: 0, .. })));
        assert_eq!(receiver.pool().outstanding(), 0);
    }

    #[test]
    fn sequence_gaps_and_orphans_are_violations() {
        let mut tracker = SequenceTracker::default();
        tracker.accept(&key(0, 2, 1)).unwrap();
        assert_eq!(
            tracker.accept(&key(0, 2, 3)),
            Err(Violation::OutOfSequence { key: key(0, 2, 3), expected: 2 })
        );
        assert_eq!(tracker.retract(&key(0, 2, 2)), Err(Violation::OrphanAntimessage(key(0, 2, 2))));
        tracker.retract(&key(0, 2, 1)).unwrap();
        assert_eq!(tracker.retract(&key(0, 2, 1)), Err(Violation::OrphanAntimessage(key(0, 2, 1))));
        assert_eq!(tracker.expected(0, 2), 1);
    }

    #[test]
    fn retracted_suffix_is_reused() {
        let mut tracker = SequenceTracker::default();
        for seq in 1..=3 {
            tracker.accept(&key(0, 2, seq)).unwrap();
        }
        tracker.retract(&key(0, 2, 2)).unwrap();
        // 3 is still live, so 2 cannot be reused yet
        assert_eq!(tracker.expected(0, 2), 4);
        tracker.retract(&key(0, 2, 3)).unwrap();
        assert_eq!(tracker.expected(0, 2), 2);
        tracker.accept(&key(0, 2, 2)).unwrap();
    }

    #[test]
    fn fini_reports_leftovers() {
        let mut sender = comm(0, &NodeConfig::default());
        sender.insert_outgoing_msg(event(0, 2, 1)).unwrap();
        let held = sender.pool().acquire().unwrap();
        assert_eq!(sender.fini(), Shutdown { discarded: 1, leaked: 1 });
        held.release();
        assert_eq!(sender.fini(), Shutdown::default());
    }
}
