//! Fuzz target for inbound event batches
//!
//! A peer controls every byte of an event-channel body. Nothing it sends may
//! crash the node or strand a slab.
//!
//! # Strategy
//!
//! - Raw bodies: arbitrary bytes ingested as one batch
//! - Built bodies: well-formed message images with header bytes overwritten
//!   and the tail truncated at an arbitrary point
//! - Direct decoding: every image is also decoded on its own
//!
//! # Invariants
//!
//! - Decoding and ingest NEVER panic
//! - A decoded message survives another encode/decode unchanged
//! - Ingest returns every slab it took
//! - Only messages addressed to this node come out of ingest

#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use warpline_core::{Communicator, Inbound, NodeConfig, Placement};
use warpline_proto::{
    ControlCode, Message, MessageKey, PAYLOAD_CAPACITY, PhaseColour, SLAB_MSG_SIZE, VirtualTime,
};

const NODES: u32 = 2;
const LPS: u32 = 8;
const LOCAL: u32 = 1;

#[derive(Debug, Arbitrary)]
struct FuzzedMessage {
    sender: u8,
    destination: u8,
    send_time: u32,
    delay: u16,
    seq: u8,
    kind: u8,
    code: u8,
    colour: u8,
    payload: Vec<u8>,
}

impl FuzzedMessage {
    fn build(&self) -> (Message, PhaseColour) {
        let key = MessageKey {
            sender: u32::from(self.sender) % LPS,
            destination: u32::from(self.destination) % LPS,
            send_time: VirtualTime::new(u64::from(self.send_time)),
            recv_time: VirtualTime::new(u64::from(self.send_time) + u64::from(self.delay)),
            seq: u64::from(self.seq),
        };
        let payload = Bytes::copy_from_slice(&self.payload[..self.payload.len().min(PAYLOAD_CAPACITY)]);
        let code = ControlCode::from_u8(self.code);
        let msg = match (self.kind % 3, code) {
            (1, Some(code)) => Message::control(key, code, payload),
            (2, _) => Message::antimessage(key, code),
            _ => Message::event(key, payload),
        };
        (msg, PhaseColour::from_u8(self.colour % 4).unwrap_or_default())
    }
}

#[derive(Debug, Arbitrary)]
enum Corruption {
    None,
    Overwrite { offset: u16, value: u8 },
    Truncate { keep: u16 },
}

#[derive(Debug, Arbitrary)]
enum Body {
    Raw(Vec<u8>),
    Built(Vec<(FuzzedMessage, Corruption)>),
}

fn render(parts: &[(FuzzedMessage, Corruption)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (fuzzed, corruption) in parts {
        let (msg, colour) = fuzzed.build();
        let mut image = vec![0u8; SLAB_MSG_SIZE];
        let Ok(len) = msg.encode_into(colour, &mut image) else {
            continue;
        };
        image.truncate(len);
        match *corruption {
            Corruption::None => {},
            Corruption::Overwrite { offset, value } => {
                let at = usize::from(offset) % image.len();
                image[at] = value;
            },
            Corruption::Truncate { keep } => image.truncate(usize::from(keep) % (image.len() + 1)),
        }
        body.extend_from_slice(&image);
    }
    body
}

fn check_decode(bytes: &[u8]) {
    let Ok((msg, colour)) = Message::decode(bytes) else {
        return;
    };
    let mut image = vec![0u8; SLAB_MSG_SIZE];
    let len = msg.encode_into(colour, &mut image).expect("decoded message must encode");
    let (again, again_colour) = Message::decode(&image[..len]).expect("re-encoded message must decode");
    assert_eq!(again, msg);
    assert_eq!(again_colour, colour);
}

fuzz_target!(|bodies: Vec<Body>| {
    let config = NodeConfig { pool_capacity: 4, max_violations_per_peer: u32::MAX, ..NodeConfig::default() };
    let placement = Placement::block(NODES, LPS);
    let mut comm = Communicator::new(LOCAL, placement, &config);

    for body in bodies {
        let bytes = match body {
            Body::Raw(raw) => raw,
            Body::Built(parts) => render(&parts),
        };
        check_decode(&bytes);

        let Ok(inbound) = comm.ingest(0, &bytes) else {
            continue;
        };
        assert_eq!(comm.pool().outstanding(), 0, "ingest kept a slab");
        for item in inbound {
            let (Inbound::Positive(msg) | Inbound::Anti(msg) | Inbound::Control(msg)) = item;
            assert!(placement.is_local(LOCAL, msg.key.destination), "misrouted message delivered");
        }
    }
});
