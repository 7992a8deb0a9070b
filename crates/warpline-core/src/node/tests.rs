#![allow(clippy::unwrap_used)]

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use warpline_proto::{
    ChannelTag, ControlCode, LpId, Message, MessageKey, PageId, PhaseColour, VirtualTime,
    payloads::RendezvousPayload,
};

use super::{Node, NodeAction};
use crate::{
    checkpoint::MemoryCheckpoints,
    comm::pack_msg,
    config::{NodeConfig, PoolGrowth, RetryPolicy},
    env::Environment,
    error::CoreError,
    metrics::{CounterSink, Stat},
    model::{EventContext, Model},
    placement::Placement,
    rendezvous::SessionState,
};

/// Manually advanced clock.
#[derive(Clone, Default)]
struct TestEnv {
    millis: Arc<AtomicU64>,
}

impl TestEnv {
    fn advance(&self, by: Duration) {
        self.millis.fetch_add(u64::try_from(by.as_millis()).unwrap(), Ordering::SeqCst);
    }
}

impl Environment for TestEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }

    fn sleep(&self, _duration: Duration) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TrailState {
    trail: Vec<u64>,
    page: Vec<u8>,
}

/// Records the time of every event it executes.
///
/// Payload `[hops]` forwards to the next LP one tick later while hops
/// remain; `[0xff, owner]` borrows page 0 of `owner`.
struct Trail {
    lps: LpId,
}

impl Model for Trail {
    type State = TrailState;

    fn init(&self, _lp: LpId) -> TrailState {
        TrailState { trail: Vec::new(), page: b"pg".to_vec() }
    }

    fn on_event(&self, ctx: &mut EventContext, state: &mut TrailState, payload: &[u8]) {
        state.trail.push(ctx.now().ticks());
        match payload {
            [0xff, owner] => ctx.request_page(LpId::from(*owner), 0).unwrap(),
            [hops] if *hops > 0 => {
                let next = (ctx.lp() + 1) % self.lps;
                ctx.schedule(next, ctx.now().saturating_add(1), vec![hops - 1]).unwrap();
            },
            _ => {},
        }
    }

    fn read_page(&self, state: &TrailState, _page: PageId) -> Vec<u8> {
        state.page.clone()
    }

    fn write_page(&self, state: &mut TrailState, _page: PageId, data: &[u8]) {
        state.page = data.to_vec();
    }

    fn on_page(&self, lp: LpId, state: &mut TrailState, _page: PageId, data: &mut Vec<u8>) {
        data.push(b'0' + u8::try_from(lp).unwrap());
        state.trail.push(1000);
    }
}

type TestNode = Node<TestEnv, Trail, MemoryCheckpoints<TrailState>, CounterSink>;

fn node(id: u32, placement: Placement, config: NodeConfig) -> (TestNode, TestEnv) {
    let env = TestEnv::default();
    let model = Trail { lps: placement.lps() };
    let node = Node::new(id, placement, config, env.clone(), model, MemoryCheckpoints::new(), CounterSink::new());
    (node, env)
}

fn config() -> NodeConfig {
    NodeConfig { gvt_period: Duration::ZERO, ..NodeConfig::default() }
}

fn run_until_terminated(node: &mut TestNode) -> Vec<NodeAction> {
    let mut seen = Vec::new();
    for _ in 0..100 {
        let actions = node.step().unwrap();
        let done = actions.iter().any(|a| matches!(a, NodeAction::Terminated));
        seen.extend(actions);
        if done {
            return seen;
        }
    }
    unreachable!("node never terminated")
}

/// Body a remote node would send: one packed image.
fn remote(node: &TestNode, msg: &Message) -> Bytes {
    let slab = pack_msg(node.pool(), msg, PhaseColour::default()).unwrap();
    let body = Bytes::copy_from_slice(slab.as_bytes());
    slab.release();
    body
}

fn from_lp1(seq: u64, send: u64, recv: u64) -> MessageKey {
    MessageKey {
        sender: 1,
        destination: 0,
        send_time: VirtualTime::new(send),
        recv_time: VirtualTime::new(recv),
        seq,
    }
}

fn trail(node: &TestNode, lp: LpId) -> Vec<u64> {
    node.lp_state(lp).unwrap().trail.clone()
}

#[test]
fn single_node_chain_runs_to_end_time() {
    let config = NodeConfig { end_time: VirtualTime::new(10), ..config() };
    let (mut node, _env) = node(0, Placement::block(1, 2), config);
    node.schedule_initial(0, VirtualTime::new(1), vec![100]).unwrap();

    let actions = run_until_terminated(&mut node);

    assert_eq!(trail(&node, 0), vec![1, 3, 5, 7, 9]);
    assert_eq!(trail(&node, 1), vec![2, 4, 6, 8, 10]);
    assert_eq!(node.committed(), 10);
    assert_eq!(node.rollbacks(), 0);
    assert!(node.gvt() > VirtualTime::new(10));
    assert!(actions.iter().any(|a| matches!(a, NodeAction::GvtPublished { .. })));
    assert!(!actions.iter().any(|a| matches!(a, NodeAction::SendBatch { .. })));

    let report = node.fini();
    assert_eq!(report.committed, 10);
    assert_eq!(report.shutdown.leaked, 0);
    assert_eq!(report.violations, 0);
}

#[test]
fn gvt_is_published_in_non_decreasing_order() {
    let config = NodeConfig { end_time: VirtualTime::new(40), events_per_step: 3, ..config() };
    let (mut node, _env) = node(0, Placement::block(1, 3), config);
    node.schedule_initial(0, VirtualTime::new(1), vec![200]).unwrap();

    run_until_terminated(&mut node);

    let published = node.metrics().gvts();
    assert!(published.len() > 2);
    assert!(published.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(node.committed(), 40);
}

#[test]
fn straggler_rolls_back_and_reexecutes_in_order() {
    // LP 1 lives on node 1, which never runs: its traffic is injected.
    let (mut node, _env) = node(0, Placement::block(2, 2), config());
    node.schedule_initial(0, VirtualTime::new(5), Vec::new()).unwrap();
    node.step().unwrap();
    assert_eq!(trail(&node, 0), vec![5]);

    let straggler = Message::event(from_lp1(1, 1, 3), Bytes::new());
    node.receive(1, ChannelTag::Event, &remote(&node, &straggler)).unwrap();
    assert_eq!(node.rollbacks(), 1);
    assert!(trail(&node, 0).is_empty());

    node.step().unwrap();
    assert_eq!(trail(&node, 0), vec![3, 5]);
    assert!(node.metrics().total(Stat::Rollback) >= 1.0);
}

#[test]
fn antimessage_cancels_an_executed_event() {
    let (mut node, _env) = node(0, Placement::block(2, 2), config());
    node.schedule_initial(0, VirtualTime::new(6), Vec::new()).unwrap();

    let key = from_lp1(1, 1, 4);
    node.receive(1, ChannelTag::Event, &remote(&node, &Message::event(key, Bytes::new()))).unwrap();
    node.step().unwrap();
    assert_eq!(trail(&node, 0), vec![4, 6]);

    node.receive(1, ChannelTag::Event, &remote(&node, &Message::antimessage(key, None))).unwrap();
    node.step().unwrap();
    assert_eq!(trail(&node, 0), vec![6]);
    assert_eq!(node.rollbacks(), 1);
    assert_eq!(node.lp(0).unwrap().queued(), 1);
}

#[test]
fn antimessage_before_execution_needs_no_rollback() {
    let (mut node, _env) = node(0, Placement::block(2, 2), config());
    let key = from_lp1(1, 1, 4);
    node.receive(1, ChannelTag::Event, &remote(&node, &Message::event(key, Bytes::new()))).unwrap();
    node.receive(1, ChannelTag::Event, &remote(&node, &Message::antimessage(key, None))).unwrap();
    node.step().unwrap();

    assert!(trail(&node, 0).is_empty());
    assert_eq!(node.rollbacks(), 0);
}

#[test]
fn orphan_antimessage_is_a_violation() {
    let (mut node, _env) = node(0, Placement::block(2, 2), config());
    let orphan = Message::antimessage(from_lp1(1, 1, 4), None);
    node.receive(1, ChannelTag::Event, &remote(&node, &orphan)).unwrap();

    assert_eq!(node.comm().violations().count(1), 1);
    assert!(trail(&node, 0).is_empty());
}

#[test]
fn exhausted_pool_on_receive_is_retryable() {
    let config = NodeConfig { pool_capacity: 1, pool_growth: PoolGrowth::Fixed, ..config() };
    let (mut node, _env) = node(0, Placement::block(2, 2), config);
    let body = remote(&node, &Message::event(from_lp1(1, 1, 4), Bytes::new()));

    let held = node.pool().acquire().unwrap();
    let err = node.receive(1, ChannelTag::Event, &body).unwrap_err();
    assert!(matches!(err, CoreError::PoolExhausted(_)));
    assert!(!err.is_fatal());
    held.release();

    node.receive(1, ChannelTag::Event, &body).unwrap();
    node.step().unwrap();
    assert_eq!(trail(&node, 0), vec![4]);
}

#[test]
fn garbage_gvt_body_is_a_violation() {
    let (mut node, _env) = node(0, Placement::block(2, 2), config());
    node.receive(1, ChannelTag::ComputeGvt, &Bytes::from_static(&[0xff, 0x00, 0x13])).unwrap();
    assert_eq!(node.comm().violations().count(1), 1);
}

#[test]
fn local_rendezvous_completes_and_writes_back() {
    let config = NodeConfig { end_time: VirtualTime::new(10), ..config() };
    let (mut node, _env) = node(0, Placement::block(1, 2), config);
    node.schedule_initial(0, VirtualTime::new(2), vec![0xff, 1]).unwrap();

    run_until_terminated(&mut node);

    let session = node.rendezvous().session(0, 0).map(|s| s.state);
    assert!(matches!(session, Some(SessionState::Done) | None));
    assert_eq!(node.lp_state(1).unwrap().page, b"pg0".to_vec());
    assert_eq!(trail(&node, 0), vec![2, 1000]);
    assert_eq!(node.rendezvous().open_lends(), 0);
    assert!(node.lp(0).unwrap().blocked_at().is_none());
    assert!(node.lp(1).unwrap().blocked_at().is_none());
}

#[test]
fn unanswered_start_times_out_until_exhausted() {
    // The owner (LP 1) is on a node that never answers.
    let retry = RetryPolicy {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        max_attempts: 2,
    };
    let config = NodeConfig { rendezvous_timeout: Duration::from_millis(5), rendezvous_retry: retry, ..config() };
    let (mut node, env) = node(0, Placement::block(2, 2), config);
    node.schedule_initial(0, VirtualTime::new(2), vec![0xff, 1]).unwrap();
    let actions = node.step().unwrap();
    assert!(actions.iter().any(|a| matches!(a, NodeAction::SendBatch { to: 1, .. })));
    assert_eq!(node.lp(0).unwrap().blocked_at(), Some(VirtualTime::new(2)));

    env.advance(Duration::from_millis(4));
    node.step().unwrap();
    assert_eq!(node.rendezvous().session(0, 0).map(|s| s.state), Some(SessionState::WaitingAck));

    env.advance(Duration::from_millis(1));
    node.step().unwrap();
    let session = node.rendezvous().session(0, 0).unwrap();
    assert_eq!((session.state, session.attempts), (SessionState::Idle, 1));
    assert!(node.lp(0).unwrap().blocked_at().is_none());
    assert_eq!(node.rollbacks(), 1);

    env.advance(Duration::from_millis(1));
    node.step().unwrap();
    let session = node.rendezvous().session(0, 0).unwrap();
    assert_eq!((session.state, session.attempts), (SessionState::WaitingAck, 2));

    // second timeout, then the next request has no attempts left
    env.advance(Duration::from_millis(5));
    node.step().unwrap();
    env.advance(Duration::from_millis(1));
    let err = node.step().unwrap_err();
    assert!(matches!(err, CoreError::RendezvousExhausted { lp: 0, page: 0, attempts: 2 }));
    assert!(err.is_fatal());
}

#[test]
fn failure_inside_an_entry_is_fatal() {
    let (mut node, _env) = node(0, Placement::block(2, 2), config());
    // a stale session on the same page makes the request fail after the
    // event body has already run
    node.rendezvous.begin(0, 1, 0, VirtualTime::new(1)).unwrap();
    node.schedule_initial(0, VirtualTime::new(2), vec![0xff, 1]).unwrap();

    let err = node.step().unwrap_err();
    assert!(err.is_fatal());
    let CoreError::EventAborted { lp, time, source } = err else {
        panic!("expected EventAborted, got {err:?}");
    };
    assert_eq!((lp, time), (0, VirtualTime::new(2)));
    assert!(matches!(*source, CoreError::Rendezvous(_)));
}

#[test]
fn owner_silent_after_ack_times_out_and_retries() {
    let config = NodeConfig { rendezvous_timeout: Duration::from_millis(5), ..config() };
    let (mut node, env) = node(0, Placement::block(2, 2), config);
    node.schedule_initial(0, VirtualTime::new(2), vec![0xff, 1]).unwrap();
    node.step().unwrap();

    let ack = Message::control(
        MessageKey {
            sender: 1,
            destination: 0,
            send_time: VirtualTime::new(2),
            recv_time: VirtualTime::new(2),
            seq: 0,
        },
        ControlCode::RendezvousAck,
        RendezvousPayload::new(1, 0).encode().unwrap(),
    );
    node.receive(1, ChannelTag::Event, &remote(&node, &ack)).unwrap();
    assert_eq!(node.rendezvous().session(0, 0).map(|s| s.state), Some(SessionState::PageRequested));

    env.advance(Duration::from_millis(10));
    node.step().unwrap();
    let session = node.rendezvous().session(0, 0).unwrap();
    assert_eq!(session.state, SessionState::Idle);
    assert!(node.lp(0).unwrap().blocked_at().is_none());
    assert!(trail(&node, 0).is_empty());

    // held for the backoff, then the request is made again
    env.advance(Duration::from_millis(2));
    node.step().unwrap();
    let session = node.rendezvous().session(0, 0).unwrap();
    assert_eq!((session.mark, session.attempts, session.state), (2, 2, SessionState::WaitingAck));
    assert_eq!(trail(&node, 0), vec![2]);
}
