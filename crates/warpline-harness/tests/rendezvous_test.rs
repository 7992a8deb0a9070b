//! Page rendezvous between two nodes, stepped by hand.
//!
//! LP 7 (node 1) borrows page 3 of LP 2 (node 0) from an event at time 10.
//! The later cases run whole clusters: two LPs borrowing from each other at
//! the same time, an owner that is busy, and one that never answers.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use warpline_core::{CoreError, NodeConfig, Placement, RetryPolicy, SessionState};
use warpline_harness::{
    Command, PageModel, PageState, SimCluster, SimConfig, SimError, SimRun, borrow, message_body,
};
use warpline_proto::{Message, MessageKey, VirtualTime};

const OWNER: u32 = 2;
const REQUESTER: u32 = 7;
const PAGE: u32 = 3;

fn cluster() -> SimCluster<PageModel> {
    let config =
        NodeConfig { end_time: VirtualTime::new(100), gvt_period: Duration::from_millis(1), ..NodeConfig::default() };
    let mut cluster = SimCluster::new(Placement::block(2, 8), &config, PageModel, SimConfig::default());
    let (at, payload) = borrow(OWNER, PAGE, 10);
    cluster.schedule_initial(REQUESTER, at, payload).unwrap();
    cluster
}

/// Step `from` so it flushes, then deliver one event body to `to`.
fn shuttle(cluster: &mut SimCluster<PageModel>, from: u32, to: u32) {
    cluster.step(from).unwrap();
    assert!(cluster.deliver(from, to).unwrap(), "nothing to deliver from {from} to {to}");
}

fn session_state(cluster: &SimCluster<PageModel>) -> Option<SessionState> {
    cluster.node(1).unwrap().rendezvous().session(REQUESTER, PAGE).map(|s| s.state)
}

fn owner_page(cluster: &SimCluster<PageModel>) -> Vec<u8> {
    cluster.lp_state(OWNER).unwrap().page(PAGE).unwrap().to_vec()
}

/// Walk the handshake up to the point where the requester has sent the
/// modified page back, leaving the write-back on the wire.
fn up_to_writeback(cluster: &mut SimCluster<PageModel>) {
    shuttle(cluster, 1, 0); // START
    assert_eq!(session_state(cluster), Some(SessionState::WaitingAck));
    shuttle(cluster, 0, 1); // ACK
    shuttle(cluster, 1, 0); // GET_PAGE
    shuttle(cluster, 0, 1); // GET_PAGE_ACK
    cluster.step(1).unwrap();
    assert_eq!(session_state(cluster), Some(SessionState::WritebackSent));
    assert_eq!(cluster.pending(1, 0), 1);
    assert_eq!(cluster.node(0).unwrap().lp(OWNER).unwrap().blocked_at(), Some(VirtualTime::new(10)));
}

#[test]
fn borrowed_page_is_written_back_and_session_ends_done() {
    let mut cluster = cluster();
    up_to_writeback(&mut cluster);

    assert!(cluster.deliver(1, 0).unwrap()); // PAGE_WRITE_BACK
    assert_eq!(owner_page(&cluster), b"lp2p3+7");
    assert_eq!(cluster.node(0).unwrap().lp(OWNER).unwrap().blocked_at(), None);

    shuttle(&mut cluster, 0, 1); // UNBLOCK(Completed)
    assert_eq!(session_state(&cluster), Some(SessionState::Done));
    let requester = cluster.node(1).unwrap().lp(REQUESTER).unwrap();
    assert_eq!(requester.blocked_at(), None);
    assert_eq!(requester.state().borrowed, vec![(OWNER, PAGE)]);

    let run = cluster.run().unwrap();
    assert_eq!(run.violations(), 0);
    assert_eq!(run.leaked(), 0);
    assert_eq!(run.states[&OWNER].page(PAGE).unwrap(), b"lp2p3+7");
    assert_eq!(run.states[&REQUESTER].borrowed, vec![(OWNER, PAGE)]);
}

#[test]
fn owner_rollback_before_writeback_rolls_the_requester_back() {
    let mut cluster = cluster();
    up_to_writeback(&mut cluster);

    // LP 5 (node 1) reaches the owner at time 10, ahead of the START.
    let key = MessageKey {
        sender: 5,
        destination: OWNER,
        send_time: VirtualTime::new(4),
        recv_time: VirtualTime::new(10),
        seq: 1,
    };
    let straggler = message_body(&Message::event(key, Command::Note.encode())).unwrap();
    cluster.inject(1, 0, &straggler).unwrap();
    assert_eq!(cluster.node(0).unwrap().rollbacks(), 1);
    assert_eq!(cluster.node(0).unwrap().rendezvous().open_lends(), 0);

    // The write-back answers a revoked lend and is dropped.
    assert!(cluster.deliver(1, 0).unwrap());
    assert_eq!(owner_page(&cluster), b"lp2p3");

    shuttle(&mut cluster, 0, 1); // RENDEZVOUS_ROLLBACK
    assert_eq!(session_state(&cluster), Some(SessionState::RolledBack));
    let requester = cluster.node(1).unwrap().lp(REQUESTER).unwrap();
    assert_eq!(requester.blocked_at(), None);
    assert!(requester.state().borrowed.is_empty());
    assert_eq!(cluster.node(1).unwrap().rollbacks(), 1);

    // Left alone, the retry goes through.
    let run = cluster.run().unwrap();
    assert_eq!(run.violations(), 0);
    assert_eq!(run.leaked(), 0);
    assert_eq!(run.states[&OWNER].page(PAGE).unwrap(), b"lp2p3+7");
    assert_eq!(run.states[&OWNER].log, vec![10]);
    assert_eq!(run.states[&REQUESTER].borrowed, vec![(OWNER, PAGE)]);
    assert_eq!(run.states[&REQUESTER].log, vec![10]);
}

#[test]
fn concurrent_borrowers_of_one_page_all_finish() {
    let config =
        NodeConfig { end_time: VirtualTime::new(200), gvt_period: Duration::from_millis(1), ..NodeConfig::default() };
    for seed in 0..8 {
        let mut cluster =
            SimCluster::new(Placement::block(3, 9), &config, PageModel, SimConfig { seed, ..SimConfig::default() });
        for (lp, at) in [(4, 20), (7, 20), (8, 35), (1, 50)] {
            let (at, payload) = borrow(0, 1, at);
            cluster.schedule_initial(lp, at, payload).unwrap();
        }

        let run = cluster.run().unwrap();
        assert_eq!(run.violations(), 0, "seed {seed}");
        let mut page = run.states[&0].page(1).unwrap().to_vec();
        assert!(page.starts_with(b"lp0p1"), "seed {seed}");
        page.drain(..5);
        // Borrowers at equal times are served in sender order.
        assert_eq!(page, b"+4+7+8+1", "seed {seed}");
    }
}

/// LP `a` and LP `b` borrow page 0 from each other at the same time.
fn mutual_borrow(a: u32, b: u32, seed: u64) -> SimRun<PageState> {
    let config =
        NodeConfig { end_time: VirtualTime::new(100), gvt_period: Duration::from_millis(1), ..NodeConfig::default() };
    let mut cluster =
        SimCluster::new(Placement::block(2, 8), &config, PageModel, SimConfig { seed, ..SimConfig::default() });
    for (lp, peer) in [(a, b), (b, a)] {
        let (at, payload) = borrow(peer, 0, 20);
        cluster.schedule_initial(lp, at, payload).unwrap();
    }
    cluster.run().unwrap()
}

fn assert_swapped(run: &SimRun<PageState>, a: u32, b: u32) {
    for (lp, peer) in [(a, b), (b, a)] {
        let edited = format!("lp{lp}p0+{peer}");
        assert_eq!(run.states[&lp].page(0).unwrap(), edited.as_bytes());
        assert_eq!(run.states[&lp].borrowed, vec![(peer, 0)]);
        assert_eq!(run.states[&lp].log, vec![20]);
    }
    assert_eq!(run.violations(), 0);
    assert_eq!(run.leaked(), 0);
}

#[test]
fn mutual_borrow_on_one_node_finishes() {
    for seed in 0..4 {
        let run = mutual_borrow(1, 2, seed);
        assert_swapped(&run, 1, 2);
    }
}

#[test]
fn mutual_borrow_across_nodes_finishes() {
    for seed in 0..8 {
        let run = mutual_borrow(1, 5, seed);
        assert_swapped(&run, 1, 5);
    }
}

#[test]
fn busy_owner_is_retried_and_served() {
    // LP 1 waits on LP 3 when LP 2 asks LP 1 for a page at the same time.
    let config =
        NodeConfig { end_time: VirtualTime::new(100), gvt_period: Duration::from_millis(1), ..NodeConfig::default() };
    let mut cluster = SimCluster::new(Placement::block(1, 4), &config, PageModel, SimConfig::default());
    for (lp, owner) in [(1, 3), (2, 1)] {
        let (at, payload) = borrow(owner, 0, 20);
        cluster.schedule_initial(lp, at, payload).unwrap();
    }

    cluster.step(0).unwrap();
    let node = cluster.node(0).unwrap();
    let refused = node.rendezvous().session(2, 0).unwrap();
    assert_eq!((refused.state, refused.attempts), (SessionState::Idle, 1));
    assert_eq!(node.lp(2).unwrap().blocked_at(), None);
    assert!(node.rollbacks() >= 1);

    let run = cluster.run().unwrap();
    assert_eq!(run.violations(), 0);
    assert_eq!(run.states[&3].page(0).unwrap(), b"lp3p0+1");
    assert_eq!(run.states[&1].page(0).unwrap(), b"lp1p0+2");
    assert_eq!(run.states[&1].borrowed, vec![(3, 0)]);
    assert_eq!(run.states[&2].borrowed, vec![(1, 0)]);
    assert_eq!(run.states[&2].log, vec![20]);
}

#[test]
fn silent_owner_exhausts_the_retries() {
    let retry = RetryPolicy {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        max_attempts: 2,
    };
    let config = NodeConfig {
        end_time: VirtualTime::new(100),
        rendezvous_timeout: Duration::from_millis(1),
        rendezvous_retry: retry,
        ..NodeConfig::default()
    };
    let mut cluster = SimCluster::new(Placement::block(2, 8), &config, PageModel, SimConfig::default());
    let (at, payload) = borrow(OWNER, PAGE, 10);
    cluster.schedule_initial(REQUESTER, at, payload).unwrap();

    // node 0 never runs, so every START goes unanswered
    let mut outcome = Ok(());
    for _ in 0..20 {
        cluster.env().advance(Duration::from_millis(1));
        outcome = cluster.step(1);
        if outcome.is_err() {
            break;
        }
    }
    let Err(SimError::Node { node, error }) = outcome else {
        panic!("requester never gave up: {outcome:?}");
    };
    assert_eq!(node, 1);
    assert!(matches!(error, CoreError::RendezvousExhausted { lp: REQUESTER, page: PAGE, attempts: 2 }));
    assert!(cluster.pending(1, 0) >= 2);
}
