//! Cancelling an executed remote event.
//!
//! LP 0 on node 0 sends E1 (seq 1, sent at 10, due at 15) to LP 1 on
//! node 1. Once LP 1 has executed it, a straggler drags LP 0 back to 10.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use warpline_core::{NodeConfig, Placement};
use warpline_harness::{Command, PageModel, SimCluster, SimConfig, message_body};
use warpline_proto::{Message, MessageKey, VirtualTime};

#[test]
fn executed_event_is_cancelled_and_replayed_once() {
    let config =
        NodeConfig { end_time: VirtualTime::new(50), gvt_period: Duration::from_millis(1), ..NodeConfig::default() };
    let mut cluster = SimCluster::new(Placement::block(2, 2), &config, PageModel, SimConfig::default());
    cluster.schedule_initial(0, VirtualTime::new(10), Command::Send { dest: 1, delay: 5 }.encode()).unwrap();

    cluster.step(0).unwrap();
    assert_eq!(cluster.pending(0, 1), 1);
    assert!(cluster.deliver(0, 1).unwrap());
    cluster.step(1).unwrap();
    assert_eq!(cluster.lp_state(1).unwrap().log, vec![15]);

    let key = MessageKey {
        sender: 1,
        destination: 0,
        send_time: VirtualTime::new(5),
        recv_time: VirtualTime::new(10),
        seq: 1,
    };
    let straggler = message_body(&Message::event(key, Command::Note.encode())).unwrap();
    cluster.inject(1, 0, &straggler).unwrap();
    assert_eq!(cluster.node(0).unwrap().rollbacks(), 1);

    cluster.step(0).unwrap();
    assert!(cluster.deliver(0, 1).unwrap());
    let receiver = cluster.node(1).unwrap();
    assert_eq!(receiver.rollbacks(), 1);
    assert!(receiver.lp_state(1).unwrap().log.is_empty());

    let run = cluster.run().unwrap();
    assert_eq!(run.violations(), 0);
    assert_eq!(run.leaked(), 0);
    assert_eq!(run.states[&0].log, vec![10, 10]);
    assert_eq!(run.states[&1].log, vec![15]);
    assert_eq!(run.reports[0].antimessages, 1);
    assert_eq!(run.committed(), 3);
}

#[test]
fn unexecuted_event_is_annihilated_without_rollback() {
    let config =
        NodeConfig { end_time: VirtualTime::new(50), gvt_period: Duration::from_millis(1), ..NodeConfig::default() };
    let mut cluster = SimCluster::new(Placement::block(2, 2), &config, PageModel, SimConfig::default());
    cluster.schedule_initial(0, VirtualTime::new(10), Command::Send { dest: 1, delay: 5 }.encode()).unwrap();

    cluster.step(0).unwrap();
    assert!(cluster.deliver(0, 1).unwrap());

    let key = MessageKey {
        sender: 1,
        destination: 0,
        send_time: VirtualTime::new(5),
        recv_time: VirtualTime::new(10),
        seq: 1,
    };
    let straggler = message_body(&Message::event(key, Command::Note.encode())).unwrap();
    cluster.inject(1, 0, &straggler).unwrap();
    cluster.step(0).unwrap();
    assert!(cluster.deliver(0, 1).unwrap());

    // node 1 never stepped, so E1 was still pending when the anti arrived
    assert_eq!(cluster.node(1).unwrap().rollbacks(), 0);

    let run = cluster.run().unwrap();
    assert_eq!(run.violations(), 0);
    assert_eq!(run.states[&1].log, vec![15]);
    assert_eq!(run.reports[1].rollbacks, 0);
}
