//! End-to-end runs of the tokio runtime.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use warpline_core::{CounterSink, MemoryCheckpoints, Node, NodeConfig, Placement};
use warpline_node::{NodeRunner, Phold, PholdConfig, StreamTransport, TokioEnv, run_in_process};
use warpline_proto::VirtualTime;

fn config(end: u64) -> NodeConfig {
    NodeConfig {
        end_time: VirtualTime::new(end),
        gvt_period: Duration::from_millis(5),
        ..NodeConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn phold_runs_to_completion_in_process() {
    let model = Phold::new(PholdConfig { lps: 16, population: 2, ..PholdConfig::default() });
    let placement = Placement::block(4, 16);

    let run = run_in_process(placement, config(200), model, &model.initial_events(), Duration::from_millis(1))
        .await
        .unwrap();

    assert_eq!(run.reports.len(), 4);
    assert_eq!(run.states.len(), 16);
    assert_eq!(run.violations(), 0);
    for report in &run.reports {
        assert!(report.gvt > VirtualTime::new(200), "node {} stopped at {}", report.node, report.gvt);
        assert_eq!(report.shutdown.leaked, 0);
    }

    let executed: u64 = run.states.values().map(|s| s.processed).sum();
    assert_eq!(run.committed(), executed, "every surviving execution is committed");
    assert!(executed >= 16 * 2, "each seed event runs at least once");
}

#[tokio::test]
async fn single_node_needs_no_peers() {
    let model = Phold::new(PholdConfig { lps: 4, population: 1, remote_percent: 100, ..PholdConfig::default() });
    let run = run_in_process(Placement::block(1, 4), config(50), model, &model.initial_events(), Duration::from_millis(1))
        .await
        .unwrap();

    assert_eq!(run.reports[0].rollbacks, 0);
    assert_eq!(run.reports[0].antimessages, 0);
    assert_eq!(run.committed(), run.states.values().map(|s| s.processed).sum::<u64>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_nodes_over_a_byte_stream() {
    let model = Phold::new(PholdConfig { lps: 6, population: 2, remote_percent: 80, ..PholdConfig::default() });
    let placement = Placement::block(2, 6);
    let (left, right) = tokio::io::duplex(64 * 1024);

    let mut handles = Vec::new();
    for (id, stream) in [(0u32, left), (1u32, right)] {
        let env = TokioEnv::new();
        let mut node =
            Node::new(id, placement, config(100), env, model, MemoryCheckpoints::new(), CounterSink::new());
        for (lp, at, payload) in model.initial_events() {
            if placement.is_local(id, lp) {
                node.schedule_initial(lp, at, payload).unwrap();
            }
        }
        let transport = StreamTransport::new(id, [(1 - id, stream)]);
        let mut runner = NodeRunner::new(node, transport, env);
        handles.push(tokio::spawn(async move { runner.run().await }));
    }

    let mut committed = 0;
    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.violations, 0);
        assert_eq!(report.shutdown.leaked, 0);
        committed += report.committed;
    }
    assert!(committed >= 12);
}
