//! GVT across a live cluster.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use warpline_core::{NodeConfig, Placement};
use warpline_harness::{Command, PageModel, SimCluster, SimConfig};
use warpline_node::{Phold, PholdConfig};
use warpline_proto::VirtualTime;

#[test]
fn gvt_is_the_smallest_local_minimum() {
    let config =
        NodeConfig { end_time: VirtualTime::new(50), gvt_period: Duration::from_millis(1), ..NodeConfig::default() };
    let mut cluster = SimCluster::new(Placement::block(3, 3), &config, PageModel, SimConfig::default());
    for (lp, at) in [(0, 100), (1, 85), (2, 120)] {
        cluster.schedule_initial(lp, VirtualTime::new(at), Command::Note.encode()).unwrap();
    }

    cluster.run_to_end().unwrap();
    for id in 0..3 {
        let node = cluster.node(id).unwrap();
        assert_eq!(node.metrics().gvts(), [VirtualTime::new(85)], "node {id}");
    }

    let run = cluster.finish();
    assert!(run.reports.iter().all(|r| r.gvt == VirtualTime::new(85)));
    assert_eq!(run.committed(), 0);
    assert!(run.states.values().all(|s| s.log.is_empty()));
}

#[test]
fn published_gvt_never_decreases() {
    let model = Phold::new(PholdConfig { lps: 12, population: 3, ..PholdConfig::default() });
    let config =
        NodeConfig { end_time: VirtualTime::new(150), gvt_period: Duration::from_micros(500), ..NodeConfig::default() };

    for seed in 0..6 {
        let mut cluster =
            SimCluster::new(Placement::block(3, 12), &config, model, SimConfig { seed, ..SimConfig::default() });
        cluster.seed(&model.initial_events()).unwrap();
        cluster.run_to_end().unwrap();

        for id in 0..3 {
            let gvts = cluster.node(id).unwrap().metrics().gvts().to_vec();
            assert!(gvts.len() > 1, "seed {seed} node {id} saw a single round");
            assert!(gvts.windows(2).all(|w| w[0] <= w[1]), "seed {seed} node {id}: {gvts:?}");
            assert!(gvts.last().is_some_and(|g| *g > VirtualTime::new(150)));
        }
        assert_eq!(cluster.finish().violations(), 0);
    }
}
