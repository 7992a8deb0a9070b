//! The optimistic cluster against the sequential reference.
//!
//! Whatever the node count, checkpoint interval or delivery interleaving,
//! committed LP states must be exactly what running every event in
//! timestamp order produces.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use proptest::prelude::*;
use warpline_core::{NodeConfig, Placement};
use warpline_harness::{SimCluster, SimConfig, sequential};
use warpline_node::{Phold, PholdConfig};
use warpline_proto::VirtualTime;

const END: u64 = 60;

fn node_config(checkpoint_interval: u32) -> NodeConfig {
    NodeConfig {
        end_time: VirtualTime::new(END),
        gvt_period: Duration::from_millis(1),
        checkpoint_interval,
        ..NodeConfig::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn phold_matches_sequential_run(
        seed in any::<u64>(),
        interleaving in any::<u64>(),
        nodes in 1u32..=4,
        lps in 4u32..=12,
        remote_percent in 0u8..=100,
        checkpoint_interval in 1u32..=8,
    ) {
        let model = Phold::new(PholdConfig {
            lps,
            population: 2,
            remote_percent,
            lookahead: 1,
            jitter: 6,
            seed,
        });
        let initial = model.initial_events();
        let expected = sequential(&model, lps, &initial, VirtualTime::new(END)).unwrap();

        let sim = SimConfig { seed: interleaving, ..SimConfig::default() };
        let mut cluster = SimCluster::new(Placement::block(nodes, lps), &node_config(checkpoint_interval), model, sim);
        cluster.seed(&initial).unwrap();
        let run = cluster.run().unwrap();

        prop_assert_eq!(run.violations(), 0);
        prop_assert_eq!(run.leaked(), 0);
        prop_assert_eq!(&run.states, &expected.states);
        prop_assert_eq!(run.committed(), expected.committed);
        for report in &run.reports {
            prop_assert!(report.gvt > VirtualTime::new(END));
        }
    }
}

#[test]
fn same_seeds_replay_identically() {
    let model = Phold::new(PholdConfig { lps: 8, population: 2, seed: 7, ..PholdConfig::default() });
    let play = || {
        let sim = SimConfig { seed: 99, ..SimConfig::default() };
        let mut cluster = SimCluster::new(Placement::block(2, 8), &node_config(4), model, sim);
        cluster.seed(&model.initial_events()).unwrap();
        cluster.run().unwrap()
    };

    let (first, second) = (play(), play());
    assert_eq!(first.turns, second.turns);
    assert_eq!(first.states, second.states);
    assert_eq!(
        first.reports.iter().map(|r| r.rollbacks).collect::<Vec<_>>(),
        second.reports.iter().map(|r| r.rollbacks).collect::<Vec<_>>()
    );
}
