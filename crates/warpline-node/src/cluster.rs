//! Run a whole simulation inside one process.

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use tracing::info;
use warpline_core::{CounterSink, MemoryCheckpoints, Model, Node, NodeConfig, NodeReport, Placement};
use warpline_proto::{LpId, VirtualTime};

use crate::{env::TokioEnv, error::RunnerError, runner::NodeRunner, transport::ChannelTransport};

/// What an in-process run leaves behind.
#[derive(Debug)]
pub struct ClusterRun<S> {
    /// One report per node, in node order
    pub reports: Vec<NodeReport>,
    /// Final state of every LP
    pub states: BTreeMap<LpId, S>,
}

impl<S> ClusterRun<S> {
    /// Events committed across all nodes.
    pub fn committed(&self) -> u64 {
        self.reports.iter().map(|r| r.committed).sum()
    }

    /// Protocol violations across all nodes.
    pub fn violations(&self) -> u32 {
        self.reports.iter().map(|r| r.violations).sum()
    }
}

/// Run one node per task, wired through [`ChannelTransport`], until every
/// node terminates.
///
/// `initial` seeds events on whichever node hosts each LP, in order.
pub async fn run_in_process<M>(
    placement: Placement,
    config: NodeConfig,
    model: M,
    initial: &[(LpId, VirtualTime, Bytes)],
    idle_wait: Duration,
) -> Result<ClusterRun<M::State>, RunnerError>
where
    M: Model + Clone,
{
    let env = TokioEnv::new();
    let mut tasks = Vec::new();
    for (id, transport) in (0..).zip(ChannelTransport::mesh(placement.nodes())) {
        let mut node = Node::new(
            id,
            placement,
            config.clone(),
            env,
            model.clone(),
            MemoryCheckpoints::new(),
            CounterSink::new(),
        );
        for (lp, at, payload) in initial {
            if placement.is_local(id, *lp) {
                node.schedule_initial(*lp, *at, payload.clone())?;
            }
        }

        let mut runner = NodeRunner::new(node, transport, env).with_idle_wait(idle_wait);
        tasks.push(tokio::spawn(async move {
            let report = runner.run().await?;
            Ok::<_, RunnerError>((report, runner.into_node()))
        }));
    }

    let mut reports = Vec::new();
    let mut states = BTreeMap::new();
    for task in tasks {
        let (report, node) = task.await??;
        for lp in placement.lps_on(report.node) {
            if let Some(state) = node.lp_state(lp) {
                states.insert(lp, state.clone());
            }
        }
        reports.push(report);
    }

    info!(
        nodes = reports.len(),
        committed = reports.iter().map(|r| r.committed).sum::<u64>(),
        rollbacks = reports.iter().map(|r| r.rollbacks).sum::<u64>(),
        "simulation finished"
    );
    Ok(ClusterRun { reports, states })
}
