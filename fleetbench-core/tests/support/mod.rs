#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleetbench_core::scenario::{Scenario, ScenarioNode};
use fleetbench_core::{Interpreter, LocalCluster, Report, RunOutcome};
use fleetbench_testservice::{GridMember, InMemoryGrid, MemberOptions};

pub const STAGE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GridCluster {
    pub cluster: LocalCluster,
    pub grid: InMemoryGrid,
    pub members: Vec<Arc<GridMember>>,
}

pub fn grid_cluster(size: usize) -> GridCluster {
    grid_cluster_with(size, |_| MemberOptions::default())
}

pub fn grid_cluster_with(size: usize, options: impl Fn(usize) -> MemberOptions) -> GridCluster {
    let grid = InMemoryGrid::new();
    let members: Vec<Arc<GridMember>> = (0..size).map(|i| grid.member(options(i))).collect();
    let cluster = LocalCluster::spawn(size, STAGE_TIMEOUT, |i| members[i].registry());
    GridCluster {
        cluster,
        grid,
        members,
    }
}

impl GridCluster {
    pub async fn run(&mut self, nodes: Vec<ScenarioNode>) -> RunOutcome {
        let size = self.cluster.size();
        let scenario = Scenario::new(nodes);
        Interpreter::new(self.cluster.master(), Report::new("test", size))
            .run(&scenario)
            .await
    }

    pub async fn shutdown(self) {
        self.cluster.shutdown().await;
    }
}
