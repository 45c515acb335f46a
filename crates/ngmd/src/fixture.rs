//! Fixture mode: seed the in-memory collaborators and the store from a
//! JSON snapshot so both loops can run without a live cluster or broker.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ngm_cluster::{Device, MemoryCluster, MemoryResourceManager, Node, ResourcePool};
use ngm_state::{
    CreateOptions, NodeGroup, NodeGroupMgrStrategy, ScaleDownTask, StateError, Storage,
};

/// A node and the cluster it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureNode {
    pub cluster_id: String,
    #[serde(flatten)]
    pub node: Node,
}

/// A drain task as published by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureTask {
    pub consumer_id: String,
    pub pool_id: String,
    #[serde(flatten)]
    pub task: ScaleDownTask,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureSnapshot {
    pub nodes: Vec<FixtureNode>,
    pub pools: Vec<ResourcePool>,
    pub devices: Vec<Device>,
    pub tasks: Vec<FixtureTask>,
    pub strategies: Vec<NodeGroupMgrStrategy>,
    pub node_groups: Vec<NodeGroup>,
}

/// Counts of what a snapshot contributed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub nodes: usize,
    pub pools: usize,
    pub devices: usize,
    pub tasks: usize,
    pub strategies: usize,
    pub node_groups: usize,
}

impl FixtureSnapshot {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let snapshot: FixtureSnapshot = serde_json::from_str(&content)?;
        Ok(snapshot)
    }

    /// Push the snapshot into the collaborators. Strategies and node groups
    /// already in the store are left alone so a restart keeps its state.
    pub async fn load(
        self,
        storage: &dyn Storage,
        cluster: &MemoryCluster,
        broker: &MemoryResourceManager,
    ) -> anyhow::Result<LoadSummary> {
        let mut summary = LoadSummary {
            nodes: self.nodes.len(),
            pools: self.pools.len(),
            devices: self.devices.len(),
            tasks: self.tasks.len(),
            ..Default::default()
        };

        for FixtureNode { cluster_id, node } in self.nodes {
            cluster.add_node(&cluster_id, node).await;
        }
        for pool in self.pools {
            broker.put_pool(pool).await;
        }
        for device in self.devices {
            broker.add_device(device).await;
        }
        for FixtureTask {
            consumer_id,
            pool_id,
            task,
        } in self.tasks
        {
            broker.put_task(&consumer_id, &pool_id, task).await;
        }

        for strategy in &self.strategies {
            if seeded(storage.create_node_group_strategy(strategy, &CreateOptions::default()))? {
                summary.strategies += 1;
            } else {
                debug!(strategy = %strategy.name, "strategy already stored, keeping it");
            }
        }
        for group in &self.node_groups {
            if seeded(storage.create_node_group(group, &CreateOptions::default()))? {
                summary.node_groups += 1;
            } else {
                debug!(node_group = %group.node_group_id, "node group already stored, keeping it");
            }
        }

        info!(
            nodes = summary.nodes,
            pools = summary.pools,
            devices = summary.devices,
            tasks = summary.tasks,
            strategies = summary.strategies,
            node_groups = summary.node_groups,
            "fixture loaded"
        );
        Ok(summary)
    }
}

/// `Ok(false)` when the record was already present.
fn seeded(result: Result<(), StateError>) -> anyhow::Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(StateError::AlreadyExists { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
