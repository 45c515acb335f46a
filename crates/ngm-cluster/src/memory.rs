//! In-memory collaborators for tests and fixture mode.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use ngm_state::{ScaleDownTask, TaskStatus};

use crate::client::{ClusterClient, ResourceManager};
use crate::error::{ClientError, ClientResult};
use crate::labels::NodeLabels;
use crate::types::*;

// ── Cluster ────────────────────────────────────────────────────────

#[derive(Default)]
struct ClusterInner {
    /// cluster_id → node name → node.
    nodes: BTreeMap<String, BTreeMap<String, Node>>,
    nodegroup_max: BTreeMap<(String, String), u32>,
    metadata_updates: usize,
    failing: bool,
}

/// A cluster API backed by maps. Node-group membership is read from the
/// node-group label.
#[derive(Default)]
pub struct MemoryCluster {
    labels: NodeLabels,
    inner: RwLock<ClusterInner>,
}

impl MemoryCluster {
    pub fn new(labels: NodeLabels) -> Self {
        Self {
            labels,
            inner: RwLock::new(ClusterInner::default()),
        }
    }

    /// Insert or replace a node.
    pub async fn add_node(&self, cluster_id: &str, node: Node) {
        let mut inner = self.inner.write().await;
        inner
            .nodes
            .entry(cluster_id.to_string())
            .or_default()
            .insert(node.name.clone(), node);
    }

    pub async fn remove_node(&self, cluster_id: &str, name: &str) -> Option<Node> {
        let mut inner = self.inner.write().await;
        inner.nodes.get_mut(cluster_id)?.remove(name)
    }

    pub async fn set_ready(&self, cluster_id: &str, name: &str, ready: bool) {
        let mut inner = self.inner.write().await;
        if let Some(node) = inner.nodes.get_mut(cluster_id).and_then(|n| n.get_mut(name)) {
            node.ready = ready;
        }
    }

    pub async fn node(&self, cluster_id: &str, name: &str) -> Option<Node> {
        let inner = self.inner.read().await;
        inner.nodes.get(cluster_id)?.get(name).cloned()
    }

    pub async fn node_by_ip(&self, ip: &str) -> Option<Node> {
        let inner = self.inner.read().await;
        inner
            .nodes
            .values()
            .flat_map(|nodes| nodes.values())
            .find(|n| n.ip == ip)
            .cloned()
    }

    pub async fn nodegroup_max(&self, cluster_id: &str, node_group_id: &str) -> Option<u32> {
        let inner = self.inner.read().await;
        inner
            .nodegroup_max
            .get(&(cluster_id.to_string(), node_group_id.to_string()))
            .copied()
    }

    /// Number of successful `update_node_metadata` calls so far.
    pub async fn metadata_updates(&self) -> usize {
        self.inner.read().await.metadata_updates
    }

    /// Make every call fail with `Unavailable`.
    pub async fn set_failing(&self, failing: bool) {
        self.inner.write().await.failing = failing;
    }

    async fn check_available(&self) -> ClientResult<()> {
        if self.inner.read().await.failing {
            return Err(ClientError::Unavailable("memory cluster".to_string()));
        }
        Ok(())
    }
}

fn apply_patch(target: &mut BTreeMap<String, String>, patch: &MetadataPatch) {
    for (key, value) in patch {
        match value {
            Some(v) => {
                target.insert(key.clone(), v.clone());
            }
            None => {
                target.remove(key);
            }
        }
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn list_cluster_nodes(&self, cluster_id: &str) -> ClientResult<Vec<Node>> {
        self.check_available().await?;
        let inner = self.inner.read().await;
        Ok(inner
            .nodes
            .get(cluster_id)
            .map(|nodes| nodes.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_nodes_by_label(
        &self,
        cluster_id: &str,
        selector: &BTreeMap<String, String>,
    ) -> ClientResult<BTreeMap<String, Node>> {
        self.check_available().await?;
        let inner = self.inner.read().await;
        let Some(nodes) = inner.nodes.get(cluster_id) else {
            return Ok(BTreeMap::new());
        };
        Ok(nodes
            .iter()
            .filter(|(_, node)| selector.iter().all(|(k, v)| node.label(k) == Some(v.as_str())))
            .map(|(name, node)| (name.clone(), node.clone()))
            .collect())
    }

    async fn update_node_metadata(
        &self,
        cluster_id: &str,
        node_name: &str,
        labels: &MetadataPatch,
        annotations: &MetadataPatch,
    ) -> ClientResult<()> {
        self.check_available().await?;
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(cluster_id)
            .and_then(|nodes| nodes.get_mut(node_name))
            .ok_or_else(|| ClientError::NotFound(format!("{cluster_id}/{node_name}")))?;
        apply_patch(&mut node.labels, labels);
        apply_patch(&mut node.annotations, annotations);
        inner.metadata_updates += 1;
        debug!(cluster_id, node_name, "node metadata updated");
        Ok(())
    }

    async fn get_node_detail(&self, ip: &str) -> ClientResult<NodeDetail> {
        self.check_available().await?;
        let inner = self.inner.read().await;
        inner
            .nodes
            .iter()
            .flat_map(|(cluster_id, nodes)| nodes.values().map(move |n| (cluster_id, n)))
            .find(|(_, n)| n.ip == ip)
            .map(|(cluster_id, n)| NodeDetail {
                name: n.name.clone(),
                ip: n.ip.clone(),
                cluster_id: cluster_id.clone(),
                node_group_id: n.label(&self.labels.node_group).map(str::to_string),
                ready: n.ready,
            })
            .ok_or_else(|| ClientError::NotFound(ip.to_string()))
    }

    async fn update_nodegroup_max(
        &self,
        cluster_id: &str,
        node_group_id: &str,
        max_size: u32,
    ) -> ClientResult<()> {
        self.check_available().await?;
        let mut inner = self.inner.write().await;
        inner
            .nodegroup_max
            .insert((cluster_id.to_string(), node_group_id.to_string()), max_size);
        debug!(cluster_id, node_group_id, max_size, "node group max updated");
        Ok(())
    }
}

// ── Resource broker ────────────────────────────────────────────────

struct ExternalTask {
    consumer_id: String,
    pool_id: String,
    task: ScaleDownTask,
}

#[derive(Default)]
struct BrokerInner {
    pools: BTreeMap<String, ResourcePool>,
    devices: Vec<Device>,
    tasks: BTreeMap<String, ExternalTask>,
    filled: BTreeMap<String, Vec<String>>,
    failing: bool,
}

/// A resource broker backed by maps.
#[derive(Default)]
pub struct MemoryResourceManager {
    inner: RwLock<BrokerInner>,
}

impl MemoryResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_pool(&self, pool: ResourcePool) {
        let mut inner = self.inner.write().await;
        inner.pools.insert(pool.pool_id.clone(), pool);
    }

    pub async fn add_device(&self, device: Device) {
        self.inner.write().await.devices.push(device);
    }

    /// Publish a drain task for `consumer_id` against `pool_id`.
    pub async fn put_task(&self, consumer_id: &str, pool_id: &str, task: ScaleDownTask) {
        let mut inner = self.inner.write().await;
        inner.tasks.insert(
            task.task_id.clone(),
            ExternalTask {
                consumer_id: consumer_id.to_string(),
                pool_id: pool_id.to_string(),
                task,
            },
        );
    }

    pub async fn remove_task(&self, task_id: &str) {
        self.inner.write().await.tasks.remove(task_id);
    }

    pub async fn set_task_status(&self, task_id: &str, status: TaskStatus) {
        let mut inner = self.inner.write().await;
        if let Some(ext) = inner.tasks.get_mut(task_id) {
            ext.task.status = status;
        }
    }

    /// IPs reported through `fill_device_record_ip` for a task.
    pub async fn filled_ips(&self, task_id: &str) -> Option<Vec<String>> {
        self.inner.read().await.filled.get(task_id).cloned()
    }

    pub async fn set_failing(&self, failing: bool) {
        self.inner.write().await.failing = failing;
    }

    async fn check_available(&self) -> ClientResult<()> {
        if self.inner.read().await.failing {
            return Err(ClientError::Unavailable("memory resource manager".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceManager for MemoryResourceManager {
    async fn get_resource_pool_by_condition(
        &self,
        pool_id: &str,
        _consumer_id: &str,
    ) -> ClientResult<ResourcePool> {
        self.check_available().await?;
        let inner = self.inner.read().await;
        inner
            .pools
            .get(pool_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("pool {pool_id}")))
    }

    async fn get_device_list_by_consumer(&self, consumer_id: &str) -> ClientResult<Vec<Device>> {
        self.check_available().await?;
        let inner = self.inner.read().await;
        Ok(inner
            .devices
            .iter()
            .filter(|d| d.consumer_id == consumer_id)
            .cloned()
            .collect())
    }

    async fn get_device_list_by_pool_id(&self, pool_id: &str) -> ClientResult<Vec<Device>> {
        self.check_available().await?;
        let inner = self.inner.read().await;
        Ok(inner
            .devices
            .iter()
            .filter(|d| d.pool_id == pool_id)
            .cloned()
            .collect())
    }

    async fn list_tasks_by_consumer(&self, consumer_id: &str) -> ClientResult<Vec<ScaleDownTask>> {
        self.check_available().await?;
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.consumer_id == consumer_id)
            .map(|t| t.task.clone())
            .collect())
    }

    async fn list_tasks_by_cond(&self, cond: &TaskCondition) -> ClientResult<Vec<ScaleDownTask>> {
        self.check_available().await?;
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.pool_id == cond.pool_id && t.task.node_group_strategy == cond.strategy)
            .map(|t| t.task.clone())
            .collect())
    }

    async fn get_task_by_id(&self, task_id: &str) -> ClientResult<Option<ScaleDownTask>> {
        self.check_available().await?;
        let inner = self.inner.read().await;
        Ok(inner.tasks.get(task_id).map(|t| t.task.clone()))
    }

    async fn fill_device_record_ip(&self, task_id: &str, ips: &[String]) -> ClientResult<()> {
        self.check_available().await?;
        let mut inner = self.inner.write().await;
        inner.filled.insert(task_id.to_string(), ips.to_vec());
        Ok(())
    }
}
