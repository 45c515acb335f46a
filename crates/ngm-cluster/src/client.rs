//! Ports to the cluster API and the resource broker.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ngm_state::ScaleDownTask;

use crate::error::ClientResult;
use crate::types::*;

/// Node reads and metadata patches against a cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_cluster_nodes(&self, cluster_id: &str) -> ClientResult<Vec<Node>>;

    /// Nodes carrying every label in `selector`, keyed by node name.
    async fn list_nodes_by_label(
        &self,
        cluster_id: &str,
        selector: &BTreeMap<String, String>,
    ) -> ClientResult<BTreeMap<String, Node>>;

    async fn update_node_metadata(
        &self,
        cluster_id: &str,
        node_name: &str,
        labels: &MetadataPatch,
        annotations: &MetadataPatch,
    ) -> ClientResult<()>;

    async fn get_node_detail(&self, ip: &str) -> ClientResult<NodeDetail>;

    async fn update_nodegroup_max(
        &self,
        cluster_id: &str,
        node_group_id: &str,
        max_size: u32,
    ) -> ClientResult<()>;
}

/// Occupancy and drain-task queries against the resource broker.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    async fn get_resource_pool_by_condition(
        &self,
        pool_id: &str,
        consumer_id: &str,
    ) -> ClientResult<ResourcePool>;

    async fn get_device_list_by_consumer(&self, consumer_id: &str) -> ClientResult<Vec<Device>>;

    async fn get_device_list_by_pool_id(&self, pool_id: &str) -> ClientResult<Vec<Device>>;

    async fn list_tasks_by_consumer(&self, consumer_id: &str) -> ClientResult<Vec<ScaleDownTask>>;

    async fn list_tasks_by_cond(&self, cond: &TaskCondition) -> ClientResult<Vec<ScaleDownTask>>;

    async fn get_task_by_id(&self, task_id: &str) -> ClientResult<Option<ScaleDownTask>>;

    /// Report the IPs a finished task consumed.
    async fn fill_device_record_ip(&self, task_id: &str, ips: &[String]) -> ClientResult<()>;
}
