//! Shared fixtures for executor tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use ngm_cluster::{MemoryCluster, MemoryResourceManager, ResourcePool};
use ngm_state::*;

use crate::executor::ExecutorContext;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub struct Harness {
    pub broker: Arc<MemoryResourceManager>,
    pub cluster: Arc<MemoryCluster>,
    pub ctx: ExecutorContext,
}

impl Harness {
    pub async fn new() -> Self {
        let storage = Arc::new(StateStore::open_in_memory().unwrap());
        let broker = Arc::new(MemoryResourceManager::new());
        let cluster = Arc::new(MemoryCluster::default());
        let ctx = ExecutorContext::new(storage, broker.clone(), cluster.clone());
        Self {
            broker,
            cluster,
            ctx,
        }
    }

    pub async fn put_pool(&self, idle: u32, consumed: u32, updated: DateTime<Utc>) {
        self.broker
            .put_pool(ResourcePool {
                pool_id: "pool-1".into(),
                init_num: 0,
                idle_num: idle,
                consumed_num: consumed,
                returned_num: 0,
                updated_time: updated,
            })
            .await;
    }

    pub async fn put_group(&self, id: &str, desired: u32, min: u32) -> NodeGroup {
        let group = NodeGroup {
            node_group_id: id.into(),
            cluster_id: "c-1".into(),
            max_size: 10,
            min_size: min,
            desired_size: desired,
            cm_desired_size: desired,
            updated_time: at(0),
            ..Default::default()
        };
        self.ctx
            .storage
            .create_node_group(&group, &CreateOptions::default())
            .unwrap();
        group
    }
}

pub fn strategy(name: &str, kind: StrategyType) -> NodeGroupMgrStrategy {
    NodeGroupMgrStrategy {
        name: name.into(),
        resource_pool: "pool-1".into(),
        reserved_node_group: ReservedNodeGroup {
            cluster_id: "c-0".into(),
            node_group_id: "ng-reserved".into(),
            consumer_id: "consumer-1".into(),
        },
        elastic_node_groups: ["ng-a", "ng-b"]
            .iter()
            .map(|id| ElasticNodeGroup {
                cluster_id: "c-1".into(),
                node_group_id: id.to_string(),
                weight: 1,
                ..Default::default()
            })
            .collect(),
        strategy: Strategy {
            kind,
            ..Default::default()
        },
        created_time: at(0),
        updated_time: at(0),
        ..Default::default()
    }
}

pub fn task(id: &str, strategy: &str, begin: DateTime<Utc>) -> ScaleDownTask {
    ScaleDownTask {
        task_id: id.into(),
        total_num: 1,
        node_group_strategy: strategy.into(),
        scale_down_groups: vec![],
        drain_delay: "8h".into(),
        deadline: begin + chrono::Duration::hours(8),
        begin_execute_time: begin,
        specify_scale_down: false,
        device_list: vec![],
        status: TaskStatus::Requesting,
        is_executed: false,
        created_time: at(0),
        updated_time: at(0),
        deleted_time: None,
    }
}
