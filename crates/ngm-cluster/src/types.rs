//! Snapshots returned by the cluster API and the resource broker.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cluster node as seen through the cluster API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Node {
    pub name: String,
    /// Primary internal IP.
    pub ip: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Whether the node reports the Ready condition.
    #[serde(default)]
    pub ready: bool,
}

impl Node {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Lookup result of a node by IP.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDetail {
    pub name: String,
    pub ip: String,
    pub cluster_id: String,
    /// Owning node group, if the node carries the node-group label.
    pub node_group_id: Option<String>,
    pub ready: bool,
}

/// Label and annotation changes. `None` removes the key.
pub type MetadataPatch = BTreeMap<String, Option<String>>;

/// Occupancy snapshot of a device pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePool {
    pub pool_id: String,
    #[serde(default)]
    pub init_num: u32,
    #[serde(default)]
    pub idle_num: u32,
    #[serde(default)]
    pub consumed_num: u32,
    #[serde(default)]
    pub returned_num: u32,
    /// Last time the occupancy counts changed.
    pub updated_time: DateTime<Utc>,
}

impl ResourcePool {
    /// Devices not consumed by any elastic group.
    pub fn idle(&self) -> u32 {
        self.init_num
            .saturating_add(self.idle_num)
            .saturating_add(self.returned_num)
    }

    pub fn total(&self) -> u32 {
        self.idle().saturating_add(self.consumed_num)
    }
}

/// A physical device tracked by the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Device {
    pub device_id: String,
    pub ip: String,
    pub pool_id: String,
    #[serde(default)]
    pub consumer_id: String,
    #[serde(default)]
    pub status: String,
}

/// Self-sourced task query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCondition {
    pub pool_id: String,
    pub strategy: String,
}
