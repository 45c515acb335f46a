//! Domain records for the node group manager.
//!
//! These types represent the persisted strategies, node groups, in-flight
//! actions, audit events and scale-down tasks. All types are serializable
//! to/from JSON for storage in redb tables. Every record carries a
//! `deleted_time` tombstone instead of being physically removed.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Node group identifier as known by the cluster manager.
pub type NodeGroupId = String;

/// Scale-down task identifier as issued by the resource broker.
pub type TaskId = String;

/// Shared shape of every stored record.
pub trait Record {
    /// Primary key inside the record's table.
    fn table_key(&self) -> String;

    /// Tombstone timestamp, set when the record was soft-deleted.
    fn deleted_time(&self) -> Option<DateTime<Utc>>;

    fn set_deleted_time(&mut self, at: Option<DateTime<Utc>>);

    fn is_deleted(&self) -> bool {
        self.deleted_time().is_some()
    }
}

// ── Strategy ───────────────────────────────────────────────────────

/// Balancing policy between a reserved pool and its elastic node groups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeGroupMgrStrategy {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Resource pool id in the broker.
    pub resource_pool: String,
    pub reserved_node_group: ReservedNodeGroup,
    /// Elastic groups, in configuration order.
    pub elastic_node_groups: Vec<ElasticNodeGroup>,
    pub strategy: Strategy,
    #[serde(default)]
    pub status: Option<StrategyState>,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    #[serde(default)]
    pub deleted_time: Option<DateTime<Utc>>,
}

/// The fixed-capacity consumer of the resource pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReservedNodeGroup {
    pub cluster_id: String,
    pub node_group_id: NodeGroupId,
    /// Consumer id the broker uses for this group's devices.
    pub consumer_id: String,
}

/// An autoscaler-managed node group whose desired size is adjusted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ElasticNodeGroup {
    pub cluster_id: String,
    pub node_group_id: NodeGroupId,
    #[serde(default)]
    pub consumer_id: String,
    /// Relative share of scale deltas.
    pub weight: u32,
    /// Upper bound for the desired size this system may set.
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StrategyType {
    #[default]
    #[serde(rename = "buffer")]
    Buffer,
    #[serde(rename = "hierarchicalBuffer")]
    HierarchicalBuffer,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buffer => "buffer",
            Self::HierarchicalBuffer => "hierarchicalBuffer",
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy parameters. Delays are in minutes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Strategy {
    #[serde(rename = "type")]
    pub kind: StrategyType,
    #[serde(default)]
    pub scale_up_cool_down: u32,
    #[serde(default)]
    pub scale_up_delay: u32,
    #[serde(default)]
    pub min_scale_up_size: u32,
    #[serde(default)]
    pub scale_down_delay: u32,
    #[serde(default)]
    pub max_idle_delay: u32,
    #[serde(default)]
    pub buffer: BufferStrategy,
    #[serde(default)]
    pub time_mode: Option<TimeMode>,
    /// Labels applied to nodes that joined through an elastic scale-up.
    #[serde(default)]
    pub node_labels: BTreeMap<String, String>,
}

/// Idle-capacity thresholds, as percentages of the pool size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BufferStrategy {
    pub low: u32,
    pub high: u32,
}

/// Time-window schedule replacing occupancy-driven scale-down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TimeMode {
    pub time_periods: Vec<TimePeriod>,
}

/// One scale-out/scale-in pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimePeriod {
    /// Recurring window opened by `scale_out_cron` and closed by `scale_in_cron`.
    Cron {
        scale_out_cron: String,
        scale_in_cron: String,
    },
    /// One-off window.
    Fixed {
        scale_out_time: DateTime<Utc>,
        scale_in_time: DateTime<Utc>,
    },
}

/// Last observed outcome of reconciling a strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyState {
    pub status: StrategyStatus,
    pub last_status: StrategyStatus,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: String,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StrategyStatus {
    #[default]
    Stable,
    Scaleup,
    Scaledown,
    ErrState,
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stable => "Stable",
            Self::Scaleup => "Scaleup",
            Self::Scaledown => "Scaledown",
            Self::ErrState => "ErrState",
        };
        f.write_str(s)
    }
}

impl NodeGroupMgrStrategy {
    pub fn current_status(&self) -> StrategyStatus {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    /// Move to `status`, remembering the previous one. Clears any error.
    pub fn transition(&mut self, status: StrategyStatus, message: &str, now: DateTime<Utc>) {
        let previous = self.current_status();
        let created_time = self.status.as_ref().map(|s| s.created_time).unwrap_or(now);
        self.status = Some(StrategyState {
            status,
            last_status: previous,
            error: String::new(),
            message: message.to_string(),
            created_time,
            updated_time: now,
        });
        self.updated_time = now;
    }

    pub fn elastic_group(&self, node_group_id: &str) -> Option<&ElasticNodeGroup> {
        self.elastic_node_groups
            .iter()
            .find(|g| g.node_group_id == node_group_id)
    }
}

// ── Node group ─────────────────────────────────────────────────────

/// Observed and desired autoscaler state of one node group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeGroup {
    pub node_group_id: NodeGroupId,
    pub cluster_id: String,
    pub max_size: u32,
    pub min_size: u32,
    /// Size computed by this system; authoritative for the webhook.
    pub desired_size: u32,
    /// Size last confirmed by the cluster manager.
    pub cm_desired_size: u32,
    #[serde(default)]
    pub node_ips: Vec<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub last_status: String,
    /// Whether the autoscaler has consumed the latest decision.
    #[serde(default)]
    pub hook_confirm: bool,
    pub updated_time: DateTime<Utc>,
    #[serde(default)]
    pub deleted_time: Option<DateTime<Utc>>,
}

impl NodeGroup {
    pub fn current_size(&self) -> u32 {
        self.node_ips.len() as u32
    }
}

// ── Action ─────────────────────────────────────────────────────────

/// Kind of scale intent an action tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeGroupEventType {
    Scaleup,
    Scaledown,
    ScaleDownByTask,
    UpdateNodeMeta,
}

impl NodeGroupEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scaleup => "Scaleup",
            Self::Scaledown => "Scaledown",
            Self::ScaleDownByTask => "ScaleDownByTaskState",
            Self::UpdateNodeMeta => "UpdateNodeMeta",
        }
    }
}

impl fmt::Display for NodeGroupEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One in-flight scale intent per (node group, event).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeGroupAction {
    pub node_group_id: NodeGroupId,
    pub cluster_id: String,
    pub strategy: String,
    pub event: NodeGroupEventType,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub delta_num: i32,
    pub original_desired_num: u32,
    pub new_desired_num: u32,
    pub original_node_num: u32,
    /// Original IPs for capacity actions; exact targets for task actions.
    #[serde(default)]
    pub node_ips: Vec<String>,
    /// Progress percentage, 0–100.
    pub process: u32,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    #[serde(default)]
    pub deleted_time: Option<DateTime<Utc>>,
}

impl NodeGroupAction {
    /// Fresh action with zero progress.
    pub fn new(
        group: &NodeGroup,
        strategy: &str,
        event: NodeGroupEventType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            node_group_id: group.node_group_id.clone(),
            cluster_id: group.cluster_id.clone(),
            strategy: strategy.to_string(),
            event,
            task_id: None,
            delta_num: 0,
            original_desired_num: group.desired_size,
            new_desired_num: group.desired_size,
            original_node_num: group.current_size(),
            node_ips: group.node_ips.clone(),
            process: 0,
            created_time: now,
            updated_time: now,
            deleted_time: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.process == 100
    }

    /// Whether `delay` minutes have elapsed since the last update.
    pub fn is_timeout(&self, delay: u32, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.updated_time) >= Duration::seconds(i64::from(delay) * 60)
    }
}

/// Progress of a group moving from its current size towards `desired`.
///
/// Overshooting is penalised symmetrically: 110 nodes for a target of 100
/// reports 90.
pub fn calculate_process(current: u32, desired: u32) -> u32 {
    if desired == 0 {
        return if current == 0 { 100 } else { 0 };
    }
    let (current, desired) = (u64::from(current), u64::from(desired));
    if current < desired {
        (current * 100 / desired) as u32
    } else {
        100u64.saturating_sub((current - desired) * 100 / desired) as u32
    }
}

// ── Event ──────────────────────────────────────────────────────────

/// Append-only audit entry for a scale decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeGroupEvent {
    pub node_group_id: NodeGroupId,
    pub cluster_id: String,
    pub event: NodeGroupEventType,
    pub event_time: DateTime<Utc>,
    pub max_num: u32,
    pub min_num: u32,
    pub desired_num: u32,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// Tie breaker for events of one group sharing a timestamp. The
    /// store assigns it on create.
    #[serde(default)]
    pub seq: u32,
    #[serde(default)]
    pub deleted_time: Option<DateTime<Utc>>,
}

// ── Scale-down task ────────────────────────────────────────────────

/// External lifecycle status of a scale-down task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TaskStatus {
    #[default]
    Requesting,
    Finished,
    Terminated,
}

/// Nodes chosen from one node group for a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ScaleDownDetail {
    pub cluster_id: String,
    pub node_group_id: NodeGroupId,
    #[serde(default)]
    pub consumer_id: String,
    pub node_num: u32,
    pub node_ips: Vec<String>,
}

/// A request to drain `total_num` nodes by `deadline`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScaleDownTask {
    pub task_id: TaskId,
    pub total_num: u32,
    pub node_group_strategy: String,
    #[serde(default)]
    pub scale_down_groups: Vec<ScaleDownDetail>,
    /// Target drain tier, `"<hours>h"`.
    pub drain_delay: String,
    pub deadline: DateTime<Utc>,
    pub begin_execute_time: DateTime<Utc>,
    /// Nodes are named by `device_list` instead of being selected.
    #[serde(default)]
    pub specify_scale_down: bool,
    #[serde(default)]
    pub device_list: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub is_executed: bool,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    #[serde(default)]
    pub deleted_time: Option<DateTime<Utc>>,
}

impl ScaleDownTask {
    /// Number of IPs currently recorded across all groups.
    pub fn selected_num(&self) -> u32 {
        self.scale_down_groups
            .iter()
            .map(|g| g.node_ips.len() as u32)
            .sum()
    }

    pub fn selected_ips(&self) -> Vec<String> {
        self.scale_down_groups
            .iter()
            .flat_map(|g| g.node_ips.iter().cloned())
            .collect()
    }
}

/// Parse a drain delay of the form `"72h"` into hours.
pub fn parse_drain_delay(delay: &str) -> Option<u32> {
    delay.trim().strip_suffix('h')?.trim().parse().ok()
}

// ── Record impls ───────────────────────────────────────────────────

impl Record for NodeGroupMgrStrategy {
    fn table_key(&self) -> String {
        self.name.clone()
    }
    fn deleted_time(&self) -> Option<DateTime<Utc>> {
        self.deleted_time
    }
    fn set_deleted_time(&mut self, at: Option<DateTime<Utc>>) {
        self.deleted_time = at;
    }
}

impl Record for NodeGroup {
    fn table_key(&self) -> String {
        self.node_group_id.clone()
    }
    fn deleted_time(&self) -> Option<DateTime<Utc>> {
        self.deleted_time
    }
    fn set_deleted_time(&mut self, at: Option<DateTime<Utc>>) {
        self.deleted_time = at;
    }
}

impl Record for NodeGroupAction {
    fn table_key(&self) -> String {
        action_key(&self.node_group_id, self.event)
    }
    fn deleted_time(&self) -> Option<DateTime<Utc>> {
        self.deleted_time
    }
    fn set_deleted_time(&mut self, at: Option<DateTime<Utc>>) {
        self.deleted_time = at;
    }
}

impl Record for NodeGroupEvent {
    fn table_key(&self) -> String {
        format!(
            "{}:{:020}:{:04}:{}",
            self.node_group_id,
            self.event_time.timestamp_nanos_opt().unwrap_or_default(),
            self.seq,
            self.event
        )
    }
    fn deleted_time(&self) -> Option<DateTime<Utc>> {
        self.deleted_time
    }
    fn set_deleted_time(&mut self, at: Option<DateTime<Utc>>) {
        self.deleted_time = at;
    }
}

impl Record for ScaleDownTask {
    fn table_key(&self) -> String {
        self.task_id.clone()
    }
    fn deleted_time(&self) -> Option<DateTime<Utc>> {
        self.deleted_time
    }
    fn set_deleted_time(&mut self, at: Option<DateTime<Utc>>) {
        self.deleted_time = at;
    }
}

/// Composite key for the actions table.
pub fn action_key(node_group_id: &str, event: NodeGroupEventType) -> String {
    format!("{node_group_id}:{}", event.as_str())
}
