//! The storage contract the control loops are written against.
//!
//! Every operation is a single-record find-then-update; there are no
//! multi-record transactions. Deletes are soft: the record keeps its data
//! and gains a tombstone, and read paths skip tombstoned records unless
//! asked otherwise.

use crate::error::StateResult;
use crate::options::{CreateOptions, DeleteOptions, GetOptions, ListOptions, UpdateOptions};
use crate::types::*;

/// CRUD + list per entity.
pub trait Storage: Send + Sync {
    // ── Strategies ─────────────────────────────────────────────────

    fn list_node_group_strategies(
        &self,
        opt: &ListOptions,
    ) -> StateResult<Vec<NodeGroupMgrStrategy>>;

    fn get_node_group_strategy(
        &self,
        name: &str,
        opt: &GetOptions,
    ) -> StateResult<Option<NodeGroupMgrStrategy>>;

    fn create_node_group_strategy(
        &self,
        strategy: &NodeGroupMgrStrategy,
        opt: &CreateOptions,
    ) -> StateResult<()>;

    fn update_node_group_strategy(
        &self,
        strategy: &NodeGroupMgrStrategy,
        opt: &UpdateOptions,
    ) -> StateResult<NodeGroupMgrStrategy>;

    fn delete_node_group_strategy(
        &self,
        name: &str,
        opt: &DeleteOptions,
    ) -> StateResult<Option<NodeGroupMgrStrategy>>;

    // ── Node groups ────────────────────────────────────────────────

    fn list_node_groups(&self, opt: &ListOptions) -> StateResult<Vec<NodeGroup>>;

    fn get_node_group(&self, node_group_id: &str, opt: &GetOptions)
    -> StateResult<Option<NodeGroup>>;

    fn create_node_group(&self, group: &NodeGroup, opt: &CreateOptions) -> StateResult<()>;

    fn update_node_group(&self, group: &NodeGroup, opt: &UpdateOptions)
    -> StateResult<NodeGroup>;

    fn delete_node_group(
        &self,
        node_group_id: &str,
        opt: &DeleteOptions,
    ) -> StateResult<Option<NodeGroup>>;

    // ── Actions ────────────────────────────────────────────────────

    fn list_node_group_actions(&self, opt: &ListOptions) -> StateResult<Vec<NodeGroupAction>>;

    fn list_node_group_actions_by_node_group(
        &self,
        node_group_id: &str,
        opt: &ListOptions,
    ) -> StateResult<Vec<NodeGroupAction>>;

    fn get_node_group_action(
        &self,
        node_group_id: &str,
        event: NodeGroupEventType,
        opt: &GetOptions,
    ) -> StateResult<Option<NodeGroupAction>>;

    fn create_node_group_action(
        &self,
        action: &NodeGroupAction,
        opt: &CreateOptions,
    ) -> StateResult<()>;

    fn update_node_group_action(
        &self,
        action: &NodeGroupAction,
        opt: &UpdateOptions,
    ) -> StateResult<NodeGroupAction>;

    fn delete_node_group_action(
        &self,
        node_group_id: &str,
        event: NodeGroupEventType,
        opt: &DeleteOptions,
    ) -> StateResult<Option<NodeGroupAction>>;

    // ── Events ─────────────────────────────────────────────────────

    fn create_node_group_event(
        &self,
        event: &NodeGroupEvent,
        opt: &CreateOptions,
    ) -> StateResult<()>;

    fn list_node_group_events(
        &self,
        node_group_id: &str,
        opt: &ListOptions,
    ) -> StateResult<Vec<NodeGroupEvent>>;

    // ── Scale-down tasks ───────────────────────────────────────────

    fn list_tasks(&self, opt: &ListOptions) -> StateResult<Vec<ScaleDownTask>>;

    fn list_tasks_by_strategy(
        &self,
        strategy: &str,
        opt: &ListOptions,
    ) -> StateResult<Vec<ScaleDownTask>>;

    fn get_task(&self, task_id: &str, opt: &GetOptions) -> StateResult<Option<ScaleDownTask>>;

    fn create_task(&self, task: &ScaleDownTask, opt: &CreateOptions) -> StateResult<()>;

    fn update_task(&self, task: &ScaleDownTask, opt: &UpdateOptions)
    -> StateResult<ScaleDownTask>;

    fn delete_task(&self, task_id: &str, opt: &DeleteOptions)
    -> StateResult<Option<ScaleDownTask>>;
}
