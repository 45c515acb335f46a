//! redb table definitions for the node group manager store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Strategies keyed by `{name}`.
pub const STRATEGIES: TableDefinition<&str, &[u8]> = TableDefinition::new("strategies");

/// Node groups keyed by `{node_group_id}`.
pub const NODE_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("node_groups");

/// Actions keyed by `{node_group_id}:{event}`.
pub const ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("actions");

/// Audit events keyed by `{node_group_id}:{event_time_nanos}`.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Scale-down tasks keyed by `{task_id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");
