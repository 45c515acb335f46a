//! StateStore — redb-backed implementation of [`Storage`].
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. Each
//! mutation runs inside one write transaction, so a find-then-update on a
//! single record is atomic. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::options::{CreateOptions, DeleteOptions, GetOptions, ListOptions, UpdateOptions};
use crate::storage::Storage;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [STRATEGIES, NODE_GROUPS, ACTIONS, EVENTS, TASKS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic record access ──────────────────────────────────────

    fn read_one<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value()).map_err(map_err!(Decode))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Scan a table, optionally restricted to keys starting with `prefix`.
    fn read_all<T: DeserializeOwned>(&self, table: Table, prefix: Option<&str>) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if prefix.is_some_and(|p| !key.value().starts_with(p)) {
                continue;
            }
            let record = serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Read-modify-write one record inside a single write transaction.
    ///
    /// `f` receives the stored record (tombstoned or not) and returns the
    /// record to write back, if any, plus the caller's result. An error
    /// from `f` aborts the transaction.
    fn mutate<T, R>(
        &self,
        table: Table,
        key: &str,
        f: impl FnOnce(Option<T>) -> StateResult<(Option<T>, R)>,
    ) -> StateResult<R>
    where
        T: Serialize + DeserializeOwned,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Decode))?)
                }
                None => None,
            };
            let (next, r) = f(current)?;
            if let Some(next) = next {
                let value = serde_json::to_vec(&next).map_err(map_err!(Encode))?;
                table
                    .insert(key, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            result = r;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    fn get_record<T>(&self, table: Table, key: &str, opt: &GetOptions) -> StateResult<Option<T>>
    where
        T: Record + DeserializeOwned,
    {
        let record = self
            .read_one::<T>(table, key)?
            .filter(|r| opt.get_soft_deleted || !r.is_deleted());
        if record.is_none() && opt.err_if_not_exist {
            return Err(StateError::NotFound {
                table: table.name().to_string(),
                key: key.to_string(),
            });
        }
        Ok(record)
    }

    fn list_records<T>(&self, table: Table, prefix: Option<&str>, opt: &ListOptions) -> StateResult<Vec<T>>
    where
        T: Record + DeserializeOwned,
    {
        let records = self
            .read_all::<T>(table, prefix)?
            .into_iter()
            .filter(|r| opt.return_soft_deleted_items || !r.is_deleted())
            .collect();
        Ok(opt.window(records))
    }

    fn create_record<T>(&self, table: Table, record: &T, opt: &CreateOptions) -> StateResult<()>
    where
        T: Record + Serialize + DeserializeOwned + Clone,
    {
        let key = record.table_key();
        self.mutate::<T, ()>(table, &key, |current| {
            match current {
                Some(existing) if !existing.is_deleted() && !opt.over_write_if_exist => {
                    Err(StateError::AlreadyExists {
                        table: table.name().to_string(),
                        key: key.clone(),
                    })
                }
                _ => Ok((Some(record.clone()), ())),
            }
        })?;
        debug!(%key, "record created");
        Ok(())
    }

    fn update_record<T>(&self, table: Table, record: &T, opt: &UpdateOptions) -> StateResult<T>
    where
        T: Record + Serialize + DeserializeOwned + Clone,
    {
        let key = record.table_key();
        self.mutate::<T, T>(table, &key, |current| {
            let existing = match current {
                Some(existing) if !existing.is_deleted() => existing,
                _ if opt.create_if_not_exist => return Ok((Some(record.clone()), record.clone())),
                _ => {
                    return Err(StateError::NotFound {
                        table: table.name().to_string(),
                        key: key.clone(),
                    });
                }
            };
            let next = if opt.overwrite_zero_or_empty_str {
                record.clone()
            } else {
                let mut base = serde_json::to_value(&existing).map_err(map_err!(Encode))?;
                let patch = serde_json::to_value(record).map_err(map_err!(Encode))?;
                merge_patch(&mut base, patch, false);
                serde_json::from_value(base).map_err(map_err!(Decode))?
            };
            Ok((Some(next.clone()), next))
        })
    }

    fn delete_record<T>(&self, table: Table, key: &str, opt: &DeleteOptions) -> StateResult<Option<T>>
    where
        T: Record + Serialize + DeserializeOwned + Clone,
    {
        let deleted = self.mutate::<T, Option<T>>(table, key, |current| match current {
            Some(mut existing) if !existing.is_deleted() => {
                existing.set_deleted_time(Some(Utc::now()));
                Ok((Some(existing.clone()), Some(existing)))
            }
            _ if opt.err_if_not_exist => Err(StateError::NotFound {
                table: table.name().to_string(),
                key: key.to_string(),
            }),
            _ => Ok((None, None)),
        })?;
        debug!(%key, existed = deleted.is_some(), "record soft-deleted");
        Ok(deleted)
    }
}

/// Merge `patch` into `base`.
///
/// Objects merge key by key and recursively; any other value replaces the
/// base value. Unless `overwrite_zero` is set, null, `false`, `0`, `""`,
/// `[]` and `{}` in the patch are skipped.
pub fn merge_patch(base: &mut Value, patch: Value, overwrite_zero: bool) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if !overwrite_zero && is_zero(&value) {
                    continue;
                }
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_patch(existing, value, overwrite_zero)
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

impl Storage for StateStore {
    // ── Strategies ─────────────────────────────────────────────────

    fn list_node_group_strategies(&self, opt: &ListOptions) -> StateResult<Vec<NodeGroupMgrStrategy>> {
        self.list_records(STRATEGIES, None, opt)
    }

    fn get_node_group_strategy(
        &self,
        name: &str,
        opt: &GetOptions,
    ) -> StateResult<Option<NodeGroupMgrStrategy>> {
        self.get_record(STRATEGIES, name, opt)
    }

    fn create_node_group_strategy(
        &self,
        strategy: &NodeGroupMgrStrategy,
        opt: &CreateOptions,
    ) -> StateResult<()> {
        self.create_record(STRATEGIES, strategy, opt)
    }

    fn update_node_group_strategy(
        &self,
        strategy: &NodeGroupMgrStrategy,
        opt: &UpdateOptions,
    ) -> StateResult<NodeGroupMgrStrategy> {
        self.update_record(STRATEGIES, strategy, opt)
    }

    fn delete_node_group_strategy(
        &self,
        name: &str,
        opt: &DeleteOptions,
    ) -> StateResult<Option<NodeGroupMgrStrategy>> {
        self.delete_record(STRATEGIES, name, opt)
    }

    // ── Node groups ────────────────────────────────────────────────

    fn list_node_groups(&self, opt: &ListOptions) -> StateResult<Vec<NodeGroup>> {
        self.list_records(NODE_GROUPS, None, opt)
    }

    fn get_node_group(&self, node_group_id: &str, opt: &GetOptions) -> StateResult<Option<NodeGroup>> {
        self.get_record(NODE_GROUPS, node_group_id, opt)
    }

    fn create_node_group(&self, group: &NodeGroup, opt: &CreateOptions) -> StateResult<()> {
        self.create_record(NODE_GROUPS, group, opt)
    }

    fn update_node_group(&self, group: &NodeGroup, opt: &UpdateOptions) -> StateResult<NodeGroup> {
        self.update_record(NODE_GROUPS, group, opt)
    }

    fn delete_node_group(
        &self,
        node_group_id: &str,
        opt: &DeleteOptions,
    ) -> StateResult<Option<NodeGroup>> {
        self.delete_record(NODE_GROUPS, node_group_id, opt)
    }

    // ── Actions ────────────────────────────────────────────────────

    fn list_node_group_actions(&self, opt: &ListOptions) -> StateResult<Vec<NodeGroupAction>> {
        self.list_records(ACTIONS, None, opt)
    }

    fn list_node_group_actions_by_node_group(
        &self,
        node_group_id: &str,
        opt: &ListOptions,
    ) -> StateResult<Vec<NodeGroupAction>> {
        let prefix = format!("{node_group_id}:");
        self.list_records(ACTIONS, Some(&prefix), opt)
    }

    fn get_node_group_action(
        &self,
        node_group_id: &str,
        event: NodeGroupEventType,
        opt: &GetOptions,
    ) -> StateResult<Option<NodeGroupAction>> {
        self.get_record(ACTIONS, &action_key(node_group_id, event), opt)
    }

    fn create_node_group_action(&self, action: &NodeGroupAction, opt: &CreateOptions) -> StateResult<()> {
        self.create_record(ACTIONS, action, opt)
    }

    fn update_node_group_action(
        &self,
        action: &NodeGroupAction,
        opt: &UpdateOptions,
    ) -> StateResult<NodeGroupAction> {
        self.update_record(ACTIONS, action, opt)
    }

    fn delete_node_group_action(
        &self,
        node_group_id: &str,
        event: NodeGroupEventType,
        opt: &DeleteOptions,
    ) -> StateResult<Option<NodeGroupAction>> {
        self.delete_record(ACTIONS, &action_key(node_group_id, event), opt)
    }

    // ── Events ─────────────────────────────────────────────────────

    fn create_node_group_event(&self, event: &NodeGroupEvent, opt: &CreateOptions) -> StateResult<()> {
        let mut event = event.clone();
        loop {
            match self.create_record(EVENTS, &event, opt) {
                Err(StateError::AlreadyExists { .. }) if event.seq < u32::MAX => event.seq += 1,
                other => return other,
            }
        }
    }

    fn list_node_group_events(
        &self,
        node_group_id: &str,
        opt: &ListOptions,
    ) -> StateResult<Vec<NodeGroupEvent>> {
        let prefix = format!("{node_group_id}:");
        self.list_records(EVENTS, Some(&prefix), opt)
    }

    // ── Scale-down tasks ───────────────────────────────────────────

    fn list_tasks(&self, opt: &ListOptions) -> StateResult<Vec<ScaleDownTask>> {
        self.list_records(TASKS, None, opt)
    }

    fn list_tasks_by_strategy(&self, strategy: &str, opt: &ListOptions) -> StateResult<Vec<ScaleDownTask>> {
        let all = ListOptions {
            limit: 0,
            ..*opt
        };
        let tasks = self
            .list_records::<ScaleDownTask>(TASKS, None, &all)?
            .into_iter()
            .filter(|t| t.node_group_strategy == strategy)
            .collect();
        Ok(opt.window(tasks))
    }

    fn get_task(&self, task_id: &str, opt: &GetOptions) -> StateResult<Option<ScaleDownTask>> {
        self.get_record(TASKS, task_id, opt)
    }

    fn create_task(&self, task: &ScaleDownTask, opt: &CreateOptions) -> StateResult<()> {
        self.create_record(TASKS, task, opt)
    }

    fn update_task(&self, task: &ScaleDownTask, opt: &UpdateOptions) -> StateResult<ScaleDownTask> {
        self.update_record(TASKS, task, opt)
    }

    fn delete_task(&self, task_id: &str, opt: &DeleteOptions) -> StateResult<Option<ScaleDownTask>> {
        self.delete_record(TASKS, task_id, opt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn test_group(id: &str, desired: u32) -> NodeGroup {
        NodeGroup {
            node_group_id: id.to_string(),
            cluster_id: "BCS-K8S-00001".to_string(),
            max_size: 10,
            min_size: 1,
            desired_size: desired,
            cm_desired_size: desired,
            node_ips: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            status: "RUNNING".to_string(),
            last_status: String::new(),
            hook_confirm: true,
            updated_time: at(1000),
            deleted_time: None,
        }
    }

    fn test_task(id: &str, strategy: &str) -> ScaleDownTask {
        ScaleDownTask {
            task_id: id.to_string(),
            total_num: 2,
            node_group_strategy: strategy.to_string(),
            scale_down_groups: vec![],
            drain_delay: "72h".to_string(),
            deadline: at(5000),
            begin_execute_time: at(4000),
            specify_scale_down: false,
            device_list: vec![],
            status: TaskStatus::Requesting,
            is_executed: false,
            created_time: at(1000),
            updated_time: at(1000),
            deleted_time: None,
        }
    }

    // ── Node group CRUD ────────────────────────────────────────────

    #[test]
    fn node_group_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let group = test_group("ng-1", 2);

        store.create_node_group(&group, &CreateOptions::default()).unwrap();
        let retrieved = store.get_node_group("ng-1", &GetOptions::default()).unwrap();

        assert_eq!(retrieved, Some(group));
    }

    #[test]
    fn create_existing_fails_without_overwrite() {
        let store = StateStore::open_in_memory().unwrap();
        let group = test_group("ng-1", 2);
        store.create_node_group(&group, &CreateOptions::default()).unwrap();

        let err = store
            .create_node_group(&group, &CreateOptions::default())
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists { .. }));

        store
            .create_node_group(
                &test_group("ng-1", 5),
                &CreateOptions {
                    over_write_if_exist: true,
                },
            )
            .unwrap();
        let got = store.get_node_group("ng-1", &GetOptions::default()).unwrap().unwrap();
        assert_eq!(got.desired_size, 5);
    }

    #[test]
    fn get_missing_respects_err_flag() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_node_group("nope", &GetOptions::default()).unwrap().is_none());

        let err = store
            .get_node_group(
                "nope",
                &GetOptions {
                    err_if_not_exist: true,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound { .. }));
    }

    // ── Merge-patch updates ────────────────────────────────────────

    #[test]
    fn update_ignores_zero_fields_by_default() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_node_group(&test_group("ng-1", 4), &CreateOptions::default())
            .unwrap();

        let mut patch = test_group("ng-1", 0);
        patch.node_ips.clear();
        patch.status = String::new();
        patch.hook_confirm = false;
        patch.max_size = 20;

        let merged = store.update_node_group(&patch, &UpdateOptions::default()).unwrap();
        assert_eq!(merged.desired_size, 4);
        assert_eq!(merged.node_ips.len(), 2);
        assert_eq!(merged.status, "RUNNING");
        assert!(merged.hook_confirm);
        assert_eq!(merged.max_size, 20);
    }

    #[test]
    fn update_with_overwrite_writes_zero_fields() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_node_group(&test_group("ng-1", 4), &CreateOptions::default())
            .unwrap();

        let mut next = test_group("ng-1", 0);
        next.hook_confirm = false;
        let stored = store.update_node_group(&next, &UpdateOptions::overwrite()).unwrap();

        assert_eq!(stored.desired_size, 0);
        assert!(!stored.hook_confirm);
    }

    #[test]
    fn update_missing_requires_create_flag() {
        let store = StateStore::open_in_memory().unwrap();
        let group = test_group("ng-1", 1);

        let err = store
            .update_node_group(&group, &UpdateOptions::default())
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound { .. }));

        store.update_node_group(&group, &UpdateOptions::upsert()).unwrap();
        assert!(store.get_node_group("ng-1", &GetOptions::default()).unwrap().is_some());
    }

    #[test]
    fn merge_patch_recurses_into_objects() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": "keep"});
        merge_patch(&mut base, json!({"a": {"y": 0, "z": 3}, "b": ""}), false);
        assert_eq!(base, json!({"a": {"x": 1, "y": 2, "z": 3}, "b": "keep"}));

        merge_patch(&mut base, json!({"a": {"y": 0}}), true);
        assert_eq!(base["a"]["y"], json!(0));
    }

    // ── Soft delete ────────────────────────────────────────────────

    #[test]
    fn delete_is_soft_and_hidden_from_reads() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_node_group(&test_group("ng-1", 2), &CreateOptions::default())
            .unwrap();

        let deleted = store
            .delete_node_group("ng-1", &DeleteOptions::default())
            .unwrap()
            .unwrap();
        assert!(deleted.is_deleted());

        assert!(store.get_node_group("ng-1", &GetOptions::default()).unwrap().is_none());
        let tomb = store
            .get_node_group(
                "ng-1",
                &GetOptions {
                    get_soft_deleted: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(tomb.is_some_and(|g| g.is_deleted()));

        assert!(store.list_node_groups(&ListOptions::default()).unwrap().is_empty());
        let with_deleted = store
            .list_node_groups(&ListOptions {
                return_soft_deleted_items: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(with_deleted.len(), 1);
    }

    #[test]
    fn delete_twice_is_a_no_op_unless_strict() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_node_group(&test_group("ng-1", 2), &CreateOptions::default())
            .unwrap();
        store.delete_node_group("ng-1", &DeleteOptions::default()).unwrap();

        assert!(store
            .delete_node_group("ng-1", &DeleteOptions::default())
            .unwrap()
            .is_none());
        let err = store
            .delete_node_group(
                "ng-1",
                &DeleteOptions {
                    err_if_not_exist: true,
                },
            )
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound { .. }));
    }

    #[test]
    fn create_replaces_tombstoned_record() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_node_group(&test_group("ng-1", 2), &CreateOptions::default())
            .unwrap();
        store.delete_node_group("ng-1", &DeleteOptions::default()).unwrap();

        store
            .create_node_group(&test_group("ng-1", 3), &CreateOptions::default())
            .unwrap();
        let got = store.get_node_group("ng-1", &GetOptions::default()).unwrap().unwrap();
        assert_eq!(got.desired_size, 3);
        assert!(!got.is_deleted());
    }

    // ── Actions and events ─────────────────────────────────────────

    #[test]
    fn actions_are_keyed_by_group_and_event() {
        let store = StateStore::open_in_memory().unwrap();
        let group = test_group("ng-1", 2);
        let up = NodeGroupAction::new(&group, "s", NodeGroupEventType::Scaleup, at(10));
        let down = NodeGroupAction::new(&group, "s", NodeGroupEventType::Scaledown, at(10));
        let other = NodeGroupAction::new(&test_group("ng-10", 1), "s", NodeGroupEventType::Scaleup, at(10));

        for a in [&up, &down, &other] {
            store.create_node_group_action(a, &CreateOptions::default()).unwrap();
        }

        let for_group = store
            .list_node_group_actions_by_node_group("ng-1", &ListOptions::default())
            .unwrap();
        assert_eq!(for_group.len(), 2);

        let got = store
            .get_node_group_action("ng-1", NodeGroupEventType::Scaledown, &GetOptions::default())
            .unwrap();
        assert_eq!(got, Some(down));
    }

    #[test]
    fn events_list_per_group() {
        let store = StateStore::open_in_memory().unwrap();
        for (i, id) in ["ng-1", "ng-1", "ng-2"].iter().enumerate() {
            let event = NodeGroupEvent {
                node_group_id: id.to_string(),
                cluster_id: "c".to_string(),
                event: NodeGroupEventType::Scaleup,
                event_time: at(100 + i as i64),
                max_num: 10,
                min_num: 0,
                desired_num: 3,
                reason: "test".to_string(),
                message: String::new(),
                seq: 0,
                deleted_time: None,
            };
            store.create_node_group_event(&event, &CreateOptions::default()).unwrap();
        }

        assert_eq!(store.list_node_group_events("ng-1", &ListOptions::default()).unwrap().len(), 2);
        assert_eq!(store.list_node_group_events("ng-2", &ListOptions::default()).unwrap().len(), 1);
    }

    #[test]
    fn same_instant_events_are_all_kept() {
        let store = StateStore::open_in_memory().unwrap();
        for (event, desired) in [
            (NodeGroupEventType::Scaledown, 4),
            (NodeGroupEventType::Scaledown, 3),
            (NodeGroupEventType::ScaleDownByTask, 2),
        ] {
            let record = NodeGroupEvent {
                node_group_id: "ng-1".to_string(),
                cluster_id: "c".to_string(),
                event,
                event_time: at(100),
                max_num: 10,
                min_num: 0,
                desired_num: desired,
                reason: "test".to_string(),
                message: String::new(),
                seq: 0,
                deleted_time: None,
            };
            store.create_node_group_event(&record, &CreateOptions::default()).unwrap();
        }

        let events = store.list_node_group_events("ng-1", &ListOptions::default()).unwrap();
        let mut desired: Vec<u32> = events.iter().map(|e| e.desired_num).collect();
        desired.sort();
        assert_eq!(desired, vec![2, 3, 4]);
    }

    // ── Tasks ──────────────────────────────────────────────────────

    #[test]
    fn tasks_filter_by_strategy() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_task(&test_task("t-1", "s-a"), &CreateOptions::default()).unwrap();
        store.create_task(&test_task("t-2", "s-a"), &CreateOptions::default()).unwrap();
        store.create_task(&test_task("t-3", "s-b"), &CreateOptions::default()).unwrap();

        let a = store.list_tasks_by_strategy("s-a", &ListOptions::default()).unwrap();
        assert_eq!(a.len(), 2);
        let limited = store
            .list_tasks_by_strategy(
                "s-a",
                &ListOptions {
                    limit: 1,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.create_task(&test_task("t-1", "s"), &CreateOptions::default()).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let task = store.get_task("t-1", &GetOptions::default()).unwrap();
        assert_eq!(task.map(|t| t.drain_delay), Some("72h".to_string()));
    }
}
