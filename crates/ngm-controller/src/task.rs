//! TaskScheduler — the drain task control loop.
//!
//! A tick runs five phases in order. Each phase handles its own failures,
//! so one broken task never stops the others.
//!
//! ```text
//! sync        external tasks merged into the store, open tasks get nodes
//!             selected and labeled
//! expire      tasks past begin_execute_time commit ScaleDownByTask actions
//!             and lower desired sizes
//! cleanup     terminated tasks that never executed lose labels and record
//! trace       executed tasks tracked until every selected node left
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rand::rngs::StdRng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use ngm_cluster::{
    ClientError, ClusterClient, MetadataPatch, NodeLabels, ResourceManager, TaskCondition,
};
use ngm_state::*;

use crate::config::{TaskSchedulerConfig, seeded_rng};
use crate::error::{ControllerError, ControllerResult};
use crate::pool::WorkerPool;
use crate::selector::{NodeSelector, allocate};
use crate::tick::{TickReport, run_ticks};

/// Remaining nodes of one group of an executed task.
#[derive(Debug, Clone, PartialEq)]
struct GroupProgress {
    node_group_id: String,
    selected: u32,
    remaining: u32,
}

impl GroupProgress {
    fn process(&self) -> u32 {
        if self.selected == 0 {
            return 100;
        }
        (self.selected - self.remaining) * 100 / self.selected
    }
}

/// Whether the task's drain window is still open for selection.
fn is_open(task: &ScaleDownTask, now: DateTime<Utc>) -> bool {
    task.status == TaskStatus::Requesting && !task.is_executed && now < task.deadline
}

/// Selects, labels and executes scale-down tasks.
pub struct TaskScheduler {
    storage: Arc<dyn Storage>,
    resource_manager: Arc<dyn ResourceManager>,
    cluster: Arc<dyn ClusterClient>,
    selector: NodeSelector,
    labels: NodeLabels,
    pool: WorkerPool,
    config: TaskSchedulerConfig,
    rng: Mutex<StdRng>,
}

/// Builder for [`TaskScheduler`].
#[derive(Default)]
pub struct TaskSchedulerBuilder {
    storage: Option<Arc<dyn Storage>>,
    resource_manager: Option<Arc<dyn ResourceManager>>,
    cluster: Option<Arc<dyn ClusterClient>>,
    labels: NodeLabels,
    config: TaskSchedulerConfig,
}

impl TaskSchedulerBuilder {
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn resource_manager(mut self, resource_manager: Arc<dyn ResourceManager>) -> Self {
        self.resource_manager = Some(resource_manager);
        self
    }

    pub fn cluster(mut self, cluster: Arc<dyn ClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn labels(mut self, labels: NodeLabels) -> Self {
        self.labels = labels;
        self
    }

    pub fn config(mut self, config: TaskSchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ControllerResult<TaskScheduler> {
        let storage = self
            .storage
            .ok_or(ControllerError::MissingCollaborator("storage"))?;
        let resource_manager = self
            .resource_manager
            .ok_or(ControllerError::MissingCollaborator("resource manager"))?;
        let cluster = self
            .cluster
            .ok_or(ControllerError::MissingCollaborator("cluster client"))?;

        Ok(TaskScheduler {
            selector: NodeSelector::new(
                cluster.clone(),
                resource_manager.clone(),
                self.labels.clone(),
            ),
            storage,
            resource_manager,
            cluster,
            labels: self.labels,
            pool: WorkerPool::new(self.config.concurrency),
            rng: Mutex::new(seeded_rng(self.config.rng_seed)),
            config: self.config,
        })
    }
}

impl TaskScheduler {
    pub fn builder() -> TaskSchedulerBuilder {
        TaskSchedulerBuilder::default()
    }

    /// Run the task loop until `shutdown` changes.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval();
        run_ticks("task", interval, shutdown, move || {
            let this = self.clone();
            async move { this.tick_at(Utc::now()).await }
        })
        .await;
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let strategies = match self
            .storage
            .list_node_group_strategies(&ListOptions::default())
        {
            Ok(strategies) => strategies,
            Err(e) => {
                error!(error = %e, "failed to list strategies");
                report.record_error("list strategies", e);
                return report;
            }
        };

        for strategy in &strategies {
            if let Err(e) = self.sync_normal_tasks(strategy, now, &mut report).await {
                error!(strategy = %strategy.name, error = %e, "task sync failed");
                report.record_error(format!("strategy {}", strategy.name), e);
            }
        }
        if let Err(e) = self.handle_expired_tasks(now, &mut report) {
            error!(error = %e, "expired task handling failed");
            report.record_error("expired tasks", e);
        }
        if let Err(e) = self.cleanup_terminated_tasks(&strategies, &mut report).await {
            error!(error = %e, "terminated task cleanup failed");
            report.record_error("terminated tasks", e);
        }
        if let Err(e) = self.trace_executed_tasks(now, &mut report).await {
            error!(error = %e, "completion tracing failed");
            report.record_error("executed tasks", e);
        }

        report
    }

    // ── Normal-task sync ───────────────────────────────────────────

    async fn sync_normal_tasks(
        &self,
        strategy: &NodeGroupMgrStrategy,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> ControllerResult<()> {
        let mut external: BTreeMap<String, ScaleDownTask> = BTreeMap::new();
        let by_consumer = self
            .resource_manager
            .list_tasks_by_consumer(&strategy.reserved_node_group.consumer_id)
            .await?;
        let by_cond = self
            .resource_manager
            .list_tasks_by_cond(&TaskCondition {
                pool_id: strategy.resource_pool.clone(),
                strategy: strategy.name.clone(),
            })
            .await?;
        for task in by_consumer.into_iter().chain(by_cond) {
            external.entry(task.task_id.clone()).or_insert(task);
        }

        let local: BTreeMap<String, ScaleDownTask> = self
            .storage
            .list_tasks_by_strategy(&strategy.name, &ListOptions::default())?
            .into_iter()
            .map(|t| (t.task_id.clone(), t))
            .collect();

        let seen: HashSet<String> = external.keys().cloned().collect();
        let mut open = Vec::new();
        for (task_id, incoming) in external {
            match self.merge_external(strategy, local.get(&task_id), incoming, now)? {
                Some(task) if is_open(&task, now) => open.push(task),
                _ => {}
            }
        }

        let missing = local
            .into_values()
            .filter(|t| !seen.contains(&t.task_id) && t.status == TaskStatus::Requesting);
        for task in missing {
            match self.resource_manager.get_task_by_id(&task.task_id).await? {
                Some(remote) if remote.status == TaskStatus::Requesting => {
                    if is_open(&task, now) {
                        open.push(task);
                    }
                }
                remote => {
                    let mut finished = task;
                    finished.status = TaskStatus::Finished;
                    finished.updated_time = now;
                    self.storage
                        .update_task(&finished, &UpdateOptions::overwrite())?;
                    info!(
                        task_id = %finished.task_id,
                        gone = remote.is_none(),
                        "task no longer requested, marked finished"
                    );
                }
            }
        }

        for task in open {
            report.processed += 1;
            let task_id = task.task_id.clone();
            if let Err(e) = self.handle_one_normal_task(strategy, task, now).await {
                error!(task_id = %task_id, error = %e, "task handling failed");
                report.record_error(format!("task {task_id}"), e);
            }
        }
        Ok(())
    }

    /// Fold an external task into the store. External fields win; local
    /// selection and execution state is kept. Returns the stored task.
    fn merge_external(
        &self,
        strategy: &NodeGroupMgrStrategy,
        local: Option<&ScaleDownTask>,
        mut incoming: ScaleDownTask,
        now: DateTime<Utc>,
    ) -> ControllerResult<Option<ScaleDownTask>> {
        incoming.node_group_strategy = strategy.name.clone();
        incoming.deleted_time = None;

        let Some(current) = local else {
            let tombstoned = self.storage.get_task(
                &incoming.task_id,
                &GetOptions {
                    get_soft_deleted: true,
                    ..Default::default()
                },
            )?;
            if tombstoned.is_some() || incoming.status != TaskStatus::Requesting {
                return Ok(None);
            }
            incoming.is_executed = false;
            incoming.scale_down_groups.clear();
            incoming.created_time = now;
            incoming.updated_time = now;
            self.storage.create_task(&incoming, &CreateOptions::default())?;
            info!(
                task_id = %incoming.task_id,
                strategy = %strategy.name,
                total = incoming.total_num,
                drain_delay = %incoming.drain_delay,
                "new scale-down task"
            );
            return Ok(Some(incoming));
        };

        incoming.scale_down_groups = current.scale_down_groups.clone();
        incoming.is_executed = current.is_executed;
        incoming.created_time = current.created_time;
        incoming.updated_time = current.updated_time;
        if incoming == *current {
            return Ok(Some(incoming));
        }
        incoming.updated_time = now;
        let stored = self
            .storage
            .update_task(&incoming, &UpdateOptions::overwrite())?;
        debug!(task_id = %stored.task_id, status = ?stored.status, "task refreshed");
        Ok(Some(stored))
    }

    async fn handle_one_normal_task(
        &self,
        strategy: &NodeGroupMgrStrategy,
        mut task: ScaleDownTask,
        now: DateTime<Utc>,
    ) -> ControllerResult<()> {
        let stored = task.scale_down_groups.clone();
        let details = if task.specify_scale_down {
            self.selector
                .map_device_list(strategy, &task.device_list)
                .await?
        } else if task.total_num > 0 && task.selected_num() == task.total_num {
            let ready = self.revalidate(&task).await;
            let still = ready.iter().map(|d| d.node_num).sum::<u32>();
            if still == task.total_num {
                ready
            } else {
                info!(
                    task_id = %task.task_id,
                    lost = task.total_num - still,
                    "selected nodes lost readiness, reselecting"
                );
                task.scale_down_groups = ready;
                self.node_selector(strategy, &task).await?
            }
        } else {
            self.node_selector(strategy, &task).await?
        };

        let changed = details != stored;
        task.scale_down_groups = details;
        if changed {
            task.updated_time = now;
            task = self
                .storage
                .update_task(&task, &UpdateOptions::overwrite())?;
            info!(
                task_id = %task.task_id,
                selected = task.selected_num(),
                total = task.total_num,
                "task selection updated"
            );
        }

        let keep: HashSet<String> = task.selected_ips().into_iter().collect();
        self.strip_task_labels(&task_clusters(Some(strategy), &task), &task.task_id, &keep)
            .await;
        self.label_selected(&task).await
    }

    async fn node_selector(
        &self,
        strategy: &NodeGroupMgrStrategy,
        task: &ScaleDownTask,
    ) -> ControllerResult<Vec<ScaleDownDetail>> {
        let tiers = self.selector.filter_available_nodes(strategy, task).await?;
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(allocate(strategy, task, &tiers, &mut *rng))
    }

    /// Drop selected nodes that are gone or not Ready.
    async fn revalidate(&self, task: &ScaleDownTask) -> Vec<ScaleDownDetail> {
        let ips = task.selected_ips();
        let jobs = ips
            .iter()
            .map(|ip| {
                let cluster = self.cluster.clone();
                let ip = ip.clone();
                async move {
                    match cluster.get_node_detail(&ip).await {
                        Ok(detail) => detail.ready,
                        Err(ClientError::NotFound(_)) => false,
                        Err(e) => {
                            warn!(%ip, error = %e, "readiness check failed, keeping node");
                            true
                        }
                    }
                }
            })
            .collect();
        let results = self.pool.run_all(jobs).await;
        let not_ready: HashSet<&String> = ips
            .iter()
            .zip(results)
            .filter(|(_, ready)| *ready == Some(false))
            .map(|(ip, _)| ip)
            .collect();

        task.scale_down_groups
            .iter()
            .filter_map(|d| {
                let node_ips: Vec<String> = d
                    .node_ips
                    .iter()
                    .filter(|ip| !not_ready.contains(ip))
                    .cloned()
                    .collect();
                (!node_ips.is_empty()).then(|| ScaleDownDetail {
                    node_num: node_ips.len() as u32,
                    node_ips,
                    ..d.clone()
                })
            })
            .collect()
    }

    /// Write task, drain delay and deadline onto every selected node.
    async fn label_selected(&self, task: &ScaleDownTask) -> ControllerResult<()> {
        let deadline = task.deadline.to_rfc3339_opts(SecondsFormat::Secs, true);
        for detail in &task.scale_down_groups {
            let selector =
                BTreeMap::from([(self.labels.node_group.clone(), detail.node_group_id.clone())]);
            let nodes = self
                .cluster
                .list_nodes_by_label(&detail.cluster_id, &selector)
                .await?;

            for ip in &detail.node_ips {
                let Some(node) = nodes.values().find(|n| n.ip == *ip) else {
                    warn!(task_id = %task.task_id, %ip, "selected node not found");
                    continue;
                };
                let labeled = node.label(&self.labels.task) == Some(task.task_id.as_str())
                    && node.label(&self.labels.drain_delay) == Some(task.drain_delay.as_str())
                    && node.annotations.get(&self.labels.drain_deadline) == Some(&deadline);
                if labeled {
                    continue;
                }
                let labels = MetadataPatch::from([
                    (self.labels.task.clone(), Some(task.task_id.clone())),
                    (self.labels.drain_delay.clone(), Some(task.drain_delay.clone())),
                ]);
                let annotations =
                    MetadataPatch::from([(self.labels.drain_deadline.clone(), Some(deadline.clone()))]);
                self.cluster
                    .update_node_metadata(&detail.cluster_id, &node.name, &labels, &annotations)
                    .await?;
                debug!(task_id = %task.task_id, node = %node.name, "node labeled for drain");
            }
        }
        Ok(())
    }

    /// Remove this task's labels from nodes outside `keep`. Best effort.
    async fn strip_task_labels(
        &self,
        clusters: &BTreeSet<String>,
        task_id: &str,
        keep: &HashSet<String>,
    ) {
        let selector = BTreeMap::from([(self.labels.task.clone(), task_id.to_string())]);
        let labels = MetadataPatch::from([
            (self.labels.task.clone(), None),
            (self.labels.drain_delay.clone(), None),
        ]);
        let annotations = MetadataPatch::from([(self.labels.drain_deadline.clone(), None)]);

        for cluster_id in clusters {
            let nodes = match self.cluster.list_nodes_by_label(cluster_id, &selector).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    warn!(%cluster_id, task_id, error = %e, "failed to list labeled nodes");
                    continue;
                }
            };
            for node in nodes.values().filter(|n| !keep.contains(&n.ip)) {
                match self
                    .cluster
                    .update_node_metadata(cluster_id, &node.name, &labels, &annotations)
                    .await
                {
                    Ok(()) => debug!(task_id, node = %node.name, "stale drain labels removed"),
                    Err(e) => warn!(task_id, node = %node.name, error = %e, "failed to remove labels"),
                }
            }
        }
    }

    // ── Expired tasks ──────────────────────────────────────────────

    fn handle_expired_tasks(&self, now: DateTime<Utc>, report: &mut TickReport) -> ControllerResult<()> {
        let tasks = self.storage.list_tasks(&ListOptions::default())?;
        let due = tasks.into_iter().filter(|t| {
            t.status == TaskStatus::Requesting
                && !t.is_executed
                && now >= t.begin_execute_time
                && t.selected_num() > 0
        });
        for task in due {
            report.processed += 1;
            if let Err(e) = self.execute_task(task.clone(), now) {
                error!(task_id = %task.task_id, error = %e, "task execution failed");
                report.record_error(format!("task {}", task.task_id), e);
            }
        }
        Ok(())
    }

    fn execute_task(&self, mut task: ScaleDownTask, now: DateTime<Utc>) -> ControllerResult<()> {
        let event = NodeGroupEventType::ScaleDownByTask;
        let mut committed = HashSet::new();
        for detail in &task.scale_down_groups {
            let Some(action) = self.storage.get_node_group_action(
                &detail.node_group_id,
                event,
                &GetOptions::default(),
            )?
            else {
                continue;
            };
            if action.task_id.as_deref() == Some(task.task_id.as_str()) {
                committed.insert(detail.node_group_id.clone());
                continue;
            }
            info!(
                task_id = %task.task_id,
                node_group = %detail.node_group_id,
                blocking = action.task_id.as_deref().unwrap_or("-"),
                "another task is draining this group, waiting"
            );
            return Ok(());
        }

        for detail in task.scale_down_groups.iter().filter(|d| !d.node_ips.is_empty()) {
            if committed.contains(&detail.node_group_id) {
                continue;
            }
            let Some(mut group) = self
                .storage
                .get_node_group(&detail.node_group_id, &GetOptions::default())?
            else {
                warn!(
                    task_id = %task.task_id,
                    node_group = %detail.node_group_id,
                    "node group of selected nodes not found"
                );
                continue;
            };

            if self
                .storage
                .delete_node_group_action(
                    &group.node_group_id,
                    NodeGroupEventType::Scaleup,
                    &DeleteOptions::default(),
                )?
                .is_some()
            {
                info!(node_group = %group.node_group_id, "pending scale-up dropped for drain");
            }

            let num = detail.node_ips.len() as u32;
            let before = group.clone();
            group.desired_size = group.desired_size.saturating_sub(num);
            group.hook_confirm = false;
            group.updated_time = now;

            let mut action = NodeGroupAction::new(&before, &task.node_group_strategy, event, now);
            action.task_id = Some(task.task_id.clone());
            action.node_ips = detail.node_ips.clone();
            action.delta_num = -(num as i32);
            action.new_desired_num = group.desired_size;
            self.storage
                .update_node_group_action(&action, &UpdateOptions::upsert())?;
            self.storage
                .update_node_group(&group, &UpdateOptions::overwrite())?;
            self.record_event(&task, &group, num, now);
            info!(
                task_id = %task.task_id,
                node_group = %group.node_group_id,
                from = before.desired_size,
                to = group.desired_size,
                "task drain committed"
            );
        }

        task.is_executed = true;
        task.updated_time = now;
        self.storage.update_task(&task, &UpdateOptions::overwrite())?;
        Ok(())
    }

    /// Append an audit event. Failures are logged only.
    fn record_event(&self, task: &ScaleDownTask, group: &NodeGroup, num: u32, now: DateTime<Utc>) {
        let record = NodeGroupEvent {
            node_group_id: group.node_group_id.clone(),
            cluster_id: group.cluster_id.clone(),
            event: NodeGroupEventType::ScaleDownByTask,
            event_time: now,
            max_num: group.max_size,
            min_num: group.min_size,
            desired_num: group.desired_size,
            reason: format!("task {}", task.task_id),
            message: format!("draining {num} selected nodes"),
            seq: 0,
            deleted_time: None,
        };
        if let Err(e) = self
            .storage
            .create_node_group_event(&record, &CreateOptions::default())
        {
            warn!(node_group = %group.node_group_id, error = %e, "failed to record event");
        }
    }

    // ── Terminated tasks ───────────────────────────────────────────

    async fn cleanup_terminated_tasks(
        &self,
        strategies: &[NodeGroupMgrStrategy],
        report: &mut TickReport,
    ) -> ControllerResult<()> {
        let tasks = self.storage.list_tasks(&ListOptions::default())?;
        for task in tasks
            .into_iter()
            .filter(|t| !t.is_executed && t.status != TaskStatus::Requesting)
        {
            report.processed += 1;
            let strategy = strategies.iter().find(|s| s.name == task.node_group_strategy);
            self.strip_task_labels(&task_clusters(strategy, &task), &task.task_id, &HashSet::new())
                .await;
            match self
                .storage
                .delete_task(&task.task_id, &DeleteOptions::default())
            {
                Ok(_) => info!(task_id = %task.task_id, status = ?task.status, "task closed"),
                Err(e) => {
                    error!(task_id = %task.task_id, error = %e, "failed to delete task");
                    report.record_error(format!("task {}", task.task_id), e);
                }
            }
        }
        Ok(())
    }

    // ── Completion tracing ─────────────────────────────────────────

    async fn trace_executed_tasks(
        &self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> ControllerResult<()> {
        let tasks: Vec<ScaleDownTask> = self
            .storage
            .list_tasks(&ListOptions::default())?
            .into_iter()
            .filter(|t| t.is_executed)
            .collect();
        if tasks.is_empty() {
            return Ok(());
        }

        let jobs = tasks
            .iter()
            .map(|task| {
                let storage = self.storage.clone();
                let task = task.clone();
                async move { trace_one(storage.as_ref(), &task) }
            })
            .collect();
        let results = self.pool.run_all(jobs).await;

        for (task, result) in tasks.iter().zip(results) {
            report.processed += 1;
            let outcome = match result {
                Some(Ok(progress)) => self.apply_progress(task, &progress, now).await,
                Some(Err(e)) => Err(e),
                None => {
                    report.record_error(format!("task {}", task.task_id), "trace panicked");
                    continue;
                }
            };
            if let Err(e) = outcome {
                error!(task_id = %task.task_id, error = %e, "completion tracing failed");
                report.record_error(format!("task {}", task.task_id), e);
            }
        }
        Ok(())
    }

    async fn apply_progress(
        &self,
        task: &ScaleDownTask,
        progress: &[GroupProgress],
        now: DateTime<Utc>,
    ) -> ControllerResult<()> {
        let mut actions = Vec::new();
        for group in progress {
            let Some(mut action) = self.storage.get_node_group_action(
                &group.node_group_id,
                NodeGroupEventType::ScaleDownByTask,
                &GetOptions::default(),
            )?
            else {
                continue;
            };
            if action.task_id.as_deref() != Some(task.task_id.as_str()) {
                continue;
            }
            let process = group.process();
            if process != action.process {
                action.process = process;
                action.updated_time = now;
                action = self
                    .storage
                    .update_node_group_action(&action, &UpdateOptions::overwrite())?;
            }
            actions.push(action);
        }

        let remaining: u32 = progress.iter().map(|g| g.remaining).sum();
        if remaining > 0 {
            debug!(task_id = %task.task_id, remaining, "task still draining");
            return Ok(());
        }

        if self.config.report_consumed_ips {
            self.resource_manager
                .fill_device_record_ip(&task.task_id, &task.selected_ips())
                .await?;
        }
        for mut action in actions {
            if action.process != 100 {
                action.process = 100;
                action.updated_time = now;
                self.storage
                    .update_node_group_action(&action, &UpdateOptions::overwrite())?;
            }
            self.storage.delete_node_group_action(
                &action.node_group_id,
                action.event,
                &DeleteOptions::default(),
            )?;
        }
        self.storage
            .delete_task(&task.task_id, &DeleteOptions::default())?;
        info!(
            task_id = %task.task_id,
            drained = task.selected_num(),
            "task completed"
        );
        Ok(())
    }
}

/// Read-only: how many selected IPs each group still holds.
fn trace_one(storage: &dyn Storage, task: &ScaleDownTask) -> ControllerResult<Vec<GroupProgress>> {
    let mut out = Vec::new();
    for detail in task.scale_down_groups.iter().filter(|d| !d.node_ips.is_empty()) {
        let remaining = match storage.get_node_group(&detail.node_group_id, &GetOptions::default())? {
            Some(group) => detail
                .node_ips
                .iter()
                .filter(|ip| group.node_ips.contains(ip))
                .count() as u32,
            None => 0,
        };
        out.push(GroupProgress {
            node_group_id: detail.node_group_id.clone(),
            selected: detail.node_ips.len() as u32,
            remaining,
        });
    }
    Ok(out)
}

/// Clusters a task's labels may live in.
fn task_clusters(strategy: Option<&NodeGroupMgrStrategy>, task: &ScaleDownTask) -> BTreeSet<String> {
    let mut clusters: BTreeSet<String> = task
        .scale_down_groups
        .iter()
        .map(|d| d.cluster_id.clone())
        .collect();
    if let Some(strategy) = strategy {
        clusters.extend(strategy.elastic_node_groups.iter().map(|e| e.cluster_id.clone()));
    }
    clusters
}
