//! StrategyReconciler — the capacity control loop.
//!
//! Every tick, each strategy is evaluated on its own:
//!
//! ```text
//! executor.is_able_to_scale_down  -> release across elastic groups
//!                                    (weight balancer, limitation =
//!                                     nodes - min_size - promised,
//!                                     at most desired - min_size)
//! executor.is_able_to_scale_up    -> grow elastic groups
//!                                    (simple balancer; shares cut by a
//!                                     group limit go to its siblings)
//! otherwise                       -> Stable, sweep finished or timed-out
//!                                    actions
//! ```
//!
//! Capacity already promised by in-flight actions (`cm_desired - desired`
//! for releases, `desired - cm_desired` for growth) is subtracted before
//! allocating, so repeated ticks against unchanged state write nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use ngm_balancer::{BalanceEntry, SimpleBalancer, WeightBalancer};
use ngm_cluster::{ClusterClient, ResourceManager};
use ngm_state::*;
use ngm_strategy::{
    DEFAULT_TASK_LOOKAHEAD, ExecutorContext, ExecutorRegistry, ScaleUpCheck, StrategyExecutor,
};

use crate::config::{ControllerConfig, seeded_rng};
use crate::error::{ControllerError, ControllerResult};
use crate::tick::{TickReport, run_ticks};

/// An elastic group joined with its stored state.
struct ElasticSlot {
    elastic: ElasticNodeGroup,
    group: NodeGroup,
}

/// Actions the reconciler creates and sweeps itself.
fn is_capacity_event(event: NodeGroupEventType) -> bool {
    matches!(
        event,
        NodeGroupEventType::Scaleup | NodeGroupEventType::Scaledown
    )
}

/// Nodes a group is already expected to add or give up through `event`.
fn promised(group: &NodeGroup, event: NodeGroupEventType) -> u32 {
    match event {
        NodeGroupEventType::Scaledown => group.cm_desired_size.saturating_sub(group.desired_size),
        _ => group.desired_size.saturating_sub(group.cm_desired_size),
    }
}

/// Balances desired sizes between the reserved pool and elastic groups.
pub struct StrategyReconciler {
    storage: Arc<dyn Storage>,
    cluster: Arc<dyn ClusterClient>,
    registry: Arc<ExecutorRegistry>,
    config: ControllerConfig,
    rng: Mutex<StdRng>,
}

/// Builder for [`StrategyReconciler`]. Storage, resource manager and
/// cluster client are required.
#[derive(Default)]
pub struct StrategyReconcilerBuilder {
    storage: Option<Arc<dyn Storage>>,
    resource_manager: Option<Arc<dyn ResourceManager>>,
    cluster: Option<Arc<dyn ClusterClient>>,
    registry: Option<Arc<ExecutorRegistry>>,
    task_lookahead: Option<chrono::Duration>,
    config: ControllerConfig,
}

impl StrategyReconcilerBuilder {
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

    /// Use a prebuilt registry instead of the default executors.
    pub fn registry(mut self, registry: Arc<ExecutorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn task_lookahead(mut self, lookahead: chrono::Duration) -> Self {
        self.task_lookahead = Some(lookahead);
        self
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ControllerResult<StrategyReconciler> {
        let storage = self
            .storage
            .ok_or(ControllerError::MissingCollaborator("storage"))?;
        let resource_manager = self
            .resource_manager
            .ok_or(ControllerError::MissingCollaborator("resource manager"))?;
        let cluster = self
            .cluster
            .ok_or(ControllerError::MissingCollaborator("cluster client"))?;

        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let ctx = ExecutorContext::new(storage.clone(), resource_manager, cluster.clone())
                    .with_task_lookahead(self.task_lookahead.unwrap_or(DEFAULT_TASK_LOOKAHEAD));
                Arc::new(ExecutorRegistry::new(ctx))
            }
        };

        Ok(StrategyReconciler {
            storage,
            cluster,
            registry,
            rng: Mutex::new(seeded_rng(self.config.rng_seed)),
            config: self.config,
        })
    }
}

impl StrategyReconciler {
    pub fn builder() -> StrategyReconcilerBuilder {
        StrategyReconcilerBuilder::default()
    }

    /// Run the reconcile loop until `shutdown` changes.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval();
        run_ticks("strategy", interval, shutdown, move || {
            let this = self.clone();
            async move { this.tick_at(Utc::now()).await }
        })
        .await;
    }

    /// Reconcile every strategy once, then apply pending node metadata.
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
            report.processed += 1;
            if let Err(e) = self.reconcile(strategy, now).await {
                error!(strategy = %strategy.name, error = %e, "reconcile failed");
                self.record_error(strategy, &e, now);
                report.record_error(format!("strategy {}", strategy.name), e);
            }
        }

        for (kind, executor) in self.registry.executors() {
            if let Err(e) = executor.handle_node_metadata(now).await {
                warn!(strategy_type = %kind, error = %e, "node metadata update failed");
                report.record_error(format!("node metadata {kind}"), e);
            }
        }

        report
    }

    async fn reconcile(&self, strategy: &NodeGroupMgrStrategy, now: DateTime<Utc>) -> ControllerResult<()> {
        let executor = self.registry.get(strategy.strategy.kind)?;
        let mut slots = self.load_slots(strategy)?;
        let actions = self.load_actions(&slots)?;

        let down = executor.is_able_to_scale_down(strategy, now).await?;
        if down.able {
            return self.scale_down(strategy, &mut slots, actions, down.num, now);
        }

        let up = executor.is_able_to_scale_up(strategy, now).await?;
        if up.able {
            return self.scale_up(strategy, &mut slots, actions, up, now).await;
        }

        self.settle(strategy, executor.as_ref(), actions, now).await
    }

    fn load_slots(&self, strategy: &NodeGroupMgrStrategy) -> ControllerResult<Vec<ElasticSlot>> {
        let mut slots = Vec::with_capacity(strategy.elastic_node_groups.len());
        for elastic in &strategy.elastic_node_groups {
            match self
                .storage
                .get_node_group(&elastic.node_group_id, &GetOptions::default())?
            {
                Some(group) => slots.push(ElasticSlot {
                    elastic: elastic.clone(),
                    group,
                }),
                None => warn!(
                    strategy = %strategy.name,
                    node_group = %elastic.node_group_id,
                    "elastic node group not reported yet"
                ),
            }
        }
        Ok(slots)
    }

    /// Live capacity actions of the slots, with progress refreshed.
    fn load_actions(&self, slots: &[ElasticSlot]) -> ControllerResult<Vec<NodeGroupAction>> {
        let mut out = Vec::new();
        for slot in slots {
            let actions = self.storage.list_node_group_actions_by_node_group(
                &slot.group.node_group_id,
                &ListOptions::default(),
            )?;
            for mut action in actions.into_iter().filter(|a| is_capacity_event(a.event)) {
                let process = calculate_process(slot.group.current_size(), action.new_desired_num);
                if process != action.process {
                    action.process = process;
                    self.storage
                        .update_node_group_action(&action, &UpdateOptions::overwrite())?;
                }
                out.push(action);
            }
        }
        Ok(out)
    }

    /// Delete actions pointing the other way. Returns the rest.
    fn drop_conflicting(
        &self,
        actions: Vec<NodeGroupAction>,
        keep: NodeGroupEventType,
    ) -> ControllerResult<Vec<NodeGroupAction>> {
        let mut kept = Vec::with_capacity(actions.len());
        for action in actions {
            if action.event == keep {
                kept.push(action);
                continue;
            }
            self.storage.delete_node_group_action(
                &action.node_group_id,
                action.event,
                &DeleteOptions::default(),
            )?;
            info!(
                node_group = %action.node_group_id,
                stale = %action.event,
                "direction changed, stale action dropped"
            );
        }
        Ok(kept)
    }

    /// Per group, what live `event` actions still promise.
    fn promised_by_group(
        slots: &[ElasticSlot],
        actions: &[NodeGroupAction],
        event: NodeGroupEventType,
        delay: u32,
        now: DateTime<Utc>,
    ) -> HashMap<String, u32> {
        actions
            .iter()
            .filter(|a| a.event == event && !a.is_timeout(delay, now))
            .filter_map(|a| {
                let slot = slots
                    .iter()
                    .find(|s| s.group.node_group_id == a.node_group_id)?;
                Some((a.node_group_id.clone(), promised(&slot.group, event)))
            })
            .collect()
    }

    fn warn_overshoot(&self, strategy: &NodeGroupMgrStrategy, upcoming: u32, num: u32) {
        if upcoming > num + self.config.oscillation_slack {
            warn!(
                strategy = %strategy.name,
                upcoming,
                required = num,
                slack = self.config.oscillation_slack,
                "in-flight actions exceed the requirement"
            );
        }
    }

    fn scale_down(
        &self,
        strategy: &NodeGroupMgrStrategy,
        slots: &mut [ElasticSlot],
        actions: Vec<NodeGroupAction>,
        num: u32,
        now: DateTime<Utc>,
    ) -> ControllerResult<()> {
        let event = NodeGroupEventType::Scaledown;
        let actions = self.drop_conflicting(actions, event)?;
        let promised =
            Self::promised_by_group(slots, &actions, event, strategy.strategy.scale_down_delay, now);
        let upcoming: u32 = promised.values().sum();

        if upcoming >= num {
            self.warn_overshoot(strategy, upcoming, num);
            debug!(strategy = %strategy.name, upcoming, num, "release already in flight");
            return self.set_status(strategy, StrategyStatus::Scaledown, "release in flight", now);
        }

        let shortfall = num - upcoming;
        let entries = slots
            .iter()
            .map(|s| {
                let releasable = s
                    .group
                    .current_size()
                    .saturating_sub(s.group.min_size)
                    .saturating_sub(promised.get(&s.group.node_group_id).copied().unwrap_or(0))
                    .min(s.group.desired_size.saturating_sub(s.group.min_size));
                BalanceEntry::new(s.group.node_group_id.clone(), s.elastic.weight, releasable)
            })
            .collect();
        let allocations = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            WeightBalancer::new(entries).distribute(shortfall, &mut *rng)
        };

        let mut released = 0;
        for allocation in allocations.iter().filter(|a| a.num > 0) {
            let Some(slot) = slots
                .iter_mut()
                .find(|s| s.group.node_group_id == allocation.node_group_id)
            else {
                continue;
            };
            let before = slot.group.clone();
            slot.group.desired_size = slot.group.desired_size.saturating_sub(allocation.num);
            self.commit(strategy, slot, &before, &actions, event, now)?;
            released += allocation.num;
        }

        if released < shortfall {
            warn!(
                strategy = %strategy.name,
                required = shortfall,
                released,
                "elastic groups cannot release enough nodes"
            );
        }
        self.set_status(
            strategy,
            StrategyStatus::Scaledown,
            &format!("releasing {released} nodes"),
            now,
        )
    }

    async fn scale_up(
        &self,
        strategy: &NodeGroupMgrStrategy,
        slots: &mut [ElasticSlot],
        actions: Vec<NodeGroupAction>,
        check: ScaleUpCheck,
        now: DateTime<Utc>,
    ) -> ControllerResult<()> {
        let event = NodeGroupEventType::Scaleup;
        let actions = self.drop_conflicting(actions, event)?;
        let promised =
            Self::promised_by_group(slots, &actions, event, strategy.strategy.scale_up_delay, now);
        let upcoming: u32 = promised.values().sum();

        if upcoming >= check.num {
            self.warn_overshoot(strategy, upcoming, check.num);
            debug!(strategy = %strategy.name, upcoming, num = check.num, "growth already in flight");
            return self.set_status(strategy, StrategyStatus::Scaleup, "growth in flight", now);
        }

        let shortfall = check.num - upcoming;
        let (grants, lost) = share_within_limits(slots, shortfall);
        if lost > 0 {
            warn!(
                strategy = %strategy.name,
                required = shortfall,
                lost,
                "elastic group limits leave scale-up demand unserved"
            );
        }

        let mut added = 0;
        for slot in slots.iter_mut() {
            let Some(&grant) = grants.get(&slot.group.node_group_id) else {
                continue;
            };
            let target = slot.group.desired_size + grant;
            let before = slot.group.clone();
            if target > slot.group.max_size {
                self.cluster
                    .update_nodegroup_max(&slot.group.cluster_id, &slot.group.node_group_id, target)
                    .await?;
                info!(
                    node_group = %slot.group.node_group_id,
                    from = slot.group.max_size,
                    to = target,
                    "node group max raised"
                );
                slot.group.max_size = target;
            }
            added += target - slot.group.desired_size;
            slot.group.desired_size = target;
            self.commit(strategy, slot, &before, &actions, event, now)?;
        }

        self.set_status(
            strategy,
            StrategyStatus::Scaleup,
            &format!("adding {added} of {} pool devices", check.total),
            now,
        )
    }

    /// Persist a new desired size with its action and audit event.
    fn commit(
        &self,
        strategy: &NodeGroupMgrStrategy,
        slot: &mut ElasticSlot,
        before: &NodeGroup,
        actions: &[NodeGroupAction],
        event: NodeGroupEventType,
        now: DateTime<Utc>,
    ) -> ControllerResult<()> {
        let group = &mut slot.group;
        group.hook_confirm = false;
        group.updated_time = now;
        self.storage
            .update_node_group(group, &UpdateOptions::overwrite())?;

        let delta = group.desired_size as i32 - before.desired_size as i32;
        let mut action = match actions
            .iter()
            .find(|a| a.node_group_id == group.node_group_id && a.event == event)
        {
            Some(existing) => {
                let mut action = existing.clone();
                action.delta_num += delta;
                action
            }
            None => {
                let mut action = NodeGroupAction::new(before, &strategy.name, event, now);
                action.delta_num = delta;
                action
            }
        };
        action.new_desired_num = group.desired_size;
        action.process = calculate_process(group.current_size(), group.desired_size);
        action.updated_time = now;
        self.storage
            .update_node_group_action(&action, &UpdateOptions::upsert())?;

        self.record_event(strategy, group, event, delta, now);
        info!(
            strategy = %strategy.name,
            node_group = %group.node_group_id,
            event = %event,
            from = before.desired_size,
            to = group.desired_size,
            "desired size updated"
        );
        Ok(())
    }

    /// Append an audit event. Failures are logged only.
    fn record_event(
        &self,
        strategy: &NodeGroupMgrStrategy,
        group: &NodeGroup,
        event: NodeGroupEventType,
        delta: i32,
        now: DateTime<Utc>,
    ) {
        let record = NodeGroupEvent {
            node_group_id: group.node_group_id.clone(),
            cluster_id: group.cluster_id.clone(),
            event,
            event_time: now,
            max_num: group.max_size,
            min_num: group.min_size,
            desired_num: group.desired_size,
            reason: format!("strategy {}", strategy.name),
            message: format!("desired size changed by {delta}"),
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

    async fn settle(
        &self,
        strategy: &NodeGroupMgrStrategy,
        executor: &dyn StrategyExecutor,
        actions: Vec<NodeGroupAction>,
        now: DateTime<Utc>,
    ) -> ControllerResult<()> {
        self.set_status(strategy, StrategyStatus::Stable, "", now)?;

        for action in actions {
            let delay = match action.event {
                NodeGroupEventType::Scaleup => strategy.strategy.scale_up_delay,
                _ => strategy.strategy.scale_down_delay,
            };
            let finished = action.is_terminated();
            if !finished && !action.is_timeout(delay, now) {
                continue;
            }
            if finished && action.event == NodeGroupEventType::Scaleup {
                executor
                    .create_node_update_action(strategy, &action, now)
                    .await?;
            }
            self.storage.delete_node_group_action(
                &action.node_group_id,
                action.event,
                &DeleteOptions::default(),
            )?;
            info!(
                node_group = %action.node_group_id,
                event = %action.event,
                finished,
                "action swept"
            );
        }
        Ok(())
    }

    /// Write a status transition. No-op when the status is unchanged.
    fn set_status(
        &self,
        strategy: &NodeGroupMgrStrategy,
        status: StrategyStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> ControllerResult<()> {
        let unchanged = strategy
            .status
            .as_ref()
            .is_some_and(|s| s.status == status && s.error.is_empty());
        if unchanged {
            return Ok(());
        }
        let mut next = strategy.clone();
        next.transition(status, message, now);
        self.storage
            .update_node_group_strategy(&next, &UpdateOptions::overwrite())?;
        info!(
            strategy = %strategy.name,
            from = %strategy.current_status(),
            to = %status,
            "strategy status changed"
        );
        Ok(())
    }

    /// Best-effort `ErrState` write.
    fn record_error(&self, strategy: &NodeGroupMgrStrategy, err: &ControllerError, now: DateTime<Utc>) {
        let mut next = match self
            .storage
            .get_node_group_strategy(&strategy.name, &GetOptions::default())
        {
            Ok(Some(current)) => current,
            _ => strategy.clone(),
        };
        let message = err.to_string();
        if let Some(state) = &next.status
            && state.status == StrategyStatus::ErrState
            && state.error == message
        {
            return;
        }

        let prior = next.status.clone();
        next.transition(StrategyStatus::ErrState, "reconcile failed", now);
        if let Some(state) = next.status.as_mut() {
            state.error = message;
            if let Some(prior) = prior.filter(|p| p.status == StrategyStatus::ErrState) {
                state.last_status = prior.last_status;
            }
        }
        if let Err(e) = self
            .storage
            .update_node_group_strategy(&next, &UpdateOptions::overwrite())
        {
            warn!(strategy = %strategy.name, error = %e, "failed to record strategy error");
        }
    }
}

/// Split `n` proportionally across the groups, re-offering whatever a
/// group's `limit` cuts off to the groups that still have room.
/// Returns the grant per group and the count no group could take.
fn share_within_limits(slots: &[ElasticSlot], n: u32) -> (HashMap<String, u32>, u32) {
    let headroom = |slot: &ElasticSlot, granted: u32| match slot.elastic.limit {
        Some(limit) => limit.saturating_sub(slot.group.desired_size.saturating_add(granted)),
        None => u32::MAX,
    };

    let mut grants: HashMap<String, u32> = HashMap::new();
    let mut left = n;
    while left > 0 {
        let open: Vec<BalanceEntry> = slots
            .iter()
            .filter(|s| headroom(*s, grants.get(&s.group.node_group_id).copied().unwrap_or(0)) > 0)
            .map(|s| BalanceEntry::new(s.group.node_group_id.clone(), s.elastic.weight, 0))
            .collect();
        if open.is_empty() {
            break;
        }

        let mut taken = 0;
        for allocation in SimpleBalancer::new(open).distribute(left) {
            let Some(slot) = slots
                .iter()
                .find(|s| s.group.node_group_id == allocation.node_group_id)
            else {
                continue;
            };
            let granted = grants.entry(allocation.node_group_id).or_default();
            let take = allocation.num.min(headroom(slot, *granted));
            *granted += take;
            taken += take;
        }
        if taken == 0 {
            break;
        }
        left -= taken;
    }
    grants.retain(|_, g| *g > 0);
    (grants, left)
}
