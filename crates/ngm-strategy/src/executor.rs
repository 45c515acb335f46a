//! Executor trait, decision records and the shared helpers both policies use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use ngm_cluster::{ClusterClient, ResourceManager, ResourcePool};
use ngm_state::{
    GetOptions, ListOptions, NodeGroupAction, NodeGroupMgrStrategy, Storage, StrategyType,
    TaskStatus,
};

use crate::buffer::BufferExecutor;
use crate::error::{StrategyError, StrategyResult};
use crate::hierarchical::HierarchicalExecutor;

/// How far ahead a pending drain task blocks scale-up.
pub const DEFAULT_TASK_LOOKAHEAD: Duration = Duration::minutes(5);

/// Outcome of a scale-down evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScaleDownCheck {
    pub num: u32,
    pub able: bool,
}

impl ScaleDownCheck {
    pub fn none() -> Self {
        Self::default()
    }

    /// Release `num` nodes. Zero is no decision.
    pub fn release(num: u32) -> Self {
        Self { num, able: num > 0 }
    }
}

/// Outcome of a scale-up evaluation. `total` is the pool size the decision
/// was made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScaleUpCheck {
    pub num: u32,
    pub able: bool,
    pub total: u32,
}

impl ScaleUpCheck {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Policy deciding whether a strategy should move capacity.
#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    async fn is_able_to_scale_down(
        &self,
        strategy: &NodeGroupMgrStrategy,
        now: DateTime<Utc>,
    ) -> StrategyResult<ScaleDownCheck>;

    async fn is_able_to_scale_up(
        &self,
        strategy: &NodeGroupMgrStrategy,
        now: DateTime<Utc>,
    ) -> StrategyResult<ScaleUpCheck>;

    /// Apply pending node metadata updates.
    async fn handle_node_metadata(&self, now: DateTime<Utc>) -> StrategyResult<()>;

    /// Called with a finished scale-up action before it is swept.
    async fn create_node_update_action(
        &self,
        strategy: &NodeGroupMgrStrategy,
        action: &NodeGroupAction,
        now: DateTime<Utc>,
    ) -> StrategyResult<()>;
}

/// Collaborators shared by every executor.
#[derive(Clone)]
pub struct ExecutorContext {
    pub storage: Arc<dyn Storage>,
    pub resource_manager: Arc<dyn ResourceManager>,
    pub cluster: Arc<dyn ClusterClient>,
    pub task_lookahead: Duration,
}

impl ExecutorContext {
    pub fn new(
        storage: Arc<dyn Storage>,
        resource_manager: Arc<dyn ResourceManager>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            storage,
            resource_manager,
            cluster,
            task_lookahead: DEFAULT_TASK_LOOKAHEAD,
        }
    }

    pub fn with_task_lookahead(mut self, lookahead: Duration) -> Self {
        self.task_lookahead = lookahead;
        self
    }

    pub(crate) async fn pool_of(
        &self,
        strategy: &NodeGroupMgrStrategy,
    ) -> StrategyResult<ResourcePool> {
        Ok(self
            .resource_manager
            .get_resource_pool_by_condition(
                &strategy.resource_pool,
                &strategy.reserved_node_group.consumer_id,
            )
            .await?)
    }

    /// Whether a drain task of the strategy is running or about to start.
    pub fn check_if_task_executing(
        &self,
        strategy: &NodeGroupMgrStrategy,
        now: DateTime<Utc>,
    ) -> StrategyResult<bool> {
        let horizon = now + self.task_lookahead;
        let tasks = self
            .storage
            .list_tasks_by_strategy(&strategy.name, &ListOptions::default())?;
        Ok(tasks.iter().any(|t| {
            t.is_executed || (t.status == TaskStatus::Requesting && t.begin_execute_time <= horizon)
        }))
    }

    /// Capacity elastic groups hold above their minimum.
    pub(crate) fn elastic_surplus(&self, strategy: &NodeGroupMgrStrategy) -> StrategyResult<u32> {
        let mut surplus = 0;
        for elastic in &strategy.elastic_node_groups {
            if let Some(group) = self
                .storage
                .get_node_group(&elastic.node_group_id, &GetOptions::default())?
            {
                surplus += group.desired_size.saturating_sub(group.min_size);
            }
        }
        Ok(surplus)
    }
}

/// Idle and total device counts of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub idle: u32,
    pub total: u32,
}

impl Occupancy {
    pub fn of(pool: &ResourcePool) -> Self {
        Self {
            idle: pool.idle(),
            total: pool.total(),
        }
    }

    /// Idle devices as a percentage of the pool. Zero for an empty pool.
    pub fn idle_ratio(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        (u64::from(self.idle) * 100 / u64::from(self.total)) as u32
    }

    /// Devices to keep idle at `pct` percent, rounded up.
    pub fn reserved(&self, pct: u32) -> u32 {
        (u64::from(self.total) * u64::from(pct)).div_ceil(100) as u32
    }
}

/// Whether the pool occupancy has not moved for `delay` minutes.
pub(crate) fn pool_is_stable(pool: &ResourcePool, delay: u32, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(pool.updated_time) >= Duration::minutes(i64::from(delay))
}

/// Scale-up size when idle capacity exceeds the high threshold.
pub(crate) fn surplus_above_high(
    strategy: &NodeGroupMgrStrategy,
    occupancy: Occupancy,
    pool: &ResourcePool,
    now: DateTime<Utc>,
) -> ScaleUpCheck {
    let params = &strategy.strategy;
    if occupancy.total == 0 || occupancy.idle_ratio() <= params.buffer.high {
        return ScaleUpCheck::none();
    }
    if !pool_is_stable(pool, params.max_idle_delay, now) {
        return ScaleUpCheck::none();
    }
    let num = occupancy
        .idle
        .saturating_sub(occupancy.reserved(params.buffer.high));
    if num == 0 || num < params.min_scale_up_size {
        return ScaleUpCheck::none();
    }
    ScaleUpCheck {
        num,
        able: true,
        total: occupancy.total,
    }
}

pub(crate) fn require_elastic_groups(strategy: &NodeGroupMgrStrategy) -> StrategyResult<()> {
    if strategy.elastic_node_groups.is_empty() {
        return Err(StrategyError::NoElasticNodeGroups(strategy.name.clone()));
    }
    Ok(())
}

/// Executors keyed by strategy type, built once and shared by reference.
pub struct ExecutorRegistry {
    executors: HashMap<StrategyType, Arc<dyn StrategyExecutor>>,
}

impl ExecutorRegistry {
    /// Registry with the buffer and hierarchical executors.
    pub fn new(ctx: ExecutorContext) -> Self {
        let mut registry = Self::empty();
        registry.register(StrategyType::Buffer, Arc::new(BufferExecutor::new(ctx.clone())));
        registry.register(
            StrategyType::HierarchicalBuffer,
            Arc::new(HierarchicalExecutor::new(ctx)),
        );
        registry
    }

    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: StrategyType, executor: Arc<dyn StrategyExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn get(&self, kind: StrategyType) -> StrategyResult<Arc<dyn StrategyExecutor>> {
        self.executors
            .get(&kind)
            .cloned()
            .ok_or(StrategyError::UnsupportedType(kind))
    }

    pub fn executors(&self) -> impl Iterator<Item = (StrategyType, &Arc<dyn StrategyExecutor>)> {
        self.executors.iter().map(|(k, v)| (*k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use ngm_state::CreateOptions;

    #[test]
    fn occupancy_reserved_rounds_up() {
        let occ = Occupancy { idle: 40, total: 101 };
        assert_eq!(occ.reserved(15), 16);
        assert_eq!(occ.reserved(0), 0);
        assert_eq!(occ.idle_ratio(), 39);
        assert_eq!(Occupancy { idle: 0, total: 0 }.idle_ratio(), 0);
    }

    #[tokio::test]
    async fn task_executing_within_lookahead() {
        let h = Harness::new().await;
        let strategy = strategy("s", StrategyType::Buffer);
        let now = at(10_000);

        assert!(!h.ctx.check_if_task_executing(&strategy, now).unwrap());

        let mut later = task("t-later", "s", now + Duration::minutes(30));
        h.ctx.storage.create_task(&later, &CreateOptions::default()).unwrap();
        assert!(!h.ctx.check_if_task_executing(&strategy, now).unwrap());

        later.task_id = "t-soon".into();
        later.begin_execute_time = now + Duration::minutes(4);
        h.ctx.storage.create_task(&later, &CreateOptions::default()).unwrap();
        assert!(h.ctx.check_if_task_executing(&strategy, now).unwrap());
    }

    #[tokio::test]
    async fn executed_task_blocks_regardless_of_time() {
        let h = Harness::new().await;
        let strategy = strategy("s", StrategyType::Buffer);
        let now = at(10_000);

        let mut t = task("t", "s", now + Duration::hours(10));
        t.is_executed = true;
        h.ctx.storage.create_task(&t, &CreateOptions::default()).unwrap();
        assert!(h.ctx.check_if_task_executing(&strategy, now).unwrap());
    }

    #[tokio::test]
    async fn lookahead_is_configurable() {
        let h = Harness::new().await;
        let ctx = h.ctx.clone().with_task_lookahead(Duration::minutes(60));
        let strategy = strategy("s", StrategyType::Buffer);
        let now = at(10_000);

        let t = task("t", "s", now + Duration::minutes(30));
        ctx.storage.create_task(&t, &CreateOptions::default()).unwrap();
        assert!(ctx.check_if_task_executing(&strategy, now).unwrap());
    }

    #[tokio::test]
    async fn registry_resolves_both_types() {
        let h = Harness::new().await;
        let registry = ExecutorRegistry::new(h.ctx.clone());
        assert!(registry.get(StrategyType::Buffer).is_ok());
        assert!(registry.get(StrategyType::HierarchicalBuffer).is_ok());
        assert_eq!(registry.executors().count(), 2);

        let empty = ExecutorRegistry::empty();
        assert!(matches!(
            empty.get(StrategyType::Buffer),
            Err(StrategyError::UnsupportedType(StrategyType::Buffer))
        ));
    }
}
