//! Hierarchical executor: scale up on idle surplus, release only through
//! drain tasks, and label nodes that joined through a scale-up.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use ngm_cluster::{ClientError, MetadataPatch};
use ngm_state::*;

use crate::error::StrategyResult;
use crate::executor::*;

pub struct HierarchicalExecutor {
    ctx: ExecutorContext,
}

impl HierarchicalExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self { ctx }
    }

    /// Label every node of `action`. Returns whether all of them are done.
    async fn label_nodes(&self, action: &NodeGroupAction, patch: &MetadataPatch) -> bool {
        let mut complete = true;
        for ip in &action.node_ips {
            let detail = match self.ctx.cluster.get_node_detail(ip).await {
                Ok(detail) => detail,
                Err(ClientError::NotFound(_)) => {
                    warn!(node_group = %action.node_group_id, %ip, "node left before it was labeled");
                    continue;
                }
                Err(e) => {
                    warn!(node_group = %action.node_group_id, %ip, error = %e, "node lookup failed");
                    complete = false;
                    continue;
                }
            };
            if let Err(e) = self
                .ctx
                .cluster
                .update_node_metadata(&detail.cluster_id, &detail.name, patch, &MetadataPatch::new())
                .await
            {
                warn!(node = %detail.name, error = %e, "node label update failed");
                complete = false;
            }
        }
        complete
    }
}

#[async_trait]
impl StrategyExecutor for HierarchicalExecutor {
    async fn is_able_to_scale_down(
        &self,
        strategy: &NodeGroupMgrStrategy,
        _now: DateTime<Utc>,
    ) -> StrategyResult<ScaleDownCheck> {
        require_elastic_groups(strategy)?;
        Ok(ScaleDownCheck::none())
    }

    async fn is_able_to_scale_up(
        &self,
        strategy: &NodeGroupMgrStrategy,
        now: DateTime<Utc>,
    ) -> StrategyResult<ScaleUpCheck> {
        require_elastic_groups(strategy)?;

        let pool = self.ctx.pool_of(strategy).await?;
        let check = surplus_above_high(strategy, Occupancy::of(&pool), &pool, now);
        if !check.able {
            return Ok(check);
        }
        if self.ctx.check_if_task_executing(strategy, now)? {
            debug!(strategy = %strategy.name, "scale-up held back by drain task");
            return Ok(ScaleUpCheck::none());
        }
        Ok(check)
    }

    async fn handle_node_metadata(&self, now: DateTime<Utc>) -> StrategyResult<()> {
        let storage = &self.ctx.storage;
        let actions = storage.list_node_group_actions(&ListOptions::default())?;

        for mut action in actions
            .into_iter()
            .filter(|a| a.event == NodeGroupEventType::UpdateNodeMeta)
        {
            let strategy = storage.get_node_group_strategy(&action.strategy, &GetOptions::default())?;
            let labels = strategy.map(|s| s.strategy.node_labels).unwrap_or_default();
            let patch: MetadataPatch = labels.into_iter().map(|(k, v)| (k, Some(v))).collect();

            if !patch.is_empty() && !self.label_nodes(&action, &patch).await {
                continue;
            }

            action.process = 100;
            action.updated_time = now;
            storage.update_node_group_action(&action, &UpdateOptions::overwrite())?;
            storage.delete_node_group_action(
                &action.node_group_id,
                action.event,
                &DeleteOptions::default(),
            )?;
            info!(
                node_group = %action.node_group_id,
                nodes = action.node_ips.len(),
                "node metadata applied"
            );
        }
        Ok(())
    }

    async fn create_node_update_action(
        &self,
        strategy: &NodeGroupMgrStrategy,
        action: &NodeGroupAction,
        now: DateTime<Utc>,
    ) -> StrategyResult<()> {
        if action.event != NodeGroupEventType::Scaleup || strategy.strategy.node_labels.is_empty() {
            return Ok(());
        }
        let storage = &self.ctx.storage;
        let Some(group) = storage.get_node_group(&action.node_group_id, &GetOptions::default())?
        else {
            return Ok(());
        };

        let before: BTreeSet<&String> = action.node_ips.iter().collect();
        let mut joined: BTreeSet<String> = group
            .node_ips
            .iter()
            .filter(|ip| !before.contains(ip))
            .cloned()
            .collect();
        if joined.is_empty() {
            return Ok(());
        }

        let pending = storage.get_node_group_action(
            &group.node_group_id,
            NodeGroupEventType::UpdateNodeMeta,
            &GetOptions::default(),
        )?;
        let mut update = match pending {
            Some(existing) => {
                joined.extend(existing.node_ips.iter().cloned());
                existing
            }
            None => NodeGroupAction::new(&group, &strategy.name, NodeGroupEventType::UpdateNodeMeta, now),
        };
        update.strategy = strategy.name.clone();
        update.node_ips = joined.into_iter().collect();
        update.delta_num = update.node_ips.len() as i32;
        update.updated_time = now;
        storage.update_node_group_action(&update, &UpdateOptions::upsert())?;

        debug!(
            node_group = %group.node_group_id,
            nodes = update.node_ips.len(),
            "node metadata update queued"
        );
        Ok(())
    }
}
