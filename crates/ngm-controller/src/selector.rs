//! NodeSelector — classify cluster nodes into drain tiers and pick the
//! nodes a task will drain.
//!
//! A node is a candidate for a task targeting `T` hours when it is Ready,
//! belongs to the strategy's resource pool, and is not claimed by another
//! task. Unlabeled nodes and nodes already labeled `T` form the exact tier.
//! Nodes labeled with a shorter delay form backup tiers, consumed longest
//! delay first once the exact tier runs out.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use ngm_balancer::{BalanceEntry, WeightBalancer};
use ngm_cluster::{ClusterClient, NodeLabels, Node, ResourceManager};
use ngm_state::{NodeGroupMgrStrategy, ScaleDownDetail, ScaleDownTask, parse_drain_delay};

use crate::error::{ControllerError, ControllerResult};

/// Where a node stands for a given task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTier {
    Excluded,
    Exact,
    /// Already committed to a shorter drain of this many hours.
    Backup(u32),
}

/// Classify `node` for the task `task_id` draining after `target_hours`.
pub fn is_optional_for_scale_down(
    node: &Node,
    labels: &NodeLabels,
    task_id: &str,
    target_hours: u32,
) -> NodeTier {
    if !node.ready {
        return NodeTier::Excluded;
    }
    if let Some(owner) = node.label(&labels.task)
        && !owner.is_empty()
        && owner != task_id
    {
        return NodeTier::Excluded;
    }
    match node.label(&labels.drain_delay) {
        None | Some("") => NodeTier::Exact,
        Some(delay) => match parse_drain_delay(delay) {
            Some(hours) if hours == target_hours => NodeTier::Exact,
            Some(hours) if hours < target_hours => NodeTier::Backup(hours),
            _ => NodeTier::Excluded,
        },
    }
}

/// Candidate IPs per node group, split by tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeTiers {
    pub exact: BTreeMap<String, Vec<String>>,
    /// Keyed by the delay, in hours, the nodes are already labeled with.
    pub backup: BTreeMap<u32, BTreeMap<String, Vec<String>>>,
}

impl NodeTiers {
    fn insert(&mut self, tier: NodeTier, node_group_id: &str, ip: String) {
        let bucket = match tier {
            NodeTier::Exact => &mut self.exact,
            NodeTier::Backup(hours) => self.backup.entry(hours).or_default(),
            NodeTier::Excluded => return,
        };
        bucket.entry(node_group_id.to_string()).or_default().push(ip);
    }

    /// Exact tier, then backup tiers by descending delay.
    pub fn in_priority_order(&self) -> impl Iterator<Item = &BTreeMap<String, Vec<String>>> {
        std::iter::once(&self.exact).chain(self.backup.values().rev())
    }
}

/// Reads candidate nodes from the cluster and the resource broker.
#[derive(Clone)]
pub struct NodeSelector {
    cluster: Arc<dyn ClusterClient>,
    resource_manager: Arc<dyn ResourceManager>,
    labels: NodeLabels,
}

impl NodeSelector {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        resource_manager: Arc<dyn ResourceManager>,
        labels: NodeLabels,
    ) -> Self {
        Self {
            cluster,
            resource_manager,
            labels,
        }
    }

    async fn pool_ips(&self, strategy: &NodeGroupMgrStrategy) -> ControllerResult<Vec<(String, String)>> {
        Ok(self
            .resource_manager
            .get_device_list_by_pool_id(&strategy.resource_pool)
            .await?
            .into_iter()
            .map(|d| (d.device_id, d.ip))
            .collect())
    }

    async fn group_nodes(
        &self,
        cluster_id: &str,
        node_group_id: &str,
    ) -> ControllerResult<BTreeMap<String, Node>> {
        let selector = BTreeMap::from([(self.labels.node_group.clone(), node_group_id.to_string())]);
        Ok(self.cluster.list_nodes_by_label(cluster_id, &selector).await?)
    }

    /// Tier every pool node of the strategy's elastic groups for `task`.
    pub async fn filter_available_nodes(
        &self,
        strategy: &NodeGroupMgrStrategy,
        task: &ScaleDownTask,
    ) -> ControllerResult<NodeTiers> {
        let target = parse_drain_delay(&task.drain_delay).ok_or_else(|| ControllerError::InvalidTask {
            task_id: task.task_id.clone(),
            reason: format!("unparsable drain delay {:?}", task.drain_delay),
        })?;
        let allowed: HashSet<String> = self.pool_ips(strategy).await?.into_iter().map(|(_, ip)| ip).collect();

        let mut tiers = NodeTiers::default();
        for elastic in &strategy.elastic_node_groups {
            let nodes = self
                .group_nodes(&elastic.cluster_id, &elastic.node_group_id)
                .await?;
            for node in nodes.values().filter(|n| allowed.contains(&n.ip)) {
                let tier = is_optional_for_scale_down(node, &self.labels, &task.task_id, target);
                tiers.insert(tier, &elastic.node_group_id, node.ip.clone());
            }
        }
        debug!(
            task_id = %task.task_id,
            exact = tiers.exact.values().map(Vec::len).sum::<usize>(),
            backup_tiers = tiers.backup.len(),
            "nodes tiered"
        );
        Ok(tiers)
    }

    /// Resolve an explicit device list onto the elastic groups. Entries
    /// are device ids of the pool or plain IPs.
    pub async fn map_device_list(
        &self,
        strategy: &NodeGroupMgrStrategy,
        device_list: &[String],
    ) -> ControllerResult<Vec<ScaleDownDetail>> {
        let pool = self.pool_ips(strategy).await?;
        let mut wanted: BTreeSet<String> = device_list
            .iter()
            .map(|entry| {
                pool.iter()
                    .find(|(device_id, _)| device_id == entry)
                    .map(|(_, ip)| ip.clone())
                    .unwrap_or_else(|| entry.clone())
            })
            .collect();

        let mut details = Vec::new();
        for elastic in &strategy.elastic_node_groups {
            let nodes = self
                .group_nodes(&elastic.cluster_id, &elastic.node_group_id)
                .await?;
            let ips: Vec<String> = nodes
                .values()
                .filter(|n| wanted.remove(&n.ip))
                .map(|n| n.ip.clone())
                .collect();
            if !ips.is_empty() {
                details.push(detail(elastic, ips));
            }
        }
        if !wanted.is_empty() {
            warn!(
                strategy = %strategy.name,
                unmatched = wanted.len(),
                "devices not found in any elastic node group"
            );
        }
        Ok(details)
    }
}

fn detail(elastic: &ngm_state::ElasticNodeGroup, mut ips: Vec<String>) -> ScaleDownDetail {
    ips.sort();
    ScaleDownDetail {
        cluster_id: elastic.cluster_id.clone(),
        node_group_id: elastic.node_group_id.clone(),
        consumer_id: elastic.consumer_id.clone(),
        node_num: ips.len() as u32,
        node_ips: ips,
    }
}

/// Pick `task.total_num` nodes tier by tier, weighting groups by their
/// strategy weight. Candidates the task already holds are kept before
/// the balancer tops the selection up from the rest.
pub fn allocate<R: Rng + ?Sized>(
    strategy: &NodeGroupMgrStrategy,
    task: &ScaleDownTask,
    tiers: &NodeTiers,
    rng: &mut R,
) -> Vec<ScaleDownDetail> {
    let held: HashSet<String> = task.selected_ips().into_iter().collect();
    let mut remaining = task.total_num;
    let mut chosen: BTreeMap<&str, Vec<String>> = BTreeMap::new();

    // ── Held survivors ──
    'held: for tier in tiers.in_priority_order() {
        for elastic in &strategy.elastic_node_groups {
            let Some(ips) = tier.get(&elastic.node_group_id) else {
                continue;
            };
            for ip in ips.iter().filter(|ip| held.contains(*ip)) {
                if remaining == 0 {
                    break 'held;
                }
                chosen
                    .entry(elastic.node_group_id.as_str())
                    .or_default()
                    .push(ip.clone());
                remaining -= 1;
            }
        }
    }

    // ── Top up ──
    for tier in tiers.in_priority_order() {
        if remaining == 0 {
            break;
        }
        let free: BTreeMap<&str, Vec<&String>> = strategy
            .elastic_node_groups
            .iter()
            .filter_map(|e| {
                let ips = tier.get(&e.node_group_id)?;
                let mut free: Vec<&String> = ips.iter().filter(|ip| !held.contains(*ip)).collect();
                free.sort();
                Some((e.node_group_id.as_str(), free))
            })
            .collect();
        let entries: Vec<BalanceEntry> = strategy
            .elastic_node_groups
            .iter()
            .filter_map(|e| {
                let ips = free.get(e.node_group_id.as_str())?;
                Some(BalanceEntry::new(e.node_group_id.clone(), e.weight, ips.len() as u32))
            })
            .collect();

        for allocation in WeightBalancer::new(entries).distribute(remaining, rng) {
            let Some((group, ips)) = free.get_key_value(allocation.node_group_id.as_str()) else {
                continue;
            };
            let picked: Vec<String> = ips
                .iter()
                .take(allocation.num as usize)
                .map(|ip| (*ip).clone())
                .collect();
            remaining = remaining.saturating_sub(picked.len() as u32);
            chosen.entry(*group).or_default().extend(picked);
        }
    }

    if remaining > 0 {
        warn!(
            task_id = %task.task_id,
            wanted = task.total_num,
            missing = remaining,
            "not enough candidate nodes"
        );
    }

    strategy
        .elastic_node_groups
        .iter()
        .filter_map(|e| {
            let ips = chosen.remove(e.node_group_id.as_str())?;
            (!ips.is_empty()).then(|| detail(e, ips))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ngm_cluster::{Device, MemoryCluster, MemoryResourceManager};
    use ngm_state::{ElasticNodeGroup, TaskStatus};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn labels() -> NodeLabels {
        NodeLabels::default()
    }

    fn node(ip: &str, group: &str, extra: &[(&str, &str)]) -> Node {
        let l = labels();
        let mut node_labels = BTreeMap::from([(l.node_group, group.to_string())]);
        for (k, v) in extra {
            node_labels.insert(k.to_string(), v.to_string());
        }
        Node {
            name: format!("node-{ip}"),
            ip: ip.to_string(),
            labels: node_labels,
            annotations: BTreeMap::new(),
            ready: true,
        }
    }

    fn strategy() -> NodeGroupMgrStrategy {
        NodeGroupMgrStrategy {
            name: "s".into(),
            resource_pool: "pool-1".into(),
            elastic_node_groups: ["ng-a", "ng-b"]
                .iter()
                .map(|id| ElasticNodeGroup {
                    cluster_id: "c-1".into(),
                    node_group_id: id.to_string(),
                    weight: 1,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn task(total: u32, delay: &str) -> ScaleDownTask {
        let now = Utc::now();
        ScaleDownTask {
            task_id: "t-1".into(),
            total_num: total,
            node_group_strategy: "s".into(),
            scale_down_groups: vec![],
            drain_delay: delay.into(),
            deadline: now,
            begin_execute_time: now,
            specify_scale_down: false,
            device_list: vec![],
            status: TaskStatus::Requesting,
            is_executed: false,
            created_time: now,
            updated_time: now,
            deleted_time: None,
        }
    }

    #[test]
    fn classification_rules() {
        let l = labels();
        let task_key = l.task.as_str();
        let delay_key = l.drain_delay.as_str();

        let plain = node("10.0.0.1", "ng-a", &[]);
        assert_eq!(is_optional_for_scale_down(&plain, &l, "t-1", 72), NodeTier::Exact);

        let mut down = plain.clone();
        down.ready = false;
        assert_eq!(is_optional_for_scale_down(&down, &l, "t-1", 72), NodeTier::Excluded);

        let other = node("10.0.0.2", "ng-a", &[(task_key, "t-2"), (delay_key, "72h")]);
        assert_eq!(is_optional_for_scale_down(&other, &l, "t-1", 72), NodeTier::Excluded);

        let same = node("10.0.0.3", "ng-a", &[(task_key, "t-1"), (delay_key, "72h")]);
        assert_eq!(is_optional_for_scale_down(&same, &l, "t-1", 72), NodeTier::Exact);

        let shorter = node("10.0.0.4", "ng-a", &[(delay_key, "8h")]);
        assert_eq!(is_optional_for_scale_down(&shorter, &l, "t-1", 72), NodeTier::Backup(8));

        let longer = node("10.0.0.5", "ng-a", &[(delay_key, "96h")]);
        assert_eq!(is_optional_for_scale_down(&longer, &l, "t-1", 72), NodeTier::Excluded);

        let junk = node("10.0.0.6", "ng-a", &[(delay_key, "soon")]);
        assert_eq!(is_optional_for_scale_down(&junk, &l, "t-1", 72), NodeTier::Excluded);
    }

    #[test]
    fn one_node_per_group_for_two_node_task() {
        let mut tiers = NodeTiers::default();
        tiers.insert(NodeTier::Exact, "ng-a", "10.0.0.1".into());
        tiers.insert(NodeTier::Exact, "ng-b", "10.0.1.1".into());

        let mut rng = StdRng::seed_from_u64(5);
        let details = allocate(&strategy(), &task(2, "72h"), &tiers, &mut rng);

        assert_eq!(details.len(), 2);
        assert!(details.iter().all(|d| d.node_num == 1));
        assert_eq!(details.iter().map(|d| d.node_num).sum::<u32>(), 2);
    }

    #[test]
    fn backup_tiers_used_longest_delay_first() {
        let mut tiers = NodeTiers::default();
        tiers.insert(NodeTier::Exact, "ng-a", "10.0.0.1".into());
        tiers.insert(NodeTier::Backup(8), "ng-a", "10.0.0.8".into());
        tiers.insert(NodeTier::Backup(24), "ng-b", "10.0.1.24".into());

        let mut rng = StdRng::seed_from_u64(1);
        let details = allocate(&strategy(), &task(2, "72h"), &tiers, &mut rng);
        let ips: Vec<_> = details.iter().flat_map(|d| d.node_ips.clone()).collect();
        assert_eq!(ips, vec!["10.0.0.1".to_string(), "10.0.1.24".to_string()]);
    }

    #[test]
    fn previously_held_nodes_are_kept() {
        let mut tiers = NodeTiers::default();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            tiers.insert(NodeTier::Exact, "ng-a", ip.into());
        }
        let mut t = task(1, "72h");
        t.scale_down_groups = vec![ScaleDownDetail {
            node_group_id: "ng-a".into(),
            node_num: 1,
            node_ips: vec!["10.0.0.3".into()],
            ..Default::default()
        }];

        let mut rng = StdRng::seed_from_u64(9);
        let details = allocate(&strategy(), &t, &tiers, &mut rng);
        assert_eq!(details[0].node_ips, vec!["10.0.0.3".to_string()]);
    }

    #[test]
    fn held_survivors_kept_for_every_seed() {
        let mut tiers = NodeTiers::default();
        for i in 1..=3 {
            tiers.insert(NodeTier::Exact, "ng-a", format!("10.0.0.{i}"));
            tiers.insert(NodeTier::Exact, "ng-b", format!("10.0.1.{i}"));
        }
        let mut t = task(3, "72h");
        t.scale_down_groups = vec![ScaleDownDetail {
            node_group_id: "ng-a".into(),
            node_num: 2,
            node_ips: vec!["10.0.0.1".into(), "10.0.0.2".into()],
            ..Default::default()
        }];

        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let details = allocate(&strategy(), &t, &tiers, &mut rng);
            let ips: HashSet<String> = details.iter().flat_map(|d| d.node_ips.clone()).collect();
            assert_eq!(ips.len(), 3, "seed {seed}");
            assert!(ips.contains("10.0.0.1"), "seed {seed}");
            assert!(ips.contains("10.0.0.2"), "seed {seed}");
        }
    }

    #[test]
    fn held_beyond_total_trimmed_in_priority_order() {
        let mut tiers = NodeTiers::default();
        tiers.insert(NodeTier::Exact, "ng-a", "10.0.0.1".into());
        tiers.insert(NodeTier::Backup(8), "ng-b", "10.0.1.8".into());
        let mut t = task(1, "72h");
        t.scale_down_groups = vec![
            ScaleDownDetail {
                node_group_id: "ng-a".into(),
                node_num: 1,
                node_ips: vec!["10.0.0.1".into()],
                ..Default::default()
            },
            ScaleDownDetail {
                node_group_id: "ng-b".into(),
                node_num: 1,
                node_ips: vec!["10.0.1.8".into()],
                ..Default::default()
            },
        ];

        let mut rng = StdRng::seed_from_u64(3);
        let details = allocate(&strategy(), &t, &tiers, &mut rng);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].node_ips, vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn short_supply_selects_what_exists() {
        let mut tiers = NodeTiers::default();
        tiers.insert(NodeTier::Exact, "ng-b", "10.0.1.1".into());
        let mut rng = StdRng::seed_from_u64(2);
        let details = allocate(&strategy(), &task(3, "72h"), &tiers, &mut rng);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].node_group_id, "ng-b");
    }

    async fn selector_with_nodes(nodes: Vec<Node>, pool_ips: &[&str]) -> NodeSelector {
        let cluster = Arc::new(MemoryCluster::default());
        for n in nodes {
            cluster.add_node("c-1", n).await;
        }
        let broker = Arc::new(MemoryResourceManager::new());
        for (i, ip) in pool_ips.iter().enumerate() {
            broker
                .add_device(Device {
                    device_id: format!("dev-{i}"),
                    ip: ip.to_string(),
                    pool_id: "pool-1".into(),
                    ..Default::default()
                })
                .await;
        }
        NodeSelector::new(cluster, broker, labels())
    }

    #[tokio::test]
    async fn filter_skips_nodes_outside_the_pool() {
        let delay_key = labels().drain_delay;
        let selector = selector_with_nodes(
            vec![
                node("10.0.0.1", "ng-a", &[]),
                node("10.0.0.2", "ng-a", &[]),
                node("10.0.1.1", "ng-b", &[(delay_key.as_str(), "8h")]),
            ],
            &["10.0.0.1", "10.0.1.1"],
        )
        .await;

        let tiers = selector
            .filter_available_nodes(&strategy(), &task(2, "72h"))
            .await
            .unwrap();
        assert_eq!(tiers.exact.get("ng-a"), Some(&vec!["10.0.0.1".to_string()]));
        assert_eq!(
            tiers.backup.get(&8).and_then(|t| t.get("ng-b")),
            Some(&vec!["10.0.1.1".to_string()])
        );
    }

    #[tokio::test]
    async fn invalid_drain_delay_is_rejected() {
        let selector = selector_with_nodes(vec![], &[]).await;
        let err = selector
            .filter_available_nodes(&strategy(), &task(1, "three days"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidTask { .. }));
    }

    #[tokio::test]
    async fn device_list_maps_ids_and_ips_onto_groups() {
        let selector = selector_with_nodes(
            vec![node("10.0.0.1", "ng-a", &[]), node("10.0.1.1", "ng-b", &[])],
            &["10.0.0.1"],
        )
        .await;

        let details = selector
            .map_device_list(&strategy(), &["dev-0".to_string(), "10.0.1.1".to_string()])
            .await
            .unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].node_ips, vec!["10.0.0.1".to_string()]);
        assert_eq!(details[1].node_ips, vec!["10.0.1.1".to_string()]);
    }
}
