//! Balancer input and output records.

/// One node group taking part in an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceEntry {
    pub node_group_id: String,
    pub weight: u32,
    /// Most this group may receive. Ignored by the simple balancer.
    pub limitation: u32,
}

impl BalanceEntry {
    pub fn new(node_group_id: impl Into<String>, weight: u32, limitation: u32) -> Self {
        Self {
            node_group_id: node_group_id.into(),
            weight,
            limitation,
        }
    }
}

/// Share assigned to one node group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub node_group_id: String,
    pub num: u32,
}

/// Stable ascending sort by weight.
pub(crate) fn sorted_by_weight(mut entries: Vec<BalanceEntry>) -> Vec<BalanceEntry> {
    entries.sort_by_key(|e| e.weight);
    entries
}

/// Sum of allocated shares.
pub fn total(allocations: &[Allocation]) -> u32 {
    allocations.iter().map(|a| a.num).sum()
}
