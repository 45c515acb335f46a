//! Weighted-random balancer bounded by per-group limitations.

use rand::Rng;
use tracing::warn;

use crate::entry::{Allocation, BalanceEntry, sorted_by_weight};

/// Draw budget per requested unit before falling back to a deterministic fill.
const MAX_DRAWS_PER_UNIT: u64 = 8;

/// Randomised split where each group receives at most its `limitation`.
///
/// Heavier groups are drawn more often. Groups that hit their limitation
/// drop out of the ruler, so every draw assigns one unit.
#[derive(Debug, Clone)]
pub struct WeightBalancer {
    entries: Vec<BalanceEntry>,
}

impl WeightBalancer {
    pub fn new(entries: Vec<BalanceEntry>) -> Self {
        Self {
            entries: sorted_by_weight(entries),
        }
    }

    /// Sum of all limitations.
    pub fn capacity(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.limitation)).sum()
    }

    /// Split `n`, clamped to the total limitation, across the groups.
    ///
    /// Shares sum to exactly `min(n, Σlimitation)` and never exceed a
    /// group's limitation.
    pub fn distribute<R: Rng + ?Sized>(&self, n: u32, rng: &mut R) -> Vec<Allocation> {
        let mut parts = vec![0u32; self.entries.len()];
        let mut remaining = u64::from(n).min(self.capacity());

        let mut ruler = self.ruler(&parts);
        let mut draws = 0u64;
        let max_draws = remaining.saturating_mul(MAX_DRAWS_PER_UNIT);

        while remaining > 0 && draws < max_draws {
            draws += 1;
            let Some(&sum) = ruler.last() else { break };
            if sum == 0 {
                break;
            }
            let r = rng.gen_range(1..=sum);
            let idx = ruler.partition_point(|&c| c < r);
            let Some(entry) = self.entries.get(idx) else { break };
            if parts[idx] >= entry.limitation {
                continue;
            }
            parts[idx] += 1;
            remaining -= 1;
            if parts[idx] == entry.limitation {
                ruler = self.ruler(&parts);
            }
        }

        if remaining > 0 {
            warn!(
                remaining,
                draws, "weight balancer exhausted its draw budget, filling deterministically"
            );
            self.fill_remainder(&mut parts, remaining);
        }

        self.entries
            .iter()
            .zip(parts)
            .map(|(e, num)| Allocation {
                node_group_id: e.node_group_id.clone(),
                num,
            })
            .collect()
    }

    /// Cumulative weights over groups with spare limitation. Saturated
    /// groups contribute zero. If every open group weighs zero, they are
    /// treated as weight one.
    fn ruler(&self, parts: &[u32]) -> Vec<u64> {
        let open = |i: usize, e: &BalanceEntry| parts[i] < e.limitation;
        let weighted: u64 = self
            .entries
            .iter()
            .enumerate()
            .filter(|(i, e)| open(*i, e))
            .map(|(_, e)| u64::from(e.weight))
            .sum();

        let mut acc = 0u64;
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                if open(i, e) {
                    acc += if weighted == 0 { 1 } else { u64::from(e.weight) };
                }
                acc
            })
            .collect()
    }

    /// Hand out `remaining` in descending weight order, respecting limitations.
    fn fill_remainder(&self, parts: &mut [u32], mut remaining: u64) {
        for (idx, entry) in self.entries.iter().enumerate().rev() {
            if remaining == 0 {
                break;
            }
            let spare = u64::from(entry.limitation.saturating_sub(parts[idx]));
            let take = spare.min(remaining);
            parts[idx] += take as u32;
            remaining -= take;
        }
    }
}
