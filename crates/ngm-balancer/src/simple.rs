//! Proportional balancer.

use crate::entry::{Allocation, BalanceEntry, sorted_by_weight};

/// Floor-proportional split with the remainder on the heaviest group.
#[derive(Debug, Clone)]
pub struct SimpleBalancer {
    entries: Vec<BalanceEntry>,
}

impl SimpleBalancer {
    pub fn new(entries: Vec<BalanceEntry>) -> Self {
        Self {
            entries: sorted_by_weight(entries),
        }
    }

    /// Split `n` across all groups. Shares always sum to exactly `n`.
    ///
    /// When every weight is zero the groups are treated as equal.
    pub fn distribute(&self, n: u32) -> Vec<Allocation> {
        if self.entries.is_empty() {
            return Vec::new();
        }

        let sum: u64 = self.entries.iter().map(|e| u64::from(e.weight)).sum();
        let weight_of = |e: &BalanceEntry| if sum == 0 { 1 } else { u64::from(e.weight) };
        let sum = if sum == 0 { self.entries.len() as u64 } else { sum };

        let mut allocations: Vec<Allocation> = self
            .entries
            .iter()
            .map(|e| Allocation {
                node_group_id: e.node_group_id.clone(),
                num: (u64::from(n) * weight_of(e) / sum) as u32,
            })
            .collect();

        let assigned: u32 = allocations.iter().map(|a| a.num).sum();
        if let Some(last) = allocations.last_mut() {
            last.num += n - assigned;
        }
        allocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::total;

    fn balancer(weights: &[u32]) -> SimpleBalancer {
        SimpleBalancer::new(
            weights
                .iter()
                .enumerate()
                .map(|(i, w)| BalanceEntry::new(format!("ng-{i}"), *w, 0))
                .collect(),
        )
    }

    fn nums(allocations: &[Allocation]) -> Vec<u32> {
        allocations.iter().map(|a| a.num).collect()
    }

    #[test]
    fn equal_weights_put_remainder_on_last() {
        let out = balancer(&[10, 10, 10]).distribute(20);
        assert_eq!(nums(&out), vec![6, 6, 8]);
        assert_eq!(out[2].node_group_id, "ng-2");
    }

    #[test]
    fn heaviest_group_absorbs_remainder() {
        let out = balancer(&[9, 1, 1]).distribute(20);
        assert_eq!(nums(&out), vec![1, 1, 18]);
        assert_eq!(out[2].node_group_id, "ng-0");
    }

    #[test]
    fn ties_keep_input_order() {
        let out = balancer(&[5, 1, 5]).distribute(11);
        let ids: Vec<_> = out.iter().map(|a| a.node_group_id.as_str()).collect();
        assert_eq!(ids, vec!["ng-1", "ng-0", "ng-2"]);
    }

    #[test]
    fn zero_weights_split_evenly() {
        let out = balancer(&[0, 0]).distribute(5);
        assert_eq!(nums(&out), vec![2, 3]);
    }

    #[test]
    fn shares_always_sum_to_request() {
        for weights in [&[1u32][..], &[3, 7], &[2, 2, 2, 9], &[100, 1, 50]] {
            let b = balancer(weights);
            for n in 0..50 {
                assert_eq!(total(&b.distribute(n)), n, "weights {weights:?} n {n}");
            }
        }
    }

    #[test]
    fn empty_balancer_allocates_nothing() {
        assert!(balancer(&[]).distribute(10).is_empty());
    }
}
