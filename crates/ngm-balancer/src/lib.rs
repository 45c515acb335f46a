//! ngm-balancer — split an integer scale delta across weighted node groups.
//!
//! Two stateless allocators, both operating on entries sorted ascending by
//! weight (ties keep their input order):
//!
//! ```text
//! SimpleBalancer   p_i = floor(n * w_i / Σw), remainder -> highest weight
//!                  Σp == n
//!
//! WeightBalancer   n' = min(n, Σlimitation)
//!                  draw r in [1, Σw] over groups with spare limitation,
//!                  binary-search the cumulative ruler, p_i += 1
//!                  p_i <= limitation_i, Σp == n'
//! ```
//!
//! The simple balancer is used for scale-up, where groups have no release
//! ceiling. The weight balancer is used for scale-down and for picking
//! which nodes to drain, where each group can only give up `limitation`.
//! Randomness is injected so callers can seed it.

pub mod entry;
pub mod simple;
pub mod weight;

pub use entry::{Allocation, BalanceEntry};
pub use simple::SimpleBalancer;
pub use weight::WeightBalancer;
