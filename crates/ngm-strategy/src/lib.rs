//! ngm-strategy — policies deciding when a strategy moves capacity.
//!
//! A [`StrategyExecutor`] looks at the resource pool's occupancy and the
//! strategy's parameters and answers two questions: can capacity be
//! released to the reserved pool, and can elastic groups grow.
//!
//! ```text
//! idle      = init + idle + returned
//! total     = idle + consumed
//! ratio     = idle * 100 / total
//! reserved  = ceil(total * pct / 100)
//!
//! buffer        ratio < low   -> release reserved(low) - idle
//!               ratio > high  -> grow idle - reserved(high)
//!                                (pool stable for max_idle_delay,
//!                                 at least min_scale_up_size)
//! hierarchical  never releases; grows like buffer unless a drain task
//!               is running or about to start
//! ```
//!
//! Executors are built once into an [`ExecutorRegistry`] and looked up by
//! [`StrategyType`](ngm_state::StrategyType).

pub mod buffer;
pub mod error;
pub mod executor;
pub mod hierarchical;
pub mod time_mode;

#[cfg(test)]
mod testutil;

pub use buffer::BufferExecutor;
pub use error::{StrategyError, StrategyResult};
pub use executor::{
    DEFAULT_TASK_LOOKAHEAD, ExecutorContext, ExecutorRegistry, Occupancy, ScaleDownCheck,
    ScaleUpCheck, StrategyExecutor,
};
pub use hierarchical::HierarchicalExecutor;
