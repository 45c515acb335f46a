//! ngm-controller — the two control loops of the node group manager.
//!
//! [`StrategyReconciler`] keeps elastic node groups sized against their
//! reserved resource pool. [`TaskScheduler`] turns external drain requests
//! into node selections, labels and, once due, lowered desired sizes.
//!
//! Both loops are driven by `tick_at(now)` and share nothing but the
//! [`Storage`](ngm_state::Storage) they write to:
//!
//! ```text
//!            ┌────────────────────┐      ┌───────────────────┐
//!  pool ───▶ │ StrategyReconciler │      │   TaskScheduler   │ ◀─── tasks
//!            └─────────┬──────────┘      └─────────┬─────────┘
//!                      │ desired size, actions     │ labels, actions
//!                      ▼                           ▼
//!                 ┌──────────────────────────────────────┐
//!                 │               Storage                │
//!                 └──────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod nodegroup;
pub mod pool;
pub mod selector;
pub mod task;
mod tick;

pub use config::{ControllerConfig, TaskSchedulerConfig};
pub use error::{ControllerError, ControllerResult};
pub use nodegroup::{StrategyReconciler, StrategyReconcilerBuilder};
pub use pool::WorkerPool;
pub use selector::{NodeSelector, NodeTier, NodeTiers, allocate, is_optional_for_scale_down};
pub use task::{TaskScheduler, TaskSchedulerBuilder};
pub use tick::TickReport;
