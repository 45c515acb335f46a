//! ngm-cluster — the node group manager's view of the outside world.
//!
//! Two ports sit here: [`ClusterClient`] reads nodes and patches their
//! labels, and [`ResourceManager`] exposes the resource broker's pool
//! occupancy, device lists and drain tasks. Both are object-safe async
//! traits so the control loops can hold them as `Arc<dyn _>`.
//!
//! [`MemoryCluster`] and [`MemoryResourceManager`] implement the ports over
//! in-process maps for tests and the daemon's fixture mode.

pub mod client;
pub mod error;
pub mod labels;
pub mod memory;
pub mod types;

pub use client::{ClusterClient, ResourceManager};
pub use error::{ClientError, ClientResult};
pub use labels::NodeLabels;
pub use memory::{MemoryCluster, MemoryResourceManager};
pub use types::*;
