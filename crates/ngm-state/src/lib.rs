//! ngm-state — records and storage for the node group manager.
//!
//! Defines the persisted strategies, node groups, actions, audit events and
//! scale-down tasks, the [`Storage`] contract both control loops are written
//! against, and [`StateStore`], an implementation backed by
//! [redb](https://docs.rs/redb).
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{node_group_id}:{event}`) enable prefix scans over the
//! actions of one node group. Deletes never remove data; they set a
//! `deleted_time` tombstone that every read path checks.
//!
//! `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod options;
pub mod storage;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use options::{CreateOptions, DeleteOptions, GetOptions, ListOptions, UpdateOptions};
pub use storage::Storage;
pub use store::StateStore;
pub use types::*;
