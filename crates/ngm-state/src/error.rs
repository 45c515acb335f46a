//! Store failures, split by the layer that raised them.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open node group store: {0}")]
    Open(String),

    #[error("redb transaction failed: {0}")]
    Transaction(String),

    #[error("redb table unavailable: {0}")]
    Table(String),

    #[error("redb read failed: {0}")]
    Read(String),

    #[error("redb write failed: {0}")]
    Write(String),

    /// A record could not be turned into JSON for storage or patching.
    #[error("cannot encode record: {0}")]
    Encode(String),

    /// Stored bytes no longer match the record layout.
    #[error("stored record is unreadable: {0}")]
    Decode(String),

    /// Missing or soft-deleted, when the caller asked for an error.
    #[error("{table} record {key:?} not found")]
    NotFound { table: String, key: String },

    /// A live record already holds the key.
    #[error("{table} record {key:?} already exists")]
    AlreadyExists { table: String, key: String },
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
