//! Strategy executor error types.

use ngm_state::StrategyType;
use thiserror::Error;

/// Errors raised while evaluating a strategy.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("strategy {0} has no elastic node groups")]
    NoElasticNodeGroups(String),

    #[error("no executor registered for strategy type {0}")]
    UnsupportedType(StrategyType),

    #[error("invalid cron expression {expr:?}: {source}")]
    InvalidCron {
        expr: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("state store error: {0}")]
    State(#[from] ngm_state::StateError),

    #[error("collaborator error: {0}")]
    Client(#[from] ngm_cluster::ClientError),
}

pub type StrategyResult<T> = Result<T, StrategyError>;
