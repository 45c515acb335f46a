//! Controller error types.

use thiserror::Error;

/// Errors raised by the control loops.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("invalid task {task_id}: {reason}")]
    InvalidTask { task_id: String, reason: String },

    #[error("state store error: {0}")]
    State(#[from] ngm_state::StateError),

    #[error("collaborator error: {0}")]
    Client(#[from] ngm_cluster::ClientError),

    #[error("strategy error: {0}")]
    Strategy(#[from] ngm_strategy::StrategyError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
