//! Rollout engine error types.

use fleet_core::FilterError;
use fleetgrid_state::{ActionId, ActionStatus, RolloutId, RolloutStatus, StateError};
use thiserror::Error;

/// Errors surfaced by rollout lifecycle operations.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rollout {rollout} cannot move from {from:?} to {to:?}")]
    InvalidStateTransition {
        rollout: RolloutId,
        from: RolloutStatus,
        to: RolloutStatus,
    },

    #[error("rollout {0} is still being created")]
    CreationInProgress(RolloutId),

    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("partitioning rollout {rollout} failed: {reason}")]
    PartitionFailure { rollout: RolloutId, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("target filter `{0}` matches no targets")]
    EmptyTargetFilter(String),

    #[error("invalid target filter: {0}")]
    Filter(#[from] FilterError),

    #[error("target selector error: {0}")]
    Selector(#[from] anyhow::Error),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl RolloutError {
    /// Map store errors, turning lost races into [`RolloutError::ConcurrentModification`].
    pub fn from_store(err: StateError) -> Self {
        if err.is_conflict() {
            Self::ConcurrentModification(err.to_string())
        } else {
            Self::State(err)
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Self::ConcurrentModification(_) => true,
            Self::State(err) => err.is_conflict(),
            _ => false,
        }
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;

/// Errors returned to the device-facing layer for status reports.
#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("action {0} not found")]
    NotFound(ActionId),

    #[error("action {action} is already closed ({status})")]
    Gone { action: ActionId, status: ActionStatus },

    #[error("not applicable: {0}")]
    NotApplicable(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type FeedbackResult<T> = Result<T, FeedbackError>;
