//! Error types for the fleetgrid state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict on {entity}: expected {expected}, found {found}")]
    VersionConflict {
        entity: String,
        expected: u64,
        found: u64,
    },

    #[error("target {0} already has an active action")]
    ActiveActionExists(String),

    #[error("action {0} is already closed")]
    ActionClosed(u64),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("membership slot already taken: {0}")]
    SlotTaken(String),
}

impl StateError {
    /// Errors caused by a concurrent writer getting there first.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. }
                | Self::ActiveActionExists(_)
                | Self::ActionClosed(_)
                | Self::SlotTaken(_)
        )
    }
}
