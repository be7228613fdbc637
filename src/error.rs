//! Weft error types

use thiserror::Error;

use crate::bus::BusError;
use crate::channel::ChannelError;
use crate::predicate::PredicateError;
use crate::protocol::TaskId;
use crate::store::StoreError;

/// Errors that can occur in the orchestration core
#[derive(Debug, Error)]
pub enum WeftError {
    /// A keyed record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A write carried a stale version
    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// A task reached a terminal failure
    #[error("Task {task_id} failed: {reason}")]
    TaskFailure { task_id: TaskId, reason: String },

    /// Nobody is subscribed at the message's address
    #[error("Recipient unknown: {0}")]
    RecipientUnknown(String),

    /// The durable backend is gone and a strict operation refused to proceed
    #[error("Degraded mode: {0}")]
    DegradedMode(String),

    /// Illegal status move
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// Definition rejected at submission
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// A supervisor lost a write race twice on its own workflow record
    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Backend failure that could not be absorbed by the fallback
    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Predicate error: {0}")]
    Predicate(#[from] PredicateError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl WeftError {
    /// True for optimistic-concurrency conflicts, which callers may retry
    /// after re-reading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, WeftError::VersionConflict { .. })
    }
}

impl From<StoreError> for WeftError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict {
                key,
                expected,
                actual,
            } => WeftError::VersionConflict {
                key,
                expected,
                actual,
            },
            other => WeftError::Store(other.to_string()),
        }
    }
}

impl From<BusError> for WeftError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::RecipientUnknown(address) => WeftError::RecipientUnknown(address),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = WeftError> = std::result::Result<T, E>;
