//! Error types for the fleetgrid object store.

use thiserror::Error;

/// Result type alias for object store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during object store operations.
#[derive(Debug, Error)]
pub enum StoreError {
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

    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// The object changed since the caller read it.
    #[error("conflict writing {kind} {key}: stored version is {stored}, update was based on {attempted}")]
    Conflict {
        kind: &'static str,
        key: String,
        stored: u64,
        attempted: u64,
    },

    #[error("invalid label selector: {0}")]
    InvalidSelector(String),
}

impl StoreError {
    /// True when the requested object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for optimistic-concurrency failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
