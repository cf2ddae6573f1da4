//! Provisioning error types.

use std::time::Duration;

use fleetgrid_capacity::CapacityError;
use fleetgrid_store::StoreError;
use thiserror::Error;

/// Errors returned by the provisioning engine and its providers.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A required field is missing or empty. Nothing was changed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The claim's unit no longer exists.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// No eligible group can take the claim right now.
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },

    #[error("no unclaimed unit found in group {group} within {waited:?}")]
    UnitNotDiscovered { group: String, waited: Duration },

    #[error("cancelled while {0}")]
    Cancelled(String),

    #[error("group {0} has no replica count and cannot be scaled")]
    UnmanagedGroup(String),

    #[error("group {0} is already at zero replicas")]
    ZeroReplicas(String),

    #[error("unit {unit}: group {group} does not declare {resource} capacity")]
    MissingCapacity {
        unit: String,
        group: String,
        resource: &'static str,
    },

    /// The unit exists but has not been assigned an identity yet.
    #[error("unit {0} has no provider id yet")]
    MissingProviderId(String),

    #[error("invalid unit binding {value:?}: expected namespace/name")]
    InvalidBinding { value: String },

    #[error("{context}: {source}")]
    Capacity {
        context: String,
        #[source]
        source: CapacityError,
    },

    /// Undoing a failed step failed too; the system needs attention.
    #[error("{primary}; cleanup also failed: {cleanup}")]
    CompensationFailed {
        primary: Box<ProvisionError>,
        cleanup: Box<ProvisionError>,
    },
}

impl ProvisionError {
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            context: context.into(),
            source,
        }
    }

    pub fn capacity(context: impl Into<String>, source: CapacityError) -> Self {
        Self::Capacity {
            context: context.into(),
            source,
        }
    }

    pub fn compensation_failed(primary: ProvisionError, cleanup: ProvisionError) -> Self {
        Self::CompensationFailed {
            primary: Box::new(primary),
            cleanup: Box::new(cleanup),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, Self::InsufficientCapacity(_))
    }

    /// True for optimistic-concurrency failures from the store.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store { source, .. } if source.is_conflict())
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
