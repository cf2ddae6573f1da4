//! Capacity translation error types.

use fleetgrid_store::QuantityError;
use thiserror::Error;

/// Errors raised while translating group metadata or claim requirements.
#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("annotation {annotation} has an invalid quantity: {source}")]
    Quantity {
        annotation: &'static str,
        #[source]
        source: QuantityError,
    },

    #[error("requirement on {key:?} is invalid: {reason}")]
    InvalidRequirement { key: String, reason: String },
}

pub type CapacityResult<T> = Result<T, CapacityError>;
