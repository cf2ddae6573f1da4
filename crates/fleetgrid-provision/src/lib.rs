//! fleetgrid-provision: binds capacity claims to units of scalable groups.
//!
//! # Create
//!
//! ```text
//! resolve class ─▶ list + translate groups ─▶ filter compatible ─▶ pick first by name
//!       ─▶ replicas += 1 ─▶ poll for an unclaimed unit ─▶ label unit ─▶ bind claim
//! ```
//!
//! Every failure after the increment and before the bind annotation is
//! written rolls back: the unit (if found) is released and marked for
//! deletion, then the replica count is restored. A claim that already
//! carries a binding resumes from it without a second increment.
//!
//! # Delete
//!
//! Marks the unit for deletion first and only then decrements the
//! replica count, so the fleet manager removes the marked unit. A failed
//! decrement removes the mark again. Deleting a unit that is already
//! going away succeeds without writes.
//!
//! Create and Delete are serialized by one lock per provider. Collaborators
//! sit behind the [`GroupProvider`], [`UnitProvider`] and [`ClaimStore`]
//! traits so tests can inject faults.

pub mod cancel;
pub mod claims;
mod create;
mod delete;
pub mod error;
pub mod groups;
pub mod provider;
pub mod reservation;
pub mod status;
pub mod units;

use std::future::Future;
use std::pin::Pin;

pub use cancel::{Cancel, CancelHandle};
pub use claims::{ClaimStore, StoreClaimStore};
pub use error::{ProvisionError, ProvisionResult};
pub use groups::{GroupProvider, StoreGroupProvider};
pub use provider::{CapacityProvider, ClaimPool, ClusterApiProvider, PROVIDER_NAME, RepairPolicy};
pub use reservation::{PollConfig, Reservation, ReservationState};
pub use status::ReadinessReconciler;
pub use units::{StoreUnitProvider, UnitProvider, is_deleting};

/// Boxed future returned by the provider traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
