//! fleetgrid-store: object store for the fleetgrid capacity provider.
//!
//! Backed by [redb](https://docs.rs/redb), holds the four resource kinds the
//! provisioning engine reads and writes: scalable groups, units, claims and
//! capacity classes.
//!
//! # Architecture
//!
//! Every kind implements [`Object`] and lives in its own redb table, keyed by
//! `{namespace}/{name}` (cluster-scoped kinds use an empty namespace). Values
//! are JSON. Writes use optimistic concurrency: each object carries a
//! `resource_version`, and an update based on a stale version fails with
//! [`StoreError::Conflict`] instead of overwriting a concurrent change.
//!
//! The `ObjectStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod quantity;
pub mod selector;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use quantity::{Quantity, QuantityError, ResourceList};
pub use selector::{LabelSelector, SelectorOperator, SelectorRequirement};
pub use store::ObjectStore;
pub use types::*;
