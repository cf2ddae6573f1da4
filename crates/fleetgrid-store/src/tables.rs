//! redb table definitions for the fleetgrid object store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized objects).
//! Keys follow the pattern `{namespace}/{name}`.

use redb::TableDefinition;

/// Scalable groups keyed by `{namespace}/{name}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("scalable_groups");

/// Units keyed by `{namespace}/{name}`.
pub const UNITS: TableDefinition<&str, &[u8]> = TableDefinition::new("units");

/// Claims keyed by `/{name}` (cluster-scoped).
pub const CLAIMS: TableDefinition<&str, &[u8]> = TableDefinition::new("claims");

/// Capacity classes keyed by `/{name}` (cluster-scoped).
pub const CLASSES: TableDefinition<&str, &[u8]> = TableDefinition::new("capacity_classes");
