//! ObjectStore: redb-backed persistence for fleetgrid objects.
//!
//! Provides typed get/list/create/update/delete over every [`Object`] kind.
//! All values are JSON-serialized into redb's `&[u8]` value columns. Updates
//! are compare-and-swap on `resource_version`, checked and written inside one
//! write transaction. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::selector::LabelSelector;
use crate::types::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe object store backed by redb.
#[derive(Clone, Debug)]
pub struct ObjectStore {
    db: Arc<Database>,
}

impl ObjectStore {
    /// Open (or create) a persistent object store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "object store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory object store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory object store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ScalableGroup::TABLE).map_err(map_err!(Table))?;
        txn.open_table(Unit::TABLE).map_err(map_err!(Table))?;
        txn.open_table(Claim::TABLE).map_err(map_err!(Table))?;
        txn.open_table(CapacityClass::TABLE).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an object by namespace and name.
    pub fn get<T: Object>(&self, namespace: &str, name: &str) -> StoreResult<T> {
        let key = object_key(namespace, name);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(StoreError::NotFound { kind: T::KIND, key }),
        }
    }

    /// List objects of one kind in key order, optionally filtered by a
    /// label selector. `None` returns every object.
    pub fn list<T: Object>(&self, selector: Option<&LabelSelector>) -> StoreResult<Vec<T>> {
        if let Some(selector) = selector {
            selector.validate()?;
        }
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let object: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if selector.is_none_or(|s| s.matches(&object.meta().labels)) {
                results.push(object);
            }
        }
        Ok(results)
    }

    /// Insert a new object. Sets its `resource_version` to 1.
    pub fn create<T: Object>(&self, object: &mut T) -> StoreResult<()> {
        let key = object.meta().table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StoreError::AlreadyExists { kind: T::KIND, key });
            }
            let mut stored = object.clone();
            stored.meta_mut().resource_version = 1;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        object.meta_mut().resource_version = 1;
        debug!(kind = T::KIND, %key, "object created");
        Ok(())
    }

    /// Replace an existing object.
    ///
    /// Fails with [`StoreError::Conflict`] if the stored object has changed
    /// since `object` was read. On success the caller's copy carries the new
    /// `resource_version`.
    pub fn update<T: Object>(&self, object: &mut T) -> StoreResult<()> {
        let key = object.meta().table_key();
        let attempted = object.meta().resource_version;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
            let stored = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let current: T =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    current.meta().resource_version
                }
                None => return Err(StoreError::NotFound { kind: T::KIND, key }),
            };
            if stored != attempted {
                return Err(StoreError::Conflict {
                    kind: T::KIND,
                    key,
                    stored,
                    attempted,
                });
            }

            next = stored + 1;
            let mut updated = object.clone();
            updated.meta_mut().resource_version = next;
            let value = serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        object.meta_mut().resource_version = next;
        debug!(kind = T::KIND, %key, version = next, "object updated");
        Ok(())
    }

    /// Delete an object by namespace and name. Returns true if it existed.
    pub fn delete<T: Object>(&self, namespace: &str, name: &str) -> StoreResult<bool> {
        let key = object_key(namespace, name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = T::KIND, %key, existed, "object deleted");
        Ok(existed)
    }
}
