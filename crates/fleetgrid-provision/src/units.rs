//! Unit provider: observes and annotates units.
//!
//! Units are created and destroyed by the external fleet manager. This
//! provider only reads them, labels them as claimed, and marks them for
//! deletion.

use fleetgrid_store::{
    DELETE_UNIT_ANNOTATION, LabelSelector, ObjectStore, StoreError, Unit, epoch_secs,
};
use tracing::debug;

use crate::BoxFuture;
use crate::error::{ProvisionError, ProvisionResult};

/// True if removal of the unit has begun. `None` is never deleting.
pub fn is_deleting(unit: Option<&Unit>) -> bool {
    unit.is_some_and(|u| u.meta.deletion_timestamp.is_some_and(|ts| ts != 0))
}

/// Access to units. Injected for testability.
///
/// Lookups return `Ok(None)` for a missing unit; callers decide what
/// absence means.
pub trait UnitProvider: Send + Sync {
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, ProvisionResult<Option<Unit>>>;

    /// Find the unit carrying `provider_id`. Scans every unit.
    fn get_by_provider_id<'a>(
        &'a self,
        provider_id: &'a str,
    ) -> BoxFuture<'a, ProvisionResult<Option<Unit>>>;

    fn list<'a>(
        &'a self,
        selector: Option<&'a LabelSelector>,
    ) -> BoxFuture<'a, ProvisionResult<Vec<Unit>>>;

    fn update<'a>(&'a self, unit: &'a mut Unit) -> BoxFuture<'a, ProvisionResult<()>>;

    /// Mark the unit for deletion. Returns whether a write happened: an
    /// already-marked unit keeps its existing value and is not written.
    fn add_delete_annotation<'a>(&'a self, unit: &'a mut Unit) -> BoxFuture<'a, ProvisionResult<bool>> {
        Box::pin(async move {
            if unit.meta.annotations.contains_key(DELETE_UNIT_ANNOTATION) {
                return Ok(false);
            }
            unit.meta
                .annotations
                .insert(DELETE_UNIT_ANNOTATION.to_string(), epoch_secs().to_string());
            if let Err(e) = self.update(unit).await {
                unit.meta.annotations.remove(DELETE_UNIT_ANNOTATION);
                return Err(e);
            }
            Ok(true)
        })
    }

    /// Clear the deletion mark. Returns whether a write happened.
    fn remove_delete_annotation<'a>(
        &'a self,
        unit: &'a mut Unit,
    ) -> BoxFuture<'a, ProvisionResult<bool>> {
        Box::pin(async move {
            let Some(previous) = unit.meta.annotations.remove(DELETE_UNIT_ANNOTATION) else {
                return Ok(false);
            };
            if let Err(e) = self.update(unit).await {
                unit.meta
                    .annotations
                    .insert(DELETE_UNIT_ANNOTATION.to_string(), previous);
                return Err(e);
            }
            Ok(true)
        })
    }
}

/// [`UnitProvider`] backed by the object store.
#[derive(Clone)]
pub struct StoreUnitProvider {
    store: ObjectStore,
}

impl StoreUnitProvider {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }
}

impl UnitProvider for StoreUnitProvider {
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, ProvisionResult<Option<Unit>>> {
        Box::pin(async move {
            match self.store.get(namespace, name) {
                Ok(unit) => Ok(Some(unit)),
                Err(StoreError::NotFound { .. }) => Ok(None),
                Err(e) => Err(ProvisionError::store(
                    format!("getting unit {namespace}/{name}"),
                    e,
                )),
            }
        })
    }

    fn get_by_provider_id<'a>(
        &'a self,
        provider_id: &'a str,
    ) -> BoxFuture<'a, ProvisionResult<Option<Unit>>> {
        Box::pin(async move {
            let units: Vec<Unit> = self.store.list(None).map_err(|e| {
                ProvisionError::store(format!("looking up unit with provider id {provider_id}"), e)
            })?;
            Ok(units
                .into_iter()
                .find(|u| u.provider_id.as_deref() == Some(provider_id)))
        })
    }

    fn list<'a>(
        &'a self,
        selector: Option<&'a LabelSelector>,
    ) -> BoxFuture<'a, ProvisionResult<Vec<Unit>>> {
        Box::pin(async move {
            self.store
                .list(selector)
                .map_err(|e| ProvisionError::store("listing units", e))
        })
    }

    fn update<'a>(&'a self, unit: &'a mut Unit) -> BoxFuture<'a, ProvisionResult<()>> {
        Box::pin(async move {
            self.store.update(unit).map_err(|e| {
                ProvisionError::store(format!("updating unit {}", unit.meta.table_key()), e)
            })?;
            debug!(unit = %unit.meta.table_key(), "unit updated");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_store::MEMBERSHIP_LABEL;

    fn provider() -> (ObjectStore, StoreUnitProvider) {
        let store = ObjectStore::open_in_memory().unwrap();
        (store.clone(), StoreUnitProvider::new(store))
    }

    #[test]
    fn deleting_requires_non_zero_timestamp() {
        let mut unit = Unit::new("default", "u-1", "md-1");
        assert!(!is_deleting(None));
        assert!(!is_deleting(Some(&unit)));
        unit.meta.deletion_timestamp = Some(0);
        assert!(!is_deleting(Some(&unit)));
        unit.meta.deletion_timestamp = Some(1_700_000_000);
        assert!(is_deleting(Some(&unit)));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let (_, units) = provider();
        assert!(units.get("default", "ghost").await.unwrap().is_none());
        assert!(units.get_by_provider_id("aws:///i-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finds_unit_by_provider_id() {
        let (store, units) = provider();
        let mut a = Unit::new("default", "u-1", "md-1");
        a.provider_id = Some("aws:///i-1".to_string());
        let mut b = Unit::new("other", "u-2", "md-2");
        b.provider_id = Some("aws:///i-2".to_string());
        store.create(&mut a).unwrap();
        store.create(&mut b).unwrap();
        store.create(&mut Unit::new("default", "u-3", "md-1")).unwrap();

        let found = units.get_by_provider_id("aws:///i-2").await.unwrap().unwrap();
        assert_eq!(found.meta.name, "u-2");
    }

    #[tokio::test]
    async fn list_filters_by_membership() {
        let (store, units) = provider();
        let mut member = Unit::new("default", "u-1", "md-1");
        member.meta.labels.insert(MEMBERSHIP_LABEL.to_string(), String::new());
        store.create(&mut member).unwrap();
        store.create(&mut Unit::new("default", "u-2", "md-1")).unwrap();

        let selector = LabelSelector::everything().exists(MEMBERSHIP_LABEL);
        let listed = units.list(Some(&selector)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(units.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_annotation_is_idempotent() {
        let (store, units) = provider();
        let mut unit = Unit::new("default", "u-1", "md-1");
        store.create(&mut unit).unwrap();

        assert!(units.add_delete_annotation(&mut unit).await.unwrap());
        let version = unit.meta.resource_version;
        let value = unit.meta.annotations[DELETE_UNIT_ANNOTATION].clone();

        // Second add performs no write and keeps the original value.
        assert!(!units.add_delete_annotation(&mut unit).await.unwrap());
        assert_eq!(unit.meta.resource_version, version);
        assert_eq!(unit.meta.annotations[DELETE_UNIT_ANNOTATION], value);

        assert!(units.remove_delete_annotation(&mut unit).await.unwrap());
        assert!(!units.remove_delete_annotation(&mut unit).await.unwrap());

        let stored: Unit = store.get("default", "u-1").unwrap();
        assert!(!stored.meta.annotations.contains_key(DELETE_UNIT_ANNOTATION));
        assert_eq!(stored.meta.resource_version, version + 1);
    }

    #[tokio::test]
    async fn failed_annotation_write_restores_local_copy() {
        let (store, units) = provider();
        let mut unit = Unit::new("default", "u-1", "md-1");
        store.create(&mut unit).unwrap();

        // Someone else writes first; our copy is now stale.
        let mut other: Unit = store.get("default", "u-1").unwrap();
        other.provider_id = Some("aws:///i-1".to_string());
        store.update(&mut other).unwrap();

        let err = units.add_delete_annotation(&mut unit).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(!unit.meta.annotations.contains_key(DELETE_UNIT_ANNOTATION));
    }
}
