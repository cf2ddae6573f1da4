//! Group provider: reads and writes scalable groups.

use fleetgrid_store::{LabelSelector, ObjectStore, ScalableGroup};
use tracing::debug;

use crate::BoxFuture;
use crate::error::{ProvisionError, ProvisionResult};

/// Access to scalable groups. Injected for testability.
///
/// `list` never filters by the membership label; callers that only want
/// groups in use add that to the selector themselves.
pub trait GroupProvider: Send + Sync {
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, ProvisionResult<ScalableGroup>>;

    /// All groups matching `selector`; `None` returns every group.
    fn list<'a>(
        &'a self,
        selector: Option<&'a LabelSelector>,
    ) -> BoxFuture<'a, ProvisionResult<Vec<ScalableGroup>>>;

    /// Full-object write. A stale `resource_version` fails with a conflict.
    fn update<'a>(&'a self, group: &'a mut ScalableGroup) -> BoxFuture<'a, ProvisionResult<()>>;
}

/// [`GroupProvider`] backed by the object store.
#[derive(Clone)]
pub struct StoreGroupProvider {
    store: ObjectStore,
}

impl StoreGroupProvider {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }
}

impl GroupProvider for StoreGroupProvider {
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, ProvisionResult<ScalableGroup>> {
        Box::pin(async move {
            self.store
                .get(namespace, name)
                .map_err(|e| ProvisionError::store(format!("getting group {namespace}/{name}"), e))
        })
    }

    fn list<'a>(
        &'a self,
        selector: Option<&'a LabelSelector>,
    ) -> BoxFuture<'a, ProvisionResult<Vec<ScalableGroup>>> {
        Box::pin(async move {
            self.store
                .list(selector)
                .map_err(|e| ProvisionError::store("listing groups", e))
        })
    }

    fn update<'a>(&'a self, group: &'a mut ScalableGroup) -> BoxFuture<'a, ProvisionResult<()>> {
        Box::pin(async move {
            self.store.update(group).map_err(|e| {
                ProvisionError::store(format!("updating group {}", group.meta.table_key()), e)
            })?;
            debug!(group = %group.meta.table_key(), replicas = ?group.replicas, "group updated");
            Ok(())
        })
    }
}
