//! Claim and capacity class access.

use fleetgrid_store::{CapacityClass, Claim, ObjectStore, StoreError};
use tracing::debug;

use crate::BoxFuture;
use crate::error::{ProvisionError, ProvisionResult};

/// Reads capacity classes and persists claim bindings. Injected for
/// testability.
pub trait ClaimStore: Send + Sync {
    /// Look up a capacity class by name. Missing is
    /// [`ProvisionError::NotFound`].
    fn get_class<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ProvisionResult<CapacityClass>>;

    /// Full-object write of a claim.
    fn update_claim<'a>(&'a self, claim: &'a mut Claim) -> BoxFuture<'a, ProvisionResult<()>>;
}

/// [`ClaimStore`] backed by the object store.
#[derive(Clone)]
pub struct StoreClaimStore {
    store: ObjectStore,
}

impl StoreClaimStore {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }
}

impl ClaimStore for StoreClaimStore {
    fn get_class<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ProvisionResult<CapacityClass>> {
        Box::pin(async move {
            match self.store.get("", name) {
                Ok(class) => Ok(class),
                Err(StoreError::NotFound { kind, .. }) => Err(ProvisionError::NotFound {
                    kind,
                    name: name.to_string(),
                }),
                Err(e) => Err(ProvisionError::store(
                    format!("getting capacity class {name}"),
                    e,
                )),
            }
        })
    }

    fn update_claim<'a>(&'a self, claim: &'a mut Claim) -> BoxFuture<'a, ProvisionResult<()>> {
        Box::pin(async move {
            self.store.update(claim).map_err(|e| {
                ProvisionError::store(format!("updating claim {}", claim.meta.name), e)
            })?;
            debug!(claim = %claim.meta.name, "claim updated");
            Ok(())
        })
    }
}
