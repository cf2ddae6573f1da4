//! Capacity class readiness.
//!
//! Classes carry no health of their own here, so every class is reported
//! `Ready=True`. The pass is idempotent and safe to run from any number of
//! processes: a conflicting write is skipped and retried on the next tick.

use std::time::Duration;

use fleetgrid_store::{CONDITION_READY, CapacityClass, ConditionStatus, ObjectStore};
use tracing::{debug, info};

use crate::error::{ProvisionError, ProvisionResult};

pub struct ReadinessReconciler {
    store: ObjectStore,
}

impl ReadinessReconciler {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    /// Mark every class ready. Returns how many classes were written.
    pub fn reconcile_all(&self) -> ProvisionResult<usize> {
        let classes: Vec<CapacityClass> = self
            .store
            .list(None)
            .map_err(|e| ProvisionError::store("listing capacity classes", e))?;

        let mut updated = 0;
        for mut class in classes {
            if !class
                .status
                .set_condition(CONDITION_READY, ConditionStatus::True)
            {
                continue;
            }
            match self.store.update(&mut class) {
                Ok(()) => {
                    debug!(class = %class.meta.name, "capacity class marked ready");
                    updated += 1;
                }
                Err(e) if e.is_conflict() => {
                    debug!(class = %class.meta.name, "capacity class changed underneath us, retrying later");
                }
                Err(e) => {
                    return Err(ProvisionError::store(
                        format!("updating capacity class {}", class.meta.name),
                        e,
                    ));
                }
            }
        }
        Ok(updated)
    }

    /// Run until `shutdown` changes. The first pass runs immediately.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "readiness reconciler started");

        if let Err(e) = self.reconcile_all() {
            tracing::error!(error = %e, "readiness pass failed");
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile_all() {
                        tracing::error!(error = %e, "readiness pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("readiness reconciler shutting down");
                    break;
                }
            }
        }
    }
}
