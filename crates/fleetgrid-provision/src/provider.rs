//! The capacity provider: the contract the orchestrator calls, and the
//! Cluster API-style implementation over scalable groups.
//!
//! Create and Delete live in `create.rs` and `delete.rs`; this module holds
//! the shared lookups and the read-only query paths.

use std::sync::Arc;
use std::time::Duration;

use fleetgrid_capacity::translate::{RESOURCE_CPU, RESOURCE_MEMORY};
use fleetgrid_capacity::{InstanceType, LabelPolicy, group_to_instance_type};
use fleetgrid_store::{
    BIND_ANNOTATION, CapacityClass, Claim, ClassRef, ConditionStatus, LabelSelector,
    MEMBERSHIP_LABEL, OWNER_GROUP_LABEL, ObjectStore, ScalableGroup, Unit,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::BoxFuture;
use crate::cancel::Cancel;
use crate::claims::{ClaimStore, StoreClaimStore};
use crate::error::{ProvisionError, ProvisionResult};
use crate::groups::{GroupProvider, StoreGroupProvider};
use crate::reservation::PollConfig;
use crate::units::{StoreUnitProvider, UnitProvider};

/// Fixed identifier reported by [`CapacityProvider::name`].
pub const PROVIDER_NAME: &str = "clusterapi";

/// A pool of claims that draw from one capacity class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimPool {
    pub name: String,
    pub class_ref: Option<ClassRef>,
}

/// When an unhealthy unit should be replaced. This provider declares none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairPolicy {
    pub condition: String,
    pub status: ConditionStatus,
    pub toleration: Duration,
}

/// What the orchestrator calls.
pub trait CapacityProvider: Send + Sync {
    /// Reserve, discover and bind one unit for `claim`; returns the claim
    /// with its status populated. May block up to the poll timeout.
    fn create<'a>(
        &'a self,
        claim: Claim,
        cancel: &'a Cancel,
    ) -> BoxFuture<'a, ProvisionResult<Claim>>;

    /// Release the unit bound to `claim`.
    fn delete<'a>(
        &'a self,
        claim: &'a Claim,
        cancel: &'a Cancel,
    ) -> BoxFuture<'a, ProvisionResult<()>>;

    /// Snapshot of the claim backed by the unit with `provider_id`.
    fn get<'a>(&'a self, provider_id: &'a str) -> BoxFuture<'a, ProvisionResult<Claim>>;

    /// Snapshots of every claimed unit.
    fn list<'a>(&'a self) -> BoxFuture<'a, ProvisionResult<Vec<Claim>>>;

    /// Instance types available to a pool.
    fn get_instance_types<'a>(
        &'a self,
        pool: &'a ClaimPool,
    ) -> BoxFuture<'a, ProvisionResult<Vec<InstanceType>>>;

    /// Drift reason, if any. Never reports drift.
    fn is_drifted<'a>(&'a self, claim: &'a Claim) -> BoxFuture<'a, ProvisionResult<Option<String>>>;

    fn repair_policies(&self) -> Vec<RepairPolicy>;

    fn name(&self) -> &'static str;
}

/// Capacity provider that scales groups one replica at a time.
///
/// Create and Delete hold one lock for their whole run, so replica
/// read-modify-write cycles never interleave within a process. Queries
/// don't take it and may observe state mid-change.
pub struct ClusterApiProvider {
    pub(crate) groups: Arc<dyn GroupProvider>,
    pub(crate) units: Arc<dyn UnitProvider>,
    pub(crate) claims: Arc<dyn ClaimStore>,
    pub(crate) policy: LabelPolicy,
    pub(crate) poll: PollConfig,
    pub(crate) lock: Mutex<()>,
}

impl ClusterApiProvider {
    pub fn new(
        groups: Arc<dyn GroupProvider>,
        units: Arc<dyn UnitProvider>,
        claims: Arc<dyn ClaimStore>,
    ) -> Self {
        Self {
            groups,
            units,
            claims,
            policy: LabelPolicy::cluster_api(),
            poll: PollConfig::default(),
            lock: Mutex::new(()),
        }
    }

    /// Provider with store-backed group, unit and claim access.
    pub fn from_store(store: ObjectStore) -> Self {
        Self::new(
            Arc::new(StoreGroupProvider::new(store.clone())),
            Arc::new(StoreUnitProvider::new(store.clone())),
            Arc::new(StoreClaimStore::new(store)),
        )
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_label_policy(mut self, policy: LabelPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn poll_config(&self) -> PollConfig {
        self.poll
    }

    /// Take the lock that serializes Create and Delete, giving up as soon
    /// as `cancel` fires. A call queued behind a long discovery wait must
    /// not sit out that wait once cancelled.
    pub(crate) async fn lock_or_cancel(
        &self,
        cancel: &Cancel,
        what: &str,
    ) -> ProvisionResult<MutexGuard<'_, ()>> {
        tokio::select! {
            guard = self.lock.lock() => Ok(guard),
            _ = cancel.cancelled() => Err(ProvisionError::Cancelled(format!("waiting to {what}"))),
        }
    }

    /// Resolve a capacity class reference. A missing or empty reference, or
    /// one naming no class, is a caller error.
    pub(crate) async fn resolve_class(
        &self,
        class_ref: Option<&ClassRef>,
        owner: &str,
    ) -> ProvisionResult<CapacityClass> {
        let class_ref = class_ref.ok_or_else(|| {
            ProvisionError::InvalidInput(format!("{owner} has no capacity class reference"))
        })?;
        if class_ref.name.is_empty() {
            return Err(ProvisionError::InvalidInput(format!(
                "{owner} has an empty capacity class reference"
            )));
        }
        match self.claims.get_class(&class_ref.name).await {
            Err(ProvisionError::NotFound { .. }) => Err(ProvisionError::InvalidInput(format!(
                "capacity class {} referenced by {owner} does not exist",
                class_ref.name
            ))),
            other => other,
        }
    }

    /// Translate every group the class selects.
    pub(crate) async fn instance_types_for_class(
        &self,
        class: &CapacityClass,
    ) -> ProvisionResult<Vec<InstanceType>> {
        let groups = self
            .groups
            .list(class.spec.scalable_selector.as_ref())
            .await?;
        debug!(class = %class.meta.name, groups = groups.len(), "listed groups for class");

        groups
            .iter()
            .map(|group| {
                group_to_instance_type(group, &self.policy).map_err(|e| {
                    ProvisionError::capacity(format!("translating group {}", group.meta.table_key()), e)
                })
            })
            .collect()
    }

    /// The group named by the unit's owner label, in the unit's namespace.
    pub(crate) async fn owning_group(&self, unit: &Unit) -> ProvisionResult<ScalableGroup> {
        let name = unit.owner_group().ok_or_else(|| {
            ProvisionError::InvalidInput(format!(
                "unit {} has no {OWNER_GROUP_LABEL} label",
                unit.meta.table_key()
            ))
        })?;
        self.groups.get(&unit.meta.namespace, name).await
    }

    /// Status snapshot of a claimed unit. The owning group must declare cpu
    /// and memory capacity.
    async fn unit_to_claim(&self, unit: &Unit) -> ProvisionResult<Claim> {
        let group = self.owning_group(unit).await?;
        let instance_type = group_to_instance_type(&group, &self.policy).map_err(|e| {
            ProvisionError::capacity(format!("reading capacity of unit {}", unit.meta.table_key()), e)
        })?;
        for resource in [RESOURCE_CPU, RESOURCE_MEMORY] {
            if !instance_type.capacity.contains_key(resource) {
                return Err(ProvisionError::MissingCapacity {
                    unit: unit.meta.table_key(),
                    group: group.meta.table_key(),
                    resource,
                });
            }
        }

        let mut claim = Claim::default();
        claim
            .meta
            .annotations
            .insert(BIND_ANNOTATION.to_string(), unit.meta.table_key());
        claim.meta.labels = instance_type.labels.clone();
        claim.status.provider_id = unit.provider_id.clone().unwrap_or_default();
        claim.status.allocatable = instance_type.allocatable();
        claim.status.capacity = instance_type.capacity;
        Ok(claim)
    }

    pub async fn get_claim(&self, provider_id: &str) -> ProvisionResult<Claim> {
        if provider_id.is_empty() {
            return Err(ProvisionError::InvalidInput(
                "no provider id supplied".to_string(),
            ));
        }
        let unit = self
            .units
            .get_by_provider_id(provider_id)
            .await?
            .ok_or_else(|| ProvisionError::NotFound {
                kind: "Unit",
                name: format!("with provider id {provider_id}"),
            })?;
        self.unit_to_claim(&unit).await
    }

    pub async fn list_claims(&self) -> ProvisionResult<Vec<Claim>> {
        let selector = LabelSelector::everything().exists(MEMBERSHIP_LABEL);
        let units = self.units.list(Some(&selector)).await?;
        let mut claims = Vec::with_capacity(units.len());
        for unit in &units {
            claims.push(self.unit_to_claim(unit).await?);
        }
        Ok(claims)
    }

    pub async fn instance_types(&self, pool: &ClaimPool) -> ProvisionResult<Vec<InstanceType>> {
        let owner = format!("pool {}", pool.name);
        let class = self.resolve_class(pool.class_ref.as_ref(), &owner).await?;
        self.instance_types_for_class(&class).await
    }
}

impl CapacityProvider for ClusterApiProvider {
    fn create<'a>(&'a self, claim: Claim, cancel: &'a Cancel) -> BoxFuture<'a, ProvisionResult<Claim>> {
        Box::pin(self.create_claim(claim, cancel))
    }

    fn delete<'a>(&'a self, claim: &'a Claim, cancel: &'a Cancel) -> BoxFuture<'a, ProvisionResult<()>> {
        Box::pin(self.delete_claim(claim, cancel))
    }

    fn get<'a>(&'a self, provider_id: &'a str) -> BoxFuture<'a, ProvisionResult<Claim>> {
        Box::pin(self.get_claim(provider_id))
    }

    fn list<'a>(&'a self) -> BoxFuture<'a, ProvisionResult<Vec<Claim>>> {
        Box::pin(self.list_claims())
    }

    fn get_instance_types<'a>(
        &'a self,
        pool: &'a ClaimPool,
    ) -> BoxFuture<'a, ProvisionResult<Vec<InstanceType>>> {
        Box::pin(self.instance_types(pool))
    }

    fn is_drifted<'a>(&'a self, _claim: &'a Claim) -> BoxFuture<'a, ProvisionResult<Option<String>>> {
        Box::pin(async { Ok(None) })
    }

    fn repair_policies(&self) -> Vec<RepairPolicy> {
        Vec::new()
    }

    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }
}

/// Split a bind annotation, `namespace/name`, into its parts.
pub(crate) fn parse_binding(value: &str) -> ProvisionResult<(&str, &str)> {
    let invalid = || ProvisionError::InvalidBinding {
        value: value.to_string(),
    };
    let mut parts = value.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(namespace), Some(name), None) => {
            let (namespace, name) = (namespace.trim(), name.trim());
            if namespace.is_empty() || name.is_empty() {
                return Err(invalid());
            }
            Ok((namespace, name))
        }
        _ => Err(invalid()),
    }
}
