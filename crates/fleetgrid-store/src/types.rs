//! Object model for the fleetgrid store.
//!
//! Four kinds are persisted:
//!
//! - [`ScalableGroup`]: a coarse capacity control with a desired replica
//!   count, fulfilled by an external fleet manager.
//! - [`Unit`]: one machine created by the fleet manager for a group.
//! - [`Claim`]: a request for one unit of capacity.
//! - [`CapacityClass`]: selects which groups may satisfy a claim.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::TableDefinition;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::quantity::ResourceList;
use crate::selector::LabelSelector;
use crate::tables::{CLAIMS, CLASSES, GROUPS, UNITS};

/// Label on a unit naming the scalable group that owns it.
pub const OWNER_GROUP_LABEL: &str = "cluster.x-k8s.io/deployment-name";

/// Label asserting a unit has been claimed by this provisioner.
pub const MEMBERSHIP_LABEL: &str = "node.cluster.x-k8s.io/karpenter-member";

/// Annotation asking the fleet manager to remove this unit first when
/// the group's replica count drops.
pub const DELETE_UNIT_ANNOTATION: &str = "cluster.x-k8s.io/delete-machine";

/// Annotation on a claim binding it to a unit, as `namespace/name`.
pub const BIND_ANNOTATION: &str = "cluster.x-k8s.io/machine";

/// Identity and bookkeeping shared by every stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    /// Empty for cluster-scoped kinds.
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Bumped by the store on every write; zero means never stored.
    #[serde(default)]
    pub resource_version: u64,
    /// Unix timestamp set when removal of the object has begun.
    #[serde(default)]
    pub deletion_timestamp: Option<u64>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Metadata for a cluster-scoped object.
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::new("", name)
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Build the table key, `{namespace}/{name}`.
    pub fn table_key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }
}

/// Build the table key for an object identity.
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// A kind that can be stored in an [`crate::ObjectStore`].
pub trait Object: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Human-readable kind name used in errors and logs.
    const KIND: &'static str;

    /// Table holding objects of this kind.
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! impl_object {
    ($ty:ty, $kind:literal, $table:expr) => {
        impl Object for $ty {
            const KIND: &'static str = $kind;
            const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = $table;

            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
        }
    };
}

// ── ScalableGroup ─────────────────────────────────────────────────

/// Template applied by the fleet manager to every unit it creates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A group of identical units sized by a replica count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalableGroup {
    pub meta: ObjectMeta,
    /// Desired unit count; `None` means the group is not managed by replicas.
    pub replicas: Option<u32>,
    #[serde(default)]
    pub template: UnitTemplate,
}

impl ScalableGroup {
    pub fn new(namespace: &str, name: &str, replicas: Option<u32>) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            replicas,
            template: UnitTemplate::default(),
        }
    }
}

impl_object!(ScalableGroup, "ScalableGroup", GROUPS);

// ── Unit ──────────────────────────────────────────────────────────

/// A machine created by the fleet manager on behalf of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub meta: ObjectMeta,
    /// Identity assigned by the infrastructure once the machine exists.
    #[serde(default)]
    pub provider_id: Option<String>,
}

impl Unit {
    pub fn new(namespace: &str, name: &str, group: &str) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name).with_label(OWNER_GROUP_LABEL, group),
            provider_id: None,
        }
    }

    /// Name of the owning group, from the back-reference label.
    pub fn owner_group(&self) -> Option<&str> {
        self.meta.labels.get(OWNER_GROUP_LABEL).map(String::as_str)
    }

    pub fn is_member(&self) -> bool {
        self.meta.labels.contains_key(MEMBERSHIP_LABEL)
    }
}

impl_object!(Unit, "Unit", UNITS);

// ── Claim ─────────────────────────────────────────────────────────

/// Reference to the capacity class a claim or pool draws from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRef {
    pub name: String,
}

/// Operator of a scheduling requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequirementOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

/// A scheduling requirement as written on a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequirement {
    pub key: String,
    pub operator: RequirementOperator,
    #[serde(default)]
    pub values: Vec<String>,
    /// For `In`: the minimum number of distinct values that must be satisfiable.
    #[serde(default)]
    pub min_values: Option<usize>,
}

impl ClaimRequirement {
    pub fn new<I, S>(key: impl Into<String>, operator: RequirementOperator, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
            min_values: None,
        }
    }

    pub fn with_min_values(mut self, min: usize) -> Self {
        self.min_values = Some(min);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSpec {
    pub class_ref: Option<ClassRef>,
    #[serde(default)]
    pub requirements: Vec<ClaimRequirement>,
    /// Resources the claim needs from the unit.
    #[serde(default)]
    pub requests: ResourceList,
}

/// Populated once a claim is bound to a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimStatus {
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub capacity: ResourceList,
    #[serde(default)]
    pub allocatable: ResourceList,
}

/// A request for one unit of capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: ClaimSpec,
    #[serde(default)]
    pub status: ClaimStatus,
}

impl Claim {
    pub fn new(name: &str, class: &str) -> Self {
        Self {
            meta: ObjectMeta::cluster_scoped(name),
            spec: ClaimSpec {
                class_ref: Some(ClassRef {
                    name: class.to_string(),
                }),
                ..Default::default()
            },
            status: ClaimStatus::default(),
        }
    }

    /// The bound unit's `namespace/name`, if the claim has been bound.
    pub fn binding(&self) -> Option<&str> {
        self.meta.annotations.get(BIND_ANNOTATION).map(String::as_str)
    }
}

impl_object!(Claim, "Claim", CLAIMS);

// ── CapacityClass ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: String,
    pub status: ConditionStatus,
    /// Unix timestamp of the last status change.
    pub last_transition: u64,
}

pub const CONDITION_READY: &str = "Ready";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityClassSpec {
    /// Selects the scalable groups that participate in provisioning.
    pub scalable_selector: Option<LabelSelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityClassStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl CapacityClassStatus {
    /// Status of the named condition, `Unknown` if never set.
    pub fn condition(&self, kind: &str) -> ConditionStatus {
        self.conditions
            .iter()
            .find(|c| c.kind == kind)
            .map_or(ConditionStatus::Unknown, |c| c.status)
    }

    /// Set a condition; returns true if anything changed.
    pub fn set_condition(&mut self, kind: &str, status: ConditionStatus) -> bool {
        let now = epoch_secs();
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(c) if c.status == status => false,
            Some(c) => {
                c.status = status;
                c.last_transition = now;
                true
            }
            None => {
                self.conditions.push(Condition {
                    kind: kind.to_string(),
                    status,
                    last_transition: now,
                });
                true
            }
        }
    }
}

/// Policy object naming the groups eligible to satisfy claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityClass {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: CapacityClassSpec,
    #[serde(default)]
    pub status: CapacityClassStatus,
}

impl CapacityClass {
    pub fn new(name: &str, selector: Option<LabelSelector>) -> Self {
        Self {
            meta: ObjectMeta::cluster_scoped(name),
            spec: CapacityClassSpec {
                scalable_selector: selector,
            },
            status: CapacityClassStatus::default(),
        }
    }
}

impl_object!(CapacityClass, "CapacityClass", CLASSES);

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
