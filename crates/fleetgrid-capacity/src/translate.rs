//! Scalable group → instance type translation.
//!
//! A group advertises what its units will look like through the
//! scale-from-zero annotations. This module reads them into a
//! [`ResourceList`] and bundles that with the group's labels into an
//! [`InstanceType`] that claims are matched against.

use std::collections::BTreeMap;

use fleetgrid_store::{Quantity, ResourceList, ScalableGroup};
use serde::Serialize;

use crate::error::{CapacityError, CapacityResult};
use crate::labels::{
    CAPACITY_TYPE_LABEL, CAPACITY_TYPE_ON_DEMAND, INSTANCE_TYPE_LABEL, LabelPolicy, ZONE_LABEL,
};
use crate::requirements::{Requirement, Requirements};

pub const CPU_ANNOTATION: &str = "capacity.cluster-autoscaler.kubernetes.io/cpu";
pub const MEMORY_ANNOTATION: &str = "capacity.cluster-autoscaler.kubernetes.io/memory";
pub const GPU_COUNT_ANNOTATION: &str = "capacity.cluster-autoscaler.kubernetes.io/gpu-count";
pub const GPU_TYPE_ANNOTATION: &str = "capacity.cluster-autoscaler.kubernetes.io/gpu-type";
pub const DISK_ANNOTATION: &str = "capacity.cluster-autoscaler.kubernetes.io/ephemeral-disk";
pub const MAX_PODS_ANNOTATION: &str = "capacity.cluster-autoscaler.kubernetes.io/maxPods";

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";
pub const RESOURCE_PODS: &str = "pods";

/// Read the capacity annotations of a group.
///
/// Absent annotations leave the resource out. A GPU count without a GPU
/// type is ignored, since the type names the resource. Malformed
/// quantities are an error.
pub fn capacity_from_annotations(
    annotations: &BTreeMap<String, String>,
) -> CapacityResult<ResourceList> {
    let parse = |annotation: &'static str| -> CapacityResult<Option<Quantity>> {
        annotations
            .get(annotation)
            .map(|text| {
                Quantity::parse(text).map_err(|source| CapacityError::Quantity { annotation, source })
            })
            .transpose()
    };

    let mut capacity = ResourceList::new();
    if let Some(cpu) = parse(CPU_ANNOTATION)? {
        capacity.insert(RESOURCE_CPU.to_string(), cpu);
    }
    if let Some(memory) = parse(MEMORY_ANNOTATION)? {
        capacity.insert(RESOURCE_MEMORY.to_string(), memory);
    }
    if let Some(gpu_type) = annotations.get(GPU_TYPE_ANNOTATION) {
        if let Some(count) = parse(GPU_COUNT_ANNOTATION)? {
            capacity.insert(gpu_type.clone(), count);
        }
    }
    if let Some(disk) = parse(DISK_ANNOTATION)? {
        capacity.insert(RESOURCE_EPHEMERAL_STORAGE.to_string(), disk);
    }
    if let Some(pods) = parse(MAX_PODS_ANNOTATION)? {
        capacity.insert(RESOURCE_PODS.to_string(), pods);
    }
    Ok(capacity)
}

/// One priced, zoned variant of an instance type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Offering {
    pub requirements: Requirements,
    pub price: f64,
    pub available: bool,
}

impl Offering {
    /// The single offering every group gets: free, available, on-demand in
    /// the group's zone. A group without a zone label offers the zone `""`.
    pub fn on_demand(zone: &str) -> Self {
        Self {
            requirements: [
                Requirement::in_values(ZONE_LABEL, [zone]),
                Requirement::in_values(CAPACITY_TYPE_LABEL, [CAPACITY_TYPE_ON_DEMAND]),
            ]
            .into_iter()
            .collect(),
            price: 0.0,
            available: true,
        }
    }
}

/// Resources held back from workloads on every unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Overhead {
    pub kube_reserved: ResourceList,
    pub system_reserved: ResourceList,
    pub eviction_threshold: ResourceList,
}

impl Overhead {
    /// Sum of all reservations, per resource.
    pub fn total(&self) -> ResourceList {
        let mut total: BTreeMap<String, i128> = BTreeMap::new();
        for list in [&self.kube_reserved, &self.system_reserved, &self.eviction_threshold] {
            for (name, quantity) in list {
                *total.entry(name.clone()).or_default() += quantity.millis();
            }
        }
        total
            .into_iter()
            .map(|(name, millis)| (name, Quantity::from_millis(millis)))
            .collect()
    }
}

/// What a unit of one scalable group looks like to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceType {
    /// Value of the instance type label, empty when the group has none.
    pub name: String,
    pub requirements: Requirements,
    pub offerings: Vec<Offering>,
    pub capacity: ResourceList,
    pub overhead: Overhead,
    /// Labels a unit of this type carries.
    pub labels: BTreeMap<String, String>,
    pub group_name: String,
    pub group_namespace: String,
}

impl InstanceType {
    /// Capacity minus overhead, floored at zero per resource.
    pub fn allocatable(&self) -> ResourceList {
        let overhead = self.overhead.total();
        self.capacity
            .iter()
            .map(|(name, quantity)| {
                let allocatable = match overhead.get(name) {
                    Some(reserved) => quantity.saturating_sub(reserved),
                    None => quantity.clone(),
                };
                (name.clone(), allocatable)
            })
            .collect()
    }

    /// True if a claim with these requirements and requests can land here:
    /// the requirements are compatible with the instance type and with at
    /// least one available offering, and the requests fit.
    pub fn admits(&self, requirements: &Requirements, requests: &ResourceList) -> bool {
        requirements.is_compatible(&self.requirements)
            && self
                .offerings
                .iter()
                .any(|o| o.available && requirements.is_compatible(&o.requirements))
            && fits(requests, &self.allocatable())
    }
}

/// Translate a group into its instance type.
pub fn group_to_instance_type(
    group: &ScalableGroup,
    policy: &LabelPolicy,
) -> CapacityResult<InstanceType> {
    let labels = policy.node_labels(group);
    let capacity = capacity_from_annotations(&group.meta.annotations)?;
    let zone = labels.get(ZONE_LABEL).map_or("", String::as_str);

    Ok(InstanceType {
        name: labels.get(INSTANCE_TYPE_LABEL).cloned().unwrap_or_default(),
        requirements: Requirements::from_labels(&labels),
        offerings: vec![Offering::on_demand(zone)],
        capacity,
        overhead: Overhead::default(),
        labels,
        group_name: group.meta.name.clone(),
        group_namespace: group.meta.namespace.clone(),
    })
}

/// True if every requested amount is covered. A resource missing from
/// `allocatable` has zero available.
pub fn fits(requests: &ResourceList, allocatable: &ResourceList) -> bool {
    requests.iter().all(|(name, requested)| {
        let available = allocatable.get(name).map_or(0, Quantity::millis);
        requested.millis() <= available
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_store::QuantityError;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn resources(pairs: &[(&str, &str)]) -> ResourceList {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity::parse(v).unwrap()))
            .collect()
    }

    #[test]
    fn reads_cpu_and_memory_as_written() {
        let capacity = capacity_from_annotations(&annotations(&[
            (CPU_ANNOTATION, "4"),
            (MEMORY_ANNOTATION, "16777220Ki"),
        ]))
        .unwrap();

        assert_eq!(capacity.len(), 2);
        assert_eq!(capacity[RESOURCE_CPU].to_string(), "4");
        assert_eq!(capacity[RESOURCE_MEMORY].to_string(), "16777220Ki");
    }

    #[test]
    fn gpu_requires_type() {
        let without_type =
            capacity_from_annotations(&annotations(&[(GPU_COUNT_ANNOTATION, "2")])).unwrap();
        assert!(without_type.is_empty());

        let with_type = capacity_from_annotations(&annotations(&[
            (GPU_COUNT_ANNOTATION, "2"),
            (GPU_TYPE_ANNOTATION, "nvidia.com/gpu"),
        ]))
        .unwrap();
        assert_eq!(with_type["nvidia.com/gpu"], Quantity::from_units(2));
    }

    #[test]
    fn disk_and_pods() {
        let capacity = capacity_from_annotations(&annotations(&[
            (DISK_ANNOTATION, "100Gi"),
            (MAX_PODS_ANNOTATION, "110"),
        ]))
        .unwrap();
        assert_eq!(capacity[RESOURCE_EPHEMERAL_STORAGE].to_string(), "100Gi");
        assert_eq!(capacity[RESOURCE_PODS], Quantity::from_units(110));
    }

    #[test]
    fn malformed_quantity_is_an_error() {
        let err = capacity_from_annotations(&annotations(&[(CPU_ANNOTATION, "four")])).unwrap_err();
        match err {
            CapacityError::Quantity { annotation, source } => {
                assert_eq!(annotation, CPU_ANNOTATION);
                assert!(matches!(source, QuantityError::Invalid(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn instance_type_from_group() {
        let mut group = ScalableGroup::new("capi", "md-1", Some(2));
        group.meta.annotations = annotations(&[
            (CPU_ANNOTATION, "4"),
            (MEMORY_ANNOTATION, "16Gi"),
            (
                crate::labels::LABELS_ANNOTATION,
                "topology.kubernetes.io/zone=east,node.kubernetes.io/instance-type=m5.xlarge",
            ),
        ]);

        let it = group_to_instance_type(&group, &LabelPolicy::cluster_api()).unwrap();
        assert_eq!(it.name, "m5.xlarge");
        assert_eq!(it.group_name, "md-1");
        assert_eq!(it.group_namespace, "capi");
        assert_eq!(it.requirements.len(), 2);
        assert_eq!(it.offerings.len(), 1);
        assert!(it.offerings[0].available);
        assert_eq!(it.offerings[0].price, 0.0);
        assert!(
            it.offerings[0]
                .requirements
                .get(ZONE_LABEL)
                .unwrap()
                .has("east")
        );
        assert_eq!(it.allocatable(), it.capacity);
    }

    #[test]
    fn group_without_zone_offers_empty_zone() {
        let group = ScalableGroup::new("capi", "md-1", Some(0));
        let it = group_to_instance_type(&group, &LabelPolicy::cluster_api()).unwrap();
        assert_eq!(it.name, "");
        assert!(it.offerings[0].requirements.get(ZONE_LABEL).unwrap().has(""));
    }

    #[test]
    fn instance_type_json_keeps_quantity_text() {
        let mut group = ScalableGroup::new("capi", "md-1", Some(1));
        group.meta.annotations = annotations(&[(MEMORY_ANNOTATION, "16777220Ki")]);
        let it = group_to_instance_type(&group, &LabelPolicy::cluster_api()).unwrap();

        let json = serde_json::to_value(&it).unwrap();
        assert_eq!(json["capacity"]["memory"], "16777220Ki");
        assert_eq!(json["group_name"], "md-1");
    }

    #[test]
    fn allocatable_subtracts_overhead() {
        let mut group = ScalableGroup::new("capi", "md-1", Some(1));
        group.meta.annotations = annotations(&[(CPU_ANNOTATION, "4"), (MEMORY_ANNOTATION, "8Gi")]);
        let mut it = group_to_instance_type(&group, &LabelPolicy::cluster_api()).unwrap();
        it.overhead.kube_reserved = resources(&[("cpu", "500m")]);
        it.overhead.system_reserved = resources(&[("cpu", "500m"), ("memory", "10Gi")]);

        let allocatable = it.allocatable();
        assert_eq!(allocatable["cpu"], Quantity::from_units(3));
        assert_eq!(allocatable["memory"], Quantity::zero());
    }

    #[test]
    fn fits_compares_each_request() {
        let allocatable = resources(&[("cpu", "4"), ("memory", "16Gi")]);
        assert!(fits(&resources(&[("cpu", "4")]), &allocatable));
        assert!(fits(&resources(&[("cpu", "1"), ("memory", "1Gi")]), &allocatable));
        assert!(!fits(&resources(&[("cpu", "4500m")]), &allocatable));
        assert!(!fits(&resources(&[("nvidia.com/gpu", "1")]), &allocatable));
        assert!(fits(&resources(&[("nvidia.com/gpu", "0")]), &allocatable));
        assert!(fits(&ResourceList::new(), &ResourceList::new()));
    }

    #[test]
    fn admits_checks_offering_zone() {
        let mut group = ScalableGroup::new("capi", "md-1", Some(1));
        group.meta.annotations = annotations(&[
            (CPU_ANNOTATION, "4"),
            (crate::labels::LABELS_ANNOTATION, "topology.kubernetes.io/zone=east"),
        ]);
        let it = group_to_instance_type(&group, &LabelPolicy::cluster_api()).unwrap();
        let requests = resources(&[("cpu", "2")]);

        let east: Requirements = [Requirement::in_values(ZONE_LABEL, ["east"])].into_iter().collect();
        let west: Requirements = [Requirement::in_values(ZONE_LABEL, ["west"])].into_iter().collect();
        let spot: Requirements = [Requirement::in_values(CAPACITY_TYPE_LABEL, ["spot"])]
            .into_iter()
            .collect();

        assert!(it.admits(&east, &requests));
        assert!(!it.admits(&west, &requests));
        assert!(!it.admits(&spot, &requests));
        assert!(!it.admits(&east, &resources(&[("cpu", "8")])));
    }
}
