//! Label propagation from scalable groups to claims.
//!
//! A group's unit-template labels reach the claim only if the
//! [`LabelPolicy`] allows them. The scale-from-zero label annotation is then
//! layered on top and may override propagated values.

use std::collections::{BTreeMap, BTreeSet};

use fleetgrid_store::ScalableGroup;
use tracing::debug;

/// Well-known zone label.
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// Well-known instance type label; names the instance type of a group.
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";

/// Capacity type requirement key carried by offerings.
pub const CAPACITY_TYPE_LABEL: &str = "karpenter.sh/capacity-type";

pub const CAPACITY_TYPE_ON_DEMAND: &str = "on-demand";

/// Selectable labels published by this provider.
pub const INSTANCE_SIZE_LABEL: &str = "karpenter.cluster.x-k8s.io/instance-size";
pub const INSTANCE_FAMILY_LABEL: &str = "karpenter.cluster.x-k8s.io/instance-family";
pub const INSTANCE_CPU_LABEL: &str = "karpenter.cluster.x-k8s.io/instance-cpu";
pub const INSTANCE_MEMORY_LABEL: &str = "karpenter.cluster.x-k8s.io/instance-memory";

/// Annotation holding scale-from-zero labels as `k1=v1,k2=v2`.
pub const LABELS_ANNOTATION: &str = "capacity.cluster-autoscaler.kubernetes.io/labels";

/// Which template labels propagate from a group to its claims.
///
/// Built once at startup and passed to whatever needs it. A label key
/// `domain/name` propagates when `domain` is one of the exact domains, is
/// one of the subdomain roots or ends in `.<root>`, or the whole key is
/// one of the provider's well-known labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPolicy {
    exact_domains: BTreeSet<String>,
    subdomain_roots: BTreeSet<String>,
    well_known: BTreeSet<String>,
}

impl LabelPolicy {
    pub fn new<A, B, C>(exact_domains: A, subdomain_roots: B, well_known: C) -> Self
    where
        A: IntoIterator<Item = &'static str>,
        B: IntoIterator<Item = &'static str>,
        C: IntoIterator<Item = &'static str>,
    {
        Self {
            exact_domains: exact_domains.into_iter().map(String::from).collect(),
            subdomain_roots: subdomain_roots.into_iter().map(String::from).collect(),
            well_known: well_known.into_iter().map(String::from).collect(),
        }
    }

    /// The Cluster API metadata propagation rules plus this provider's
    /// well-known instance labels.
    pub fn cluster_api() -> Self {
        Self::new(
            ["node-role.kubernetes.io"],
            ["node-restriction.kubernetes.io", "node.cluster.x-k8s.io"],
            [
                INSTANCE_SIZE_LABEL,
                INSTANCE_FAMILY_LABEL,
                INSTANCE_CPU_LABEL,
                INSTANCE_MEMORY_LABEL,
            ],
        )
    }

    /// Provider labels that are selectable on claims.
    pub fn well_known(&self) -> &BTreeSet<String> {
        &self.well_known
    }

    pub fn is_propagated(&self, key: &str) -> bool {
        if self.well_known.contains(key) {
            return true;
        }
        let domain = key.split('/').next().unwrap_or(key);
        self.exact_domains.contains(domain)
            || self.subdomain_roots.iter().any(|root| {
                domain == root
                    || domain
                        .strip_suffix(root.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            })
    }

    /// Keep only the labels this policy propagates.
    pub fn propagate(&self, labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        labels
            .iter()
            .filter(|(key, _)| self.is_propagated(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Labels a unit of `group` will carry: propagated template labels,
    /// overridden by the scale-from-zero annotation.
    pub fn node_labels(&self, group: &ScalableGroup) -> BTreeMap<String, String> {
        let mut labels = self.propagate(&group.template.labels);
        if let Some(annotation) = group.meta.annotations.get(LABELS_ANNOTATION) {
            labels.extend(parse_scale_from_zero_labels(annotation));
        }
        labels
    }
}

impl Default for LabelPolicy {
    fn default() -> Self {
        Self::cluster_api()
    }
}

/// Parse a scale-from-zero label annotation, `k1=v1,k2=v2`.
///
/// Lenient by contract: a segment without `=` is skipped, never an error.
/// A segment with an empty key such as `=v` is skipped too; the upstream
/// Cluster API provider keeps it as an empty-named label, which no
/// requirement can select. Only the first `=` splits, so values may contain
/// `=`. Later duplicates win.
pub fn parse_scale_from_zero_labels(annotation: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for segment in annotation.split(',') {
        match segment.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                labels.insert(key.to_string(), value.to_string());
            }
            _ => debug!(segment, "skipping malformed scale-from-zero label"),
        }
    }
    labels
}
