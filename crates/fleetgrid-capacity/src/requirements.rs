//! Scheduling requirements and compatibility.
//!
//! Each [`Requirement`] is stored as a value set: either a finite set of
//! allowed values, or the complement of a finite set of excluded values,
//! optionally narrowed by integer bounds (`Gt`/`Lt`). Two requirements on
//! the same key are compatible when their sets intersect.

use std::collections::{BTreeMap, BTreeSet};

use fleetgrid_store::{ClaimRequirement, RequirementOperator};
use serde::{Deserialize, Serialize};

use crate::error::{CapacityError, CapacityResult};

/// A requirement on one label key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    /// When true, `values` lists excluded values and everything else is allowed.
    complement: bool,
    values: BTreeSet<String>,
    greater_than: Option<i64>,
    less_than: Option<i64>,
    /// Minimum number of distinct values the intersection must keep.
    pub min_values: Option<usize>,
}

impl Requirement {
    /// `key In values`.
    pub fn in_values<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            complement: false,
            values: values.into_iter().map(Into::into).collect(),
            greater_than: None,
            less_than: None,
            min_values: None,
        }
    }

    /// `key NotIn values`.
    pub fn not_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            complement: true,
            ..Self::in_values(key, values)
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self::not_in(key, Vec::<String>::new())
    }

    pub fn does_not_exist(key: impl Into<String>) -> Self {
        Self::in_values(key, Vec::<String>::new())
    }

    pub fn greater_than(key: impl Into<String>, bound: i64) -> Self {
        Self {
            greater_than: Some(bound),
            ..Self::exists(key)
        }
    }

    pub fn less_than(key: impl Into<String>, bound: i64) -> Self {
        Self {
            less_than: Some(bound),
            ..Self::exists(key)
        }
    }

    pub fn with_min_values(mut self, min: usize) -> Self {
        self.min_values = Some(min);
        self
    }

    /// Convert a claim's requirement, validating operator arity.
    pub fn from_claim(req: &ClaimRequirement) -> CapacityResult<Self> {
        let invalid = |reason: &str| CapacityError::InvalidRequirement {
            key: req.key.clone(),
            reason: reason.to_string(),
        };
        if req.key.is_empty() {
            return Err(invalid("empty key"));
        }

        let bound = || -> CapacityResult<i64> {
            match req.values.as_slice() {
                [single] => single
                    .trim()
                    .parse()
                    .map_err(|_| invalid(&format!("{single:?} is not an integer"))),
                _ => Err(invalid("Gt and Lt take exactly one value")),
            }
        };

        let mut requirement = match req.operator {
            RequirementOperator::In => {
                if req.values.is_empty() {
                    return Err(invalid("In requires at least one value"));
                }
                Self::in_values(&req.key, &req.values)
            }
            RequirementOperator::NotIn => Self::not_in(&req.key, &req.values),
            RequirementOperator::Exists => Self::exists(&req.key),
            RequirementOperator::DoesNotExist => Self::does_not_exist(&req.key),
            RequirementOperator::Gt => Self::greater_than(&req.key, bound()?),
            RequirementOperator::Lt => Self::less_than(&req.key, bound()?),
        };
        requirement.min_values = req.min_values;
        Ok(requirement)
    }

    /// The operator this value set is equivalent to.
    pub fn operator(&self) -> RequirementOperator {
        match (self.complement, self.values.is_empty()) {
            (false, true) => RequirementOperator::DoesNotExist,
            (false, false) => RequirementOperator::In,
            (true, _) if self.greater_than.is_some() => RequirementOperator::Gt,
            (true, _) if self.less_than.is_some() => RequirementOperator::Lt,
            (true, true) => RequirementOperator::Exists,
            (true, false) => RequirementOperator::NotIn,
        }
    }

    /// True if `value` satisfies this requirement.
    pub fn has(&self, value: &str) -> bool {
        self.within_bounds(value) && (self.values.contains(value) != self.complement)
    }

    fn within_bounds(&self, value: &str) -> bool {
        if self.greater_than.is_none() && self.less_than.is_none() {
            return true;
        }
        let Ok(n) = value.trim().parse::<i64>() else {
            return false;
        };
        self.greater_than.is_none_or(|gt| n > gt) && self.less_than.is_none_or(|lt| n < lt)
    }

    fn bounds_empty(&self) -> bool {
        match (self.greater_than, self.less_than) {
            (Some(gt), Some(lt)) => lt.saturating_sub(gt) <= 1,
            _ => false,
        }
    }

    /// The set of values allowed by both requirements.
    pub fn intersection(&self, other: &Requirement) -> Requirement {
        let greater_than = self.greater_than.max(other.greater_than);
        let less_than = match (self.less_than, other.less_than) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let (complement, values) = match (self.complement, other.complement) {
            (true, true) => (true, self.values.union(&other.values).cloned().collect()),
            (true, false) => (false, other.values.difference(&self.values).cloned().collect()),
            (false, true) => (false, self.values.difference(&other.values).cloned().collect()),
            (false, false) => (false, self.values.intersection(&other.values).cloned().collect()),
        };

        let mut result = Requirement {
            key: self.key.clone(),
            complement,
            values,
            greater_than,
            less_than,
            min_values: self.min_values.max(other.min_values),
        };
        if !result.complement {
            let bounded = result.clone();
            result.values.retain(|v| bounded.within_bounds(v));
        }
        result
    }

    /// Number of allowed values; `usize::MAX` for an unbounded set.
    pub fn len(&self) -> usize {
        if self.complement {
            if self.bounds_empty() { 0 } else { usize::MAX }
        } else {
            self.values.iter().filter(|v| self.within_bounds(v)).count()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allowed values of a finite set, in order.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }
}

/// Requirements keyed by label. Adding a second requirement on a key
/// narrows it to the intersection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements(BTreeMap<String, Requirement>);

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_claim(requirements: &[ClaimRequirement]) -> CapacityResult<Self> {
        let mut result = Self::new();
        for req in requirements {
            result.add(Requirement::from_claim(req)?);
        }
        Ok(result)
    }

    /// One `In` requirement per label.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        let mut result = Self::new();
        for (key, value) in labels {
            result.add(Requirement::in_values(key, [value.as_str()]));
        }
        result
    }

    pub fn add(&mut self, requirement: Requirement) {
        let merged = match self.0.get(&requirement.key) {
            Some(existing) => existing.intersection(&requirement),
            None => requirement,
        };
        self.0.insert(merged.key.clone(), merged);
    }

    pub fn get(&self, key: &str) -> Option<&Requirement> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check that every key constrained on both sides can be satisfied at
    /// once. Keys present on only one side are unconstrained.
    ///
    /// Returns the first incompatible key with a reason.
    pub fn compatible(&self, other: &Requirements) -> Result<(), String> {
        for (key, ours) in &self.0 {
            let Some(theirs) = other.0.get(key) else {
                continue;
            };
            let shared = ours.intersection(theirs);
            let count = shared.len();

            if count == 0 {
                // Two exclusions on the same key are satisfied by the label's absence.
                let excludes = |r: &Requirement| {
                    matches!(
                        r.operator(),
                        RequirementOperator::NotIn | RequirementOperator::DoesNotExist
                    )
                };
                if excludes(ours) && excludes(theirs) {
                    continue;
                }
                return Err(format!(
                    "key {key}: {:?} does not intersect {:?}",
                    ours.operator(),
                    theirs.operator()
                ));
            }
            match shared.min_values {
                Some(min) if count < min => {
                    return Err(format!(
                        "key {key}: {count} compatible value(s), minimum is {min}"
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn is_compatible(&self, other: &Requirements) -> bool {
        self.compatible(other).is_ok()
    }
}

impl FromIterator<Requirement> for Requirements {
    fn from_iter<T: IntoIterator<Item = Requirement>>(iter: T) -> Self {
        let mut result = Self::new();
        for req in iter {
            result.add(req);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reqs(items: Vec<Requirement>) -> Requirements {
        items.into_iter().collect()
    }

    #[test]
    fn operators_round_trip_through_value_sets() {
        assert_eq!(Requirement::in_values("k", ["a"]).operator(), RequirementOperator::In);
        assert_eq!(Requirement::not_in("k", ["a"]).operator(), RequirementOperator::NotIn);
        assert_eq!(Requirement::exists("k").operator(), RequirementOperator::Exists);
        assert_eq!(
            Requirement::does_not_exist("k").operator(),
            RequirementOperator::DoesNotExist
        );
        assert_eq!(Requirement::greater_than("k", 1).operator(), RequirementOperator::Gt);
        assert_eq!(Requirement::less_than("k", 1).operator(), RequirementOperator::Lt);
    }

    #[test]
    fn in_sets_must_overlap() {
        let claim = reqs(vec![Requirement::in_values("size", ["big", "huge"])]);
        assert!(claim.is_compatible(&reqs(vec![Requirement::in_values("size", ["big"])])));
        assert!(!claim.is_compatible(&reqs(vec![Requirement::in_values("size", ["small"])])));
    }

    #[test]
    fn absent_keys_are_unconstrained() {
        let claim = reqs(vec![Requirement::in_values("zone", ["east"])]);
        let group = reqs(vec![Requirement::in_values("size", ["big"])]);
        assert!(claim.is_compatible(&group));
        assert!(group.is_compatible(&claim));
        assert!(Requirements::new().is_compatible(&group));
    }

    #[test]
    fn not_in_and_exists() {
        let group = reqs(vec![Requirement::in_values("size", ["big"])]);
        assert!(!reqs(vec![Requirement::not_in("size", ["big"])]).is_compatible(&group));
        assert!(reqs(vec![Requirement::not_in("size", ["small"])]).is_compatible(&group));
        assert!(reqs(vec![Requirement::exists("size")]).is_compatible(&group));
        assert!(!reqs(vec![Requirement::does_not_exist("size")]).is_compatible(&group));
    }

    #[test]
    fn exclusions_on_both_sides_are_compatible() {
        let a = reqs(vec![Requirement::does_not_exist("gpu")]);
        let b = reqs(vec![Requirement::not_in("gpu", ["a100"])]);
        assert!(a.is_compatible(&b));
        assert!(a.is_compatible(&a));
    }

    #[test]
    fn numeric_bounds() {
        let group = reqs(vec![Requirement::in_values("cpu", ["4"])]);
        assert!(reqs(vec![Requirement::greater_than("cpu", 2)]).is_compatible(&group));
        assert!(!reqs(vec![Requirement::greater_than("cpu", 4)]).is_compatible(&group));
        assert!(reqs(vec![Requirement::less_than("cpu", 8)]).is_compatible(&group));

        let not_numeric = reqs(vec![Requirement::in_values("cpu", ["four"])]);
        assert!(!reqs(vec![Requirement::greater_than("cpu", 2)]).is_compatible(&not_numeric));

        // Gt 4 and Lt 5 leave no integer.
        let empty = Requirement::greater_than("cpu", 4).intersection(&Requirement::less_than("cpu", 5));
        assert!(empty.is_empty());
    }

    #[test]
    fn min_values_counts_shared_values() {
        let claim = reqs(vec![
            Requirement::in_values("family", ["a", "b", "c"]).with_min_values(2),
        ]);
        assert!(claim.is_compatible(&reqs(vec![Requirement::in_values("family", ["a", "b"])])));
        let err = claim
            .compatible(&reqs(vec![Requirement::in_values("family", ["a"])]))
            .unwrap_err();
        assert!(err.contains("minimum is 2"), "{err}");
    }

    #[test]
    fn add_narrows_to_intersection() {
        let mut r = Requirements::new();
        r.add(Requirement::in_values("zone", ["east", "west"]));
        r.add(Requirement::not_in("zone", ["west"]));
        let zone = r.get("zone").unwrap();
        assert_eq!(zone.values().collect::<Vec<_>>(), vec!["east"]);
        assert_eq!(zone.operator(), RequirementOperator::In);
    }

    #[test]
    fn converts_claim_requirements() {
        let claim = vec![
            ClaimRequirement::new("size", RequirementOperator::In, ["big"]).with_min_values(1),
            ClaimRequirement::new("cpu", RequirementOperator::Gt, ["2"]),
        ];
        let r = Requirements::from_claim(&claim).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r.get("size").unwrap().min_values, Some(1));
        assert!(r.get("cpu").unwrap().has("3"));
        assert!(!r.get("cpu").unwrap().has("2"));
    }

    #[test]
    fn rejects_malformed_claim_requirements() {
        let bad_bound = ClaimRequirement::new("cpu", RequirementOperator::Gt, ["lots"]);
        assert!(matches!(
            Requirement::from_claim(&bad_bound),
            Err(CapacityError::InvalidRequirement { .. })
        ));
        let empty_in = ClaimRequirement::new("size", RequirementOperator::In, Vec::<String>::new());
        assert!(Requirement::from_claim(&empty_in).is_err());
    }
}
