//! Create: select a group, reserve a replica, wait for the unit, bind.

use std::cmp::Ordering;

use fleetgrid_capacity::{InstanceType, Requirements, group_to_instance_type};
use fleetgrid_store::{BIND_ANNOTATION, Claim, Unit};
use tracing::{info, warn};

use crate::cancel::Cancel;
use crate::error::{ProvisionError, ProvisionResult};
use crate::provider::{ClusterApiProvider, parse_binding};
use crate::reservation::Reservation;

/// Group order among equally eligible candidates: case-insensitive group
/// name, then namespace, then exact name.
pub(crate) fn tie_break(a: &InstanceType, b: &InstanceType) -> Ordering {
    a.group_name
        .to_lowercase()
        .cmp(&b.group_name.to_lowercase())
        .then_with(|| a.group_namespace.cmp(&b.group_namespace))
        .then_with(|| a.group_name.cmp(&b.group_name))
}

impl ClusterApiProvider {
    pub(crate) async fn create_claim(&self, claim: Claim, cancel: &Cancel) -> ProvisionResult<Claim> {
        let _guard = self
            .lock_or_cancel(cancel, &format!("create claim {}", claim.meta.name))
            .await?;

        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled(format!(
                "starting create for claim {}",
                claim.meta.name
            )));
        }

        // A bound claim is a retry: finish from the existing binding.
        if let Some(binding) = claim.binding() {
            let binding = binding.to_string();
            return self.resume(claim, &binding).await;
        }

        let class = self
            .resolve_class(
                claim.spec.class_ref.as_ref(),
                &format!("claim {}", claim.meta.name),
            )
            .await?;
        let instance_types = self.instance_types_for_class(&class).await?;
        let requirements = Requirements::from_claim(&claim.spec.requirements).map_err(|e| {
            ProvisionError::capacity(format!("reading requirements of claim {}", claim.meta.name), e)
        })?;

        let chosen = instance_types
            .iter()
            .filter(|it| it.admits(&requirements, &claim.spec.requests))
            .min_by(|a, b| tie_break(a, b))
            .ok_or_else(|| {
                ProvisionError::InsufficientCapacity(format!(
                    "no compatible scalable group for claim {} among {} selected by class {}",
                    claim.meta.name,
                    instance_types.len(),
                    class.meta.name
                ))
            })?;
        info!(
            claim = %claim.meta.name,
            group = %chosen.group_name,
            namespace = %chosen.group_namespace,
            "selected group"
        );

        let reservation = Reservation::request(
            self.groups.as_ref(),
            self.units.as_ref(),
            &chosen.group_namespace,
            &chosen.group_name,
        )
        .await?;
        let (claim, unit) = self.claim_unit(claim, reservation, cancel).await?;
        self.populate(claim, &unit, chosen)
    }

    /// Discover a unit for the reservation and bind the claim to it. Any
    /// failure before the binding is written rolls the reservation back.
    async fn claim_unit(
        &self,
        mut claim: Claim,
        mut reservation: Reservation<'_>,
        cancel: &Cancel,
    ) -> ProvisionResult<(Claim, Unit)> {
        let discovered = reservation
            .discover(&self.poll, cancel)
            .await
            .map(|unit| unit.meta.table_key());
        let unit_key = match discovered {
            Ok(key) => key,
            Err(e) => return Err(reservation.rollback(e).await),
        };

        if cancel.is_cancelled() {
            let err = ProvisionError::Cancelled(format!("binding claim {}", claim.meta.name));
            return Err(reservation.rollback(err).await);
        }

        claim
            .meta
            .annotations
            .insert(BIND_ANNOTATION.to_string(), unit_key.clone());
        if let Err(e) = self.claims.update_claim(&mut claim).await {
            claim.meta.annotations.remove(BIND_ANNOTATION);
            return Err(reservation.rollback(e).await);
        }
        info!(claim = %claim.meta.name, unit = %unit_key, "claim bound");

        let unit = reservation.bind().ok_or_else(|| {
            ProvisionError::InvalidInput(format!("reservation for claim {} lost its unit", claim.meta.name))
        })?;
        Ok((claim, unit))
    }

    /// Complete a claim that is already bound, without reserving anything.
    async fn resume(&self, claim: Claim, binding: &str) -> ProvisionResult<Claim> {
        let (namespace, name) = parse_binding(binding)?;
        let unit = self
            .units
            .get(namespace, name)
            .await?
            .ok_or_else(|| ProvisionError::NotFound {
                kind: "Unit",
                name: binding.to_string(),
            })?;
        let group = self.owning_group(&unit).await?;
        let instance_type = group_to_instance_type(&group, &self.policy).map_err(|e| {
            ProvisionError::capacity(format!("translating group {}", group.meta.table_key()), e)
        })?;
        info!(claim = %claim.meta.name, unit = %binding, "resuming bound claim");
        self.populate(claim, &unit, &instance_type)
    }

    /// Fill in the claim's status from the bound unit and its group.
    fn populate(
        &self,
        mut claim: Claim,
        unit: &Unit,
        instance_type: &InstanceType,
    ) -> ProvisionResult<Claim> {
        let Some(provider_id) = unit.provider_id.as_deref().filter(|id| !id.is_empty()) else {
            // The binding stays; the next Create resumes from it.
            warn!(
                claim = %claim.meta.name,
                unit = %unit.meta.table_key(),
                "bound unit has no provider id yet"
            );
            return Err(ProvisionError::MissingProviderId(unit.meta.table_key()));
        };

        claim.status.provider_id = provider_id.to_string();
        claim.status.capacity = instance_type.capacity.clone();
        claim.status.allocatable = instance_type.allocatable();
        claim.meta.labels.extend(
            instance_type
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Ok(claim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_capacity::{LabelPolicy, group_to_instance_type};
    use fleetgrid_store::ScalableGroup;

    fn instance_type(namespace: &str, name: &str) -> InstanceType {
        group_to_instance_type(
            &ScalableGroup::new(namespace, name, Some(1)),
            &LabelPolicy::cluster_api(),
        )
        .unwrap()
    }

    #[test]
    fn tie_break_ignores_case_then_uses_namespace() {
        let mut types = vec![
            instance_type("ns", "b-group"),
            instance_type("ns", "A-group"),
            instance_type("ns", "a-group"),
            instance_type("aa", "a-group"),
        ];
        types.sort_by(tie_break);
        let order: Vec<(&str, &str)> = types
            .iter()
            .map(|t| (t.group_namespace.as_str(), t.group_name.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("aa", "a-group"),
                ("ns", "A-group"),
                ("ns", "a-group"),
                ("ns", "b-group"),
            ]
        );
    }
}
