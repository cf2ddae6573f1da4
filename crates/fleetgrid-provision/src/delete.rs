//! Delete: mark the claim's unit for deletion, then give its replica back.

use fleetgrid_store::{Claim, Unit};
use tracing::{debug, error, info};

use crate::cancel::Cancel;
use crate::error::{ProvisionError, ProvisionResult};
use crate::provider::{ClusterApiProvider, parse_binding};
use crate::units::is_deleting;

impl ClusterApiProvider {
    pub(crate) async fn delete_claim(&self, claim: &Claim, cancel: &Cancel) -> ProvisionResult<()> {
        let _guard = self
            .lock_or_cancel(cancel, &format!("delete claim {}", claim.meta.name))
            .await?;

        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled(format!(
                "starting delete for claim {}",
                claim.meta.name
            )));
        }

        let mut unit = self.resolve_unit(claim).await?;
        let unit_key = unit.meta.table_key();
        if is_deleting(Some(&unit)) {
            debug!(claim = %claim.meta.name, unit = %unit_key, "unit already deleting");
            return Ok(());
        }

        let mut group = self.owning_group(&unit).await?;
        let group_key = group.meta.table_key();
        let replicas = group
            .replicas
            .ok_or_else(|| ProvisionError::UnmanagedGroup(group_key.clone()))?;
        if replicas == 0 {
            return Err(ProvisionError::ZeroReplicas(group_key));
        }

        // Mark first, so the fleet manager removes this unit and no other.
        let marked = self.units.add_delete_annotation(&mut unit).await?;

        group.replicas = Some(replicas - 1);
        if let Err(primary) = self.groups.update(&mut group).await {
            if !marked {
                return Err(primary);
            }
            return match self.units.remove_delete_annotation(&mut unit).await {
                Ok(_) => Err(primary),
                Err(cleanup) => {
                    error!(
                        unit = %unit_key,
                        group = %group_key,
                        error = %cleanup,
                        "unit left marked for deletion without a replica decrement"
                    );
                    Err(ProvisionError::compensation_failed(primary, cleanup))
                }
            };
        }

        info!(
            claim = %claim.meta.name,
            unit = %unit_key,
            group = %group_key,
            from = replicas,
            to = replicas - 1,
            "released unit"
        );
        Ok(())
    }

    /// The unit behind a claim: by provider id when known, else by the bind
    /// annotation.
    async fn resolve_unit(&self, claim: &Claim) -> ProvisionResult<Unit> {
        let provider_id = claim.status.provider_id.as_str();
        let (found, name) = if !provider_id.is_empty() {
            (
                self.units.get_by_provider_id(provider_id).await?,
                format!("with provider id {provider_id}"),
            )
        } else if let Some(binding) = claim.binding() {
            let (namespace, name) = parse_binding(binding)?;
            (self.units.get(namespace, name).await?, binding.to_string())
        } else {
            return Err(ProvisionError::InvalidInput(format!(
                "claim {} has neither a provider id nor a unit binding",
                claim.meta.name
            )));
        };
        found.ok_or(ProvisionError::NotFound { kind: "Unit", name })
    }
}
