//! Reservation of one unit of capacity from a scalable group.
//!
//! A reservation moves through three states:
//!
//! ```text
//! Requested ──discover──▶ Discovered ──bind──▶ Bound
//!     │                       │
//!     └────── rollback ◀──────┘
//! ```
//!
//! `Requested` means the group's replica count has been raised by one.
//! `Discovered` means a fresh unit of that group has been found and
//! labeled as ours. `Bound` means the claim's bind annotation is durable;
//! from then on the reservation is no longer rolled back.

use std::time::Duration;

use fleetgrid_store::{
    DELETE_UNIT_ANNOTATION, LabelSelector, MEMBERSHIP_LABEL, OWNER_GROUP_LABEL, Unit, epoch_secs,
    object_key,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cancel::Cancel;
use crate::error::{ProvisionError, ProvisionResult};
use crate::groups::GroupProvider;
use crate::units::{UnitProvider, is_deleting};

/// How the engine waits for the fleet manager to create a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Pause between checks. The first check happens immediately.
    pub interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Requested,
    Discovered,
    Bound,
}

/// One replica reserved from a group, tracked until bound or rolled back.
pub struct Reservation<'a> {
    groups: &'a dyn GroupProvider,
    units: &'a dyn UnitProvider,
    namespace: String,
    group: String,
    original_replicas: u32,
    state: ReservationState,
    unit: Option<Unit>,
}

impl<'a> Reservation<'a> {
    /// Raise the group's replica count by one.
    ///
    /// On error nothing was changed and there is nothing to roll back.
    pub async fn request(
        groups: &'a dyn GroupProvider,
        units: &'a dyn UnitProvider,
        namespace: &str,
        group_name: &str,
    ) -> ProvisionResult<Reservation<'a>> {
        let key = object_key(namespace, group_name);
        let mut group = groups.get(namespace, group_name).await?;
        let original = group
            .replicas
            .ok_or_else(|| ProvisionError::UnmanagedGroup(key.clone()))?;
        let requested = original
            .checked_add(1)
            .ok_or_else(|| ProvisionError::InvalidInput(format!("group {key} replica count overflow")))?;

        group.replicas = Some(requested);
        groups.update(&mut group).await?;
        info!(group = %key, from = original, to = requested, "reserved one replica");

        Ok(Reservation {
            groups,
            units,
            namespace: namespace.to_string(),
            group: group_name.to_string(),
            original_replicas: original,
            state: ReservationState::Requested,
            unit: None,
        })
    }

    pub fn state(&self) -> ReservationState {
        self.state
    }

    pub fn original_replicas(&self) -> u32 {
        self.original_replicas
    }

    fn group_key(&self) -> String {
        object_key(&self.namespace, &self.group)
    }

    /// Wait for an unclaimed unit of the group and label it as ours.
    ///
    /// Checks immediately, then every `poll.interval` until `poll.timeout`.
    /// Units without the membership label that belong to the group are
    /// candidates; deleting units are skipped; the first in list order wins.
    pub async fn discover(&mut self, poll: &PollConfig, cancel: &Cancel) -> ProvisionResult<&Unit> {
        let selector = LabelSelector::everything()
            .does_not_exist(MEMBERSHIP_LABEL)
            .key_in(OWNER_GROUP_LABEL, [self.group.as_str()]);
        let started = Instant::now();
        let deadline = started + poll.timeout;

        let mut unit = loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled(format!(
                    "waiting for a unit of group {}",
                    self.group_key()
                )));
            }

            let candidates = self.units.list(Some(&selector)).await?;
            if let Some(unit) = candidates
                .into_iter()
                .find(|u| u.meta.namespace == self.namespace && !is_deleting(Some(u)))
            {
                break unit;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProvisionError::UnitNotDiscovered {
                    group: self.group_key(),
                    waited: poll.timeout,
                });
            }
            debug!(group = %self.group_key(), "no unclaimed unit yet");

            tokio::select! {
                _ = tokio::time::sleep(poll.interval.min(deadline - now)) => {}
                _ = cancel.cancelled() => {
                    return Err(ProvisionError::Cancelled(format!(
                        "waiting for a unit of group {}",
                        self.group_key()
                    )));
                }
            }
        };

        unit.meta
            .labels
            .insert(MEMBERSHIP_LABEL.to_string(), String::new());
        if let Err(e) = self.units.update(&mut unit).await {
            // Remembered so a rollback still marks it for deletion.
            self.unit = Some(unit);
            return Err(e);
        }

        info!(
            group = %self.group_key(),
            unit = %unit.meta.table_key(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "claimed unit"
        );
        self.state = ReservationState::Discovered;
        Ok(self.unit.insert(unit))
    }

    /// The bind annotation is durable; the reservation is complete.
    pub fn bind(mut self) -> Option<Unit> {
        self.state = ReservationState::Bound;
        self.unit.take()
    }

    /// Undo the reservation after `primary` failed, then return the error
    /// to report.
    ///
    /// A discovered unit loses its membership label and is marked for
    /// deletion, so the fleet manager removes that unit when the replica
    /// count drops. The replica count is restored only once the unit (if
    /// any) is marked; restoring it without the mark could remove a unit
    /// some other claim is bound to.
    pub async fn rollback(mut self, primary: ProvisionError) -> ProvisionError {
        let key = self.group_key();
        warn!(group = %key, error = %primary, "rolling back reservation");

        if let Some(unit) = self.unit.take() {
            if let Err(cleanup) = self.release_unit(&unit).await {
                error!(
                    group = %key,
                    unit = %unit.meta.table_key(),
                    error = %cleanup,
                    "rollback could not release unit; replica count left raised"
                );
                return ProvisionError::compensation_failed(primary, cleanup);
            }
        }

        match self.restore_replicas().await {
            Ok(()) => {
                info!(group = %key, replicas = self.original_replicas, "reservation rolled back");
                primary
            }
            Err(cleanup) => {
                error!(group = %key, error = %cleanup, "rollback could not restore replica count");
                ProvisionError::compensation_failed(primary, cleanup)
            }
        }
    }

    /// Drop the membership label and mark the unit for deletion, starting
    /// from the stored copy. The copy held since discovery may be stale: the
    /// label write it came from typically failed on a conflict.
    async fn release_unit(&self, discovered: &Unit) -> ProvisionResult<()> {
        let (namespace, name) = (&discovered.meta.namespace, &discovered.meta.name);
        let Some(mut unit) = self.units.get(namespace, name).await? else {
            debug!(unit = %discovered.meta.table_key(), "unit already gone");
            return Ok(());
        };
        let had_label = unit.meta.labels.remove(MEMBERSHIP_LABEL).is_some();
        let had_mark = unit.meta.annotations.contains_key(DELETE_UNIT_ANNOTATION);
        if !had_mark {
            unit.meta
                .annotations
                .insert(DELETE_UNIT_ANNOTATION.to_string(), epoch_secs().to_string());
        }
        if had_label || !had_mark {
            self.units.update(&mut unit).await?;
        }
        Ok(())
    }

    async fn restore_replicas(&self) -> ProvisionResult<()> {
        let mut group = self.groups.get(&self.namespace, &self.group).await?;
        group.replicas = Some(self.original_replicas);
        self.groups.update(&mut group).await
    }
}
