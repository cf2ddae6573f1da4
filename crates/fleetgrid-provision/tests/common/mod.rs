//! Shared fixtures for the provisioning integration tests.
//!
//! Everything runs in-process against an in-memory object store. [`Fleet`]
//! plays the external fleet manager; the `Faulty*` wrappers fail chosen
//! write calls.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use fleetgrid_capacity::translate::{CPU_ANNOTATION, MEMORY_ANNOTATION};
use fleetgrid_provision::*;
use fleetgrid_store::*;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const NS: &str = "capi";
pub const CLASS: &str = "general";

pub fn fast_poll() -> PollConfig {
    PollConfig {
        interval: Duration::from_millis(5),
        timeout: Duration::from_millis(150),
    }
}

/// A store holding the `general` class, which selects `pool=general` groups.
pub fn test_store() -> ObjectStore {
    let store = ObjectStore::open_in_memory().unwrap();
    store
        .create(&mut CapacityClass::new(
            CLASS,
            Some(LabelSelector::everything().with_label("pool", "general")),
        ))
        .unwrap();
    store
}

pub fn add_group(store: &ObjectStore, name: &str, replicas: Option<u32>, cpu: &str, memory: &str) {
    let mut group = ScalableGroup::new(NS, name, replicas);
    group.meta.labels.insert("pool".to_string(), "general".to_string());
    group
        .meta
        .annotations
        .insert(CPU_ANNOTATION.to_string(), cpu.to_string());
    group
        .meta
        .annotations
        .insert(MEMORY_ANNOTATION.to_string(), memory.to_string());
    store.create(&mut group).unwrap();
}

/// A unit of `group`, optionally claimed, with a provider id unless `None`.
pub fn add_unit(store: &ObjectStore, group: &str, name: &str, member: bool, provider_id: Option<&str>) {
    let mut unit = Unit::new(NS, name, group);
    if member {
        unit.meta
            .labels
            .insert(MEMBERSHIP_LABEL.to_string(), String::new());
    }
    unit.provider_id = provider_id.map(str::to_string);
    store.create(&mut unit).unwrap();
}

/// A stored claim on the `general` class requesting `cpu`.
pub fn add_claim(store: &ObjectStore, name: &str, cpu: &str) -> Claim {
    let mut claim = Claim::new(name, CLASS);
    claim
        .spec
        .requests
        .insert("cpu".to_string(), Quantity::parse(cpu).unwrap());
    store.create(&mut claim).unwrap();
    claim
}

pub fn replicas(store: &ObjectStore, group: &str) -> Option<u32> {
    store.get::<ScalableGroup>(NS, group).unwrap().replicas
}

pub fn unit(store: &ObjectStore, name: &str) -> Unit {
    store.get(NS, name).unwrap()
}

pub fn provider(store: &ObjectStore) -> ClusterApiProvider {
    ClusterApiProvider::from_store(store.clone()).with_poll_config(fast_poll())
}

// ── Fault injection ───────────────────────────────────────────────

/// Fails the listed calls, counted from 1.
pub struct FailAt {
    calls: AtomicUsize,
    fail: Vec<usize>,
}

impl FailAt {
    pub fn new(fail: &[usize]) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: fail.to_vec(),
        }
    }

    pub fn check(&self, what: &str) -> ProvisionResult<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.contains(&n) {
            return Err(ProvisionError::store(
                format!("{what} #{n}"),
                StoreError::Write("injected failure".to_string()),
            ));
        }
        Ok(())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub struct FaultyGroups {
    inner: StoreGroupProvider,
    pub updates: FailAt,
}

impl GroupProvider for FaultyGroups {
    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, ProvisionResult<ScalableGroup>> {
        self.inner.get(namespace, name)
    }

    fn list<'a>(
        &'a self,
        selector: Option<&'a LabelSelector>,
    ) -> BoxFuture<'a, ProvisionResult<Vec<ScalableGroup>>> {
        self.inner.list(selector)
    }

    fn update<'a>(&'a self, group: &'a mut ScalableGroup) -> BoxFuture<'a, ProvisionResult<()>> {
        Box::pin(async move {
            self.updates.check("group update")?;
            self.inner.update(group).await
        })
    }
}

pub struct FaultyUnits {
    inner: StoreUnitProvider,
    pub updates: FailAt,
}

impl UnitProvider for FaultyUnits {
    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, ProvisionResult<Option<Unit>>> {
        self.inner.get(namespace, name)
    }

    fn get_by_provider_id<'a>(&'a self, provider_id: &'a str) -> BoxFuture<'a, ProvisionResult<Option<Unit>>> {
        self.inner.get_by_provider_id(provider_id)
    }

    fn list<'a>(&'a self, selector: Option<&'a LabelSelector>) -> BoxFuture<'a, ProvisionResult<Vec<Unit>>> {
        self.inner.list(selector)
    }

    fn update<'a>(&'a self, unit: &'a mut Unit) -> BoxFuture<'a, ProvisionResult<()>> {
        Box::pin(async move {
            self.updates.check("unit update")?;
            self.inner.update(unit).await
        })
    }
}

pub struct FaultyClaims {
    inner: StoreClaimStore,
    pub updates: FailAt,
}

impl ClaimStore for FaultyClaims {
    fn get_class<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ProvisionResult<CapacityClass>> {
        self.inner.get_class(name)
    }

    fn update_claim<'a>(&'a self, claim: &'a mut Claim) -> BoxFuture<'a, ProvisionResult<()>> {
        Box::pin(async move {
            self.updates.check("claim update")?;
            self.inner.update_claim(claim).await
        })
    }
}

/// Which write calls to fail, per collaborator.
#[derive(Default)]
pub struct Faults {
    pub group_updates: Vec<usize>,
    pub unit_updates: Vec<usize>,
    pub claim_updates: Vec<usize>,
}

pub fn faulty_provider(store: &ObjectStore, faults: Faults) -> ClusterApiProvider {
    let groups = Arc::new(FaultyGroups {
        inner: StoreGroupProvider::new(store.clone()),
        updates: FailAt::new(&faults.group_updates),
    });
    let units = Arc::new(FaultyUnits {
        inner: StoreUnitProvider::new(store.clone()),
        updates: FailAt::new(&faults.unit_updates),
    });
    let claims = Arc::new(FaultyClaims {
        inner: StoreClaimStore::new(store.clone()),
        updates: FailAt::new(&faults.claim_updates),
    });
    ClusterApiProvider::new(groups, units, claims).with_poll_config(fast_poll())
}

/// Lets the fleet manager win a race: before the first unit write, the
/// stored copy of that unit is rewritten with `provider_id`, so the write
/// conflicts.
pub struct RacingUnits {
    store: ObjectStore,
    inner: StoreUnitProvider,
    provider_id: String,
    raced: AtomicBool,
}

impl UnitProvider for RacingUnits {
    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, ProvisionResult<Option<Unit>>> {
        self.inner.get(namespace, name)
    }

    fn get_by_provider_id<'a>(&'a self, provider_id: &'a str) -> BoxFuture<'a, ProvisionResult<Option<Unit>>> {
        self.inner.get_by_provider_id(provider_id)
    }

    fn list<'a>(&'a self, selector: Option<&'a LabelSelector>) -> BoxFuture<'a, ProvisionResult<Vec<Unit>>> {
        self.inner.list(selector)
    }

    fn update<'a>(&'a self, unit: &'a mut Unit) -> BoxFuture<'a, ProvisionResult<()>> {
        Box::pin(async move {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let mut stored: Unit = self.store.get(&unit.meta.namespace, &unit.meta.name).unwrap();
                stored.provider_id = Some(self.provider_id.clone());
                self.store.update(&mut stored).unwrap();
            }
            self.inner.update(unit).await
        })
    }
}

/// A provider whose first unit write loses a race with the fleet manager.
pub fn racing_provider(store: &ObjectStore, provider_id: &str) -> ClusterApiProvider {
    let units = Arc::new(RacingUnits {
        store: store.clone(),
        inner: StoreUnitProvider::new(store.clone()),
        provider_id: provider_id.to_string(),
        raced: AtomicBool::new(false),
    });
    ClusterApiProvider::new(
        Arc::new(StoreGroupProvider::new(store.clone())),
        units,
        Arc::new(StoreClaimStore::new(store.clone())),
    )
    .with_poll_config(fast_poll())
}

// ── Fleet manager ─────────────────────────────────────────────────

/// Background task that keeps each managed group's unit count at its
/// replica count. New units get a provider id; on scale-down, units
/// marked for deletion go first.
pub struct Fleet {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Fleet {
    pub fn start(store: ObjectStore) -> Self {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut created = 0u64;
            loop {
                let _ = fleet_pass(&store, &mut created);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                    _ = rx.changed() => break,
                }
            }
        });
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

fn fleet_pass(store: &ObjectStore, created: &mut u64) -> StoreResult<()> {
    let groups: Vec<ScalableGroup> = store.list(None)?;
    for group in groups {
        let Some(desired) = group.replicas else {
            continue;
        };
        let desired = desired as usize;
        let selector =
            LabelSelector::everything().key_in(OWNER_GROUP_LABEL, [group.meta.name.as_str()]);
        let mut units: Vec<Unit> = store
            .list::<Unit>(Some(&selector))?
            .into_iter()
            .filter(|u| u.meta.namespace == group.meta.namespace)
            .collect();

        while units.len() < desired {
            *created += 1;
            let name = format!("{}-fleet-{created}", group.meta.name);
            let mut unit = Unit::new(&group.meta.namespace, &name, &group.meta.name);
            unit.provider_id = Some(format!("fleet:///{}/{name}", group.meta.namespace));
            store.create(&mut unit)?;
            units.push(unit);
        }

        if units.len() > desired {
            units.sort_by_key(|u| !u.meta.annotations.contains_key(DELETE_UNIT_ANNOTATION));
            let excess = units.len() - desired;
            for unit in units.iter().take(excess) {
                store.delete::<Unit>(&unit.meta.namespace, &unit.meta.name)?;
            }
        }
    }
    Ok(())
}
