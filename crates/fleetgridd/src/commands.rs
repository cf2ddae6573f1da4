//! Subcommand implementations.

use std::path::Path;

use anyhow::Context;
use fleetgrid_provision::{
    Cancel, CapacityProvider, ClaimPool, ClusterApiProvider, ReadinessReconciler,
};
use fleetgrid_store::{CapacityClass, Claim, ClassRef, Object, ObjectStore, ScalableGroup, Unit};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Settings;

pub async fn serve(store: ObjectStore, settings: &Settings) -> anyhow::Result<()> {
    info!("fleetgridd serving");

    let reconciler = ReadinessReconciler::new(store);
    let interval = settings.readiness_interval;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let readiness_handle = tokio::spawn(async move {
        reconciler.run(interval, shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = readiness_handle.await;

    info!("fleetgridd stopped");
    Ok(())
}

pub async fn create(store: ObjectStore, settings: &Settings, name: &str) -> anyhow::Result<()> {
    let claim: Claim = store
        .get("", name)
        .with_context(|| format!("loading claim {name}"))?;
    let provider = provider(store.clone(), settings);

    let mut claim = provider.create(claim, &interrupt_cancel()).await?;
    store
        .update(&mut claim)
        .with_context(|| format!("saving status of claim {name}"))?;
    print_json(&claim)
}

pub async fn delete(store: ObjectStore, settings: &Settings, name: &str) -> anyhow::Result<()> {
    let claim: Claim = store
        .get("", name)
        .with_context(|| format!("loading claim {name}"))?;
    let provider = provider(store, settings);
    provider.delete(&claim, &interrupt_cancel()).await?;
    info!(claim = %name, "claim released");
    Ok(())
}

pub async fn get(store: ObjectStore, provider_id: &str) -> anyhow::Result<()> {
    let provider = ClusterApiProvider::from_store(store);
    print_json(&provider.get(provider_id).await?)
}

pub async fn list(store: ObjectStore) -> anyhow::Result<()> {
    let provider = ClusterApiProvider::from_store(store);
    print_json(&provider.list().await?)
}

pub async fn instance_types(store: ObjectStore, class: &str) -> anyhow::Result<()> {
    let provider = ClusterApiProvider::from_store(store);
    let pool = ClaimPool {
        name: class.to_string(),
        class_ref: Some(ClassRef {
            name: class.to_string(),
        }),
    };
    print_json(&provider.get_instance_types(&pool).await?)
}

/// Objects to load with `apply`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Manifest {
    pub groups: Vec<ScalableGroup>,
    pub units: Vec<Unit>,
    pub classes: Vec<CapacityClass>,
    pub claims: Vec<Claim>,
}

pub fn apply(store: &ObjectStore, path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let manifest: Manifest = serde_json::from_str(&content)
        .with_context(|| format!("parsing manifest {}", path.display()))?;

    let mut written = 0;
    written += upsert_all(store, manifest.classes)?;
    written += upsert_all(store, manifest.groups)?;
    written += upsert_all(store, manifest.units)?;
    written += upsert_all(store, manifest.claims)?;
    info!(objects = written, path = %path.display(), "manifest applied");
    Ok(())
}

/// Create each object, or overwrite the stored one.
fn upsert_all<T: Object>(store: &ObjectStore, objects: Vec<T>) -> anyhow::Result<usize> {
    let count = objects.len();
    for mut object in objects {
        let (namespace, name) = (object.meta().namespace.clone(), object.meta().name.clone());
        match store.get::<T>(&namespace, &name) {
            Ok(existing) => {
                object.meta_mut().resource_version = existing.meta().resource_version;
                store
                    .update(&mut object)
                    .with_context(|| format!("updating {} {namespace}/{name}", T::KIND))?;
            }
            Err(e) if e.is_not_found() => {
                store
                    .create(&mut object)
                    .with_context(|| format!("creating {} {namespace}/{name}", T::KIND))?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(count)
}

fn provider(store: ObjectStore, settings: &Settings) -> ClusterApiProvider {
    ClusterApiProvider::from_store(store).with_poll_config(settings.poll)
}

/// A cancel that fires on Ctrl-C.
fn interrupt_cancel() -> Cancel {
    let (handle, cancel) = Cancel::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            handle.cancel();
        }
    });
    cancel
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_creates_then_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open_in_memory().unwrap();
        let path = dir.path().join("fleet.json");
        std::fs::write(
            &path,
            r#"{
                "classes": [{"meta": {"name": "general"}}],
                "groups": [{"meta": {"name": "md-1", "namespace": "capi"}, "replicas": 1}]
            }"#,
        )
        .unwrap();

        apply(&store, &path).unwrap();
        let group: ScalableGroup = store.get("capi", "md-1").unwrap();
        assert_eq!(group.replicas, Some(1));
        assert!(store.get::<CapacityClass>("", "general").is_ok());

        std::fs::write(
            &path,
            r#"{"groups": [{"meta": {"name": "md-1", "namespace": "capi"}, "replicas": 4}]}"#,
        )
        .unwrap();
        apply(&store, &path).unwrap();
        let group: ScalableGroup = store.get("capi", "md-1").unwrap();
        assert_eq!(group.replicas, Some(4));
        assert_eq!(group.meta.resource_version, 2);
    }

    #[test]
    fn apply_rejects_unknown_sections() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open_in_memory().unwrap();
        let path = dir.path().join("fleet.json");
        std::fs::write(&path, r#"{"machines": []}"#).unwrap();

        let err = apply(&store, &path).unwrap_err();
        assert!(err.to_string().contains("fleet.json"));
    }
}
