//! In-memory cluster store
//!
//! Mirrors the API server semantics the reconcilers depend on: merge patches,
//! resourceVersion bumps on every write, soft deletion while finalizers are
//! present and erasure once the last one is removed.

use super::{
    merge_json, replicas_patch, revision_patch, status_patch, status_removal, with_finalizer, without_finalizer,
};
use crate::crd::{
    LoadBalancer, LoadBalancerSet, LoadBalancerSetStatus, LoadBalancerStatus, StatusField, LOAD_BALANCER_LABEL,
};
use crate::domain::ports::{ClusterStore, ObjectKey};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Default)]
pub struct InMemoryStore {
    load_balancers: RwLock<BTreeMap<ObjectKey, LoadBalancer>>,
    sets: RwLock<BTreeMap<ObjectKey, LoadBalancerSet>>,
    version: AtomicU64,
    status_writes: AtomicU64,
    conflicts: AtomicU64,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn set_key(set: &LoadBalancerSet) -> ObjectKey {
    ObjectKey::new(set.namespace().unwrap_or_default(), set.name_any())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Status writes (patches and removals) so far
    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Stale writes that had to be reapplied on a newer version
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // LoadBalancers
    // -------------------------------------------------------------------------

    /// Create or replace a LoadBalancer, as a user applying a manifest would
    pub fn apply(&self, mut lb: LoadBalancer) -> LoadBalancer {
        let key = ObjectKey::of(&lb);
        let mut lbs = self.load_balancers.write();
        match lbs.get(&key) {
            Some(existing) => {
                lb.metadata.uid = existing.metadata.uid.clone();
                lb.metadata.finalizers = existing.metadata.finalizers.clone();
                lb.metadata.annotations = existing.metadata.annotations.clone();
                lb.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
                lb.status = existing.status.clone();
            }
            None => {
                lb.metadata.uid = Some(format!("uid-{}", key));
            }
        }
        lb.metadata.resource_version = Some(self.next_version());
        lbs.insert(key, lb.clone());
        lb
    }

    pub fn load_balancer(&self, key: &ObjectKey) -> Option<LoadBalancer> {
        self.load_balancers.read().get(key).cloned()
    }

    /// Request deletion; erased right away when no finalizer is present
    pub fn delete_load_balancer(&self, key: &ObjectKey) {
        let mut lbs = self.load_balancers.write();
        let Some(lb) = lbs.get_mut(key) else {
            return;
        };
        if lb.finalizers().is_empty() {
            lbs.remove(key);
            return;
        }
        lb.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        lb.metadata.resource_version = Some(self.next_version());
    }

    /// Simulate a concurrent writer touching the object
    pub fn touch(&self, key: &ObjectKey) {
        if let Some(lb) = self.load_balancers.write().get_mut(key) {
            lb.metadata.resource_version = Some(self.next_version());
        }
    }

    /// Apply the patch built by `patch`, rebuilding it on the latest version
    /// when `lb` is stale
    fn write(&self, lb: &LoadBalancer, patch: impl Fn(&LoadBalancer) -> Value) -> Result<LoadBalancer> {
        let key = ObjectKey::of(lb);
        let mut lbs = self.load_balancers.write();
        let current = lbs
            .get(&key)
            .ok_or_else(|| api_error(404, "NotFound", format!("loadbalancer {} not found", key)))?;
        let body = if current.resource_version() != lb.resource_version() {
            debug!("Conflict writing {}, reapplying on latest version", key);
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            patch(current)
        } else {
            patch(lb)
        };

        let mut value = serde_json::to_value(current)?;
        merge_json(&mut value, &body);
        let mut updated: LoadBalancer = serde_json::from_value(value)?;
        updated.metadata.resource_version = Some(self.next_version());

        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            lbs.remove(&key);
        } else {
            lbs.insert(key, updated.clone());
        }
        Ok(updated)
    }

    // -------------------------------------------------------------------------
    // LoadBalancerSets
    // -------------------------------------------------------------------------

    pub fn sets_of(&self, lb_name: &str) -> Vec<LoadBalancerSet> {
        self.sets
            .read()
            .values()
            .filter(|s| s.labels().get(LOAD_BALANCER_LABEL).map(String::as_str) == Some(lb_name))
            .cloned()
            .collect()
    }

    /// Report readiness the way the set controller would
    pub fn report_set_status(&self, namespace: &str, name: &str, replicas: i32, ready: i32) {
        if let Some(set) = self.sets.write().get_mut(&ObjectKey::new(namespace, name)) {
            set.status = Some(LoadBalancerSetStatus {
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                available_replicas: Some(ready),
            });
        }
    }

    /// Keep a set around after deletion until `release_set` is called
    pub fn hold_set(&self, namespace: &str, name: &str) {
        if let Some(set) = self.sets.write().get_mut(&ObjectKey::new(namespace, name)) {
            set.finalizers_mut().push("machines".to_string());
        }
    }

    pub fn release_set(&self, namespace: &str, name: &str) {
        let key = ObjectKey::new(namespace, name);
        let mut sets = self.sets.write();
        if let Some(set) = sets.get_mut(&key) {
            set.finalizers_mut().clear();
            if set.is_deleting() {
                sets.remove(&key);
            }
        }
    }

    /// Drop a set as if it was garbage collected
    pub fn remove_set(&self, namespace: &str, name: &str) {
        self.sets.write().remove(&ObjectKey::new(namespace, name));
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn get_load_balancer(&self, key: &ObjectKey) -> Result<Option<LoadBalancer>> {
        Ok(self.load_balancer(key))
    }

    async fn patch_status(&self, lb: &LoadBalancer, patch: &LoadBalancerStatus) -> Result<LoadBalancer> {
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        let body = status_patch(patch)?;
        self.write(lb, |_| body.clone())
    }

    async fn remove_status_fields(&self, lb: &LoadBalancer, fields: &[StatusField]) -> Result<LoadBalancer> {
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        let body = status_removal(fields);
        self.write(lb, |_| body.clone())
    }

    async fn set_revision(&self, lb: &LoadBalancer, revision: i64) -> Result<LoadBalancer> {
        let body = revision_patch(revision);
        self.write(lb, |_| body.clone())
    }

    async fn add_finalizer(&self, lb: &LoadBalancer, finalizer: &str) -> Result<LoadBalancer> {
        self.write(lb, |basis| with_finalizer(basis, finalizer))
    }

    async fn remove_finalizer(&self, lb: &LoadBalancer, finalizer: &str) -> Result<()> {
        self.write(lb, |basis| without_finalizer(basis, finalizer)).map(|_| ())
    }

    async fn list_sets(&self, lb: &LoadBalancer) -> Result<Vec<LoadBalancerSet>> {
        let namespace = lb.namespace().unwrap_or_default();
        Ok(self
            .sets_of(&lb.name_any())
            .into_iter()
            .filter(|s| s.namespace().as_deref() == Some(namespace.as_str()))
            .collect())
    }

    async fn create_set(&self, set: &LoadBalancerSet) -> Result<LoadBalancerSet> {
        let key = set_key(set);
        let mut sets = self.sets.write();
        if sets.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("loadbalancerset {} already exists", key)));
        }
        let mut created = set.clone();
        created.metadata.uid = Some(format!("uid-{}", key));
        created.metadata.resource_version = Some(self.next_version());
        sets.insert(key, created.clone());
        Ok(created)
    }

    async fn scale_set(&self, set: &LoadBalancerSet, replicas: i32) -> Result<()> {
        let key = set_key(set);
        let mut sets = self.sets.write();
        let current = sets
            .get_mut(&key)
            .ok_or_else(|| api_error(404, "NotFound", format!("loadbalancerset {} not found", key)))?;
        let mut value = serde_json::to_value(&*current)?;
        merge_json(&mut value, &replicas_patch(replicas));
        *current = serde_json::from_value(value)?;
        current.metadata.resource_version = Some(self.next_version());
        Ok(())
    }

    async fn delete_set(&self, set: &LoadBalancerSet) -> Result<()> {
        let key = set_key(set);
        let mut sets = self.sets.write();
        let Some(current) = sets.get_mut(&key) else {
            return Ok(());
        };
        if current.finalizers().is_empty() {
            sets.remove(&key);
        } else if current.metadata.deletion_timestamp.is_none() {
            current.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::load_balancer::fixtures;
    use crate::crd::LOAD_BALANCER_FINALIZER;

    #[tokio::test]
    async fn test_status_patch_and_removal() {
        let store = InMemoryStore::new();
        let lb = store.apply(fixtures::load_balancer("default", "web"));

        let lb = store
            .patch_status(
                &lb,
                &LoadBalancerStatus {
                    port_id: Some("p-1".into()),
                    port_name: Some("default/web".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(lb.status_or_default().port_id.as_deref(), Some("p-1"));

        let lb = store
            .remove_status_fields(&lb, &[StatusField::PortId])
            .await
            .unwrap();
        let status = lb.status_or_default();
        assert_eq!(status.port_id, None);
        assert_eq!(status.port_name.as_deref(), Some("default/web"));
        assert_eq!(store.status_writes(), 2);
    }

    #[tokio::test]
    async fn test_stale_write_is_reapplied() {
        let store = InMemoryStore::new();
        let key = ObjectKey::new("default", "web");
        let stale = store.apply(fixtures::load_balancer("default", "web"));
        let stale = store
            .patch_status(
                &stale,
                &LoadBalancerStatus {
                    security_group_name: Some("default/web".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.touch(&key);

        let lb = store
            .patch_status(
                &stale,
                &LoadBalancerStatus {
                    security_group_id: Some("sg-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(store.conflicts(), 1);
        let status = lb.status_or_default();
        assert_eq!(status.security_group_id.as_deref(), Some("sg-1"));
        assert_eq!(status.security_group_name.as_deref(), Some("default/web"));
    }

    #[tokio::test]
    async fn test_stale_finalizer_write_keeps_concurrent_finalizers() {
        let store = InMemoryStore::new();
        let key = ObjectKey::new("default", "web");
        let stale = store.apply(fixtures::load_balancer("default", "web"));
        store.add_finalizer(&stale, "other.io/protect").await.unwrap();

        let lb = store.add_finalizer(&stale, LOAD_BALANCER_FINALIZER).await.unwrap();
        assert_eq!(store.conflicts(), 1);
        assert_eq!(lb.finalizers(), ["other.io/protect", LOAD_BALANCER_FINALIZER]);

        let fresh = store.load_balancer(&key).unwrap();
        store.add_finalizer(&fresh, "late.io/hold").await.unwrap();
        store.remove_finalizer(&fresh, LOAD_BALANCER_FINALIZER).await.unwrap();
        assert_eq!(
            store.load_balancer(&key).unwrap().finalizers(),
            ["other.io/protect", "late.io/hold"]
        );
    }

    #[tokio::test]
    async fn test_finalizer_gates_erasure() {
        let store = InMemoryStore::new();
        let key = ObjectKey::new("default", "web");
        let lb = store.apply(fixtures::load_balancer("default", "web"));
        store.add_finalizer(&lb, LOAD_BALANCER_FINALIZER).await.unwrap();

        store.delete_load_balancer(&key);
        let lb = store.load_balancer(&key).unwrap();
        assert!(lb.metadata.deletion_timestamp.is_some());

        store.remove_finalizer(&lb, LOAD_BALANCER_FINALIZER).await.unwrap();
        assert!(store.load_balancer(&key).is_none());
    }
}
