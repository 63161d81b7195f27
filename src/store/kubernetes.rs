//! Cluster store backed by the Kubernetes API

use super::{
    guarded, replicas_patch, revision_patch, status_patch, status_removal, with_finalizer, without_finalizer,
};
use crate::crd::{LoadBalancer, LoadBalancerSet, LoadBalancerStatus, StatusField, LOAD_BALANCER_LABEL};
use crate::domain::ports::{ClusterStore, ObjectKey};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
enum Target {
    Object,
    Status,
}

pub struct KubeStore {
    client: Client,
    params: PatchParams,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            params: PatchParams::default(),
        }
    }

    fn load_balancers(&self, namespace: &str) -> Api<LoadBalancer> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn sets(&self, namespace: &str) -> Api<LoadBalancerSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Merge patch pinned to the resourceVersion of the object it is built
    /// from. On a 409 the object is re-read and the patch rebuilt on top of it.
    async fn patch_guarded<F>(&self, lb: &LoadBalancer, target: Target, patch: F) -> Result<LoadBalancer>
    where
        F: Fn(&LoadBalancer) -> Value,
    {
        let api = self.load_balancers(&lb.namespace().unwrap_or_default());
        let name = lb.name_any();
        let latest = Arc::new(Mutex::new(lb.clone()));

        let attempt = || {
            let api = api.clone();
            let name = name.clone();
            let params = self.params.clone();
            let latest = latest.clone();
            let body = {
                let basis = latest.lock();
                guarded(patch(&*basis), basis.resource_version().as_deref())
            };
            async move {
                let result = match target {
                    Target::Status => api.patch_status(&name, &params, &Patch::Merge(&body)).await,
                    Target::Object => api.patch(&name, &params, &Patch::Merge(&body)).await,
                };
                let err = match result {
                    Ok(obj) => return Ok(obj),
                    Err(e) => Error::Kube(e),
                };
                if !err.is_conflict() {
                    return Err(backoff::Error::permanent(err));
                }
                debug!("Conflict writing {}, re-reading", name);
                let fresh = api
                    .get(&name)
                    .await
                    .map_err(|e| backoff::Error::permanent(Error::Kube(e)))?;
                *latest.lock() = fresh;
                Err(backoff::Error::transient(err))
            }
        };

        backoff::future::retry(conflict_backoff(), attempt).await
    }
}

fn conflict_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_secs(1))
        .with_max_elapsed_time(Some(Duration::from_secs(10)))
        .build()
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_load_balancer(&self, key: &ObjectKey) -> Result<Option<LoadBalancer>> {
        Ok(self.load_balancers(&key.namespace).get_opt(&key.name).await?)
    }

    async fn patch_status(&self, lb: &LoadBalancer, patch: &LoadBalancerStatus) -> Result<LoadBalancer> {
        let body = status_patch(patch)?;
        self.patch_guarded(lb, Target::Status, |_| body.clone()).await
    }

    async fn remove_status_fields(&self, lb: &LoadBalancer, fields: &[StatusField]) -> Result<LoadBalancer> {
        let body = status_removal(fields);
        self.patch_guarded(lb, Target::Status, |_| body.clone()).await
    }

    async fn set_revision(&self, lb: &LoadBalancer, revision: i64) -> Result<LoadBalancer> {
        let body = revision_patch(revision);
        self.patch_guarded(lb, Target::Object, |_| body.clone()).await
    }

    async fn add_finalizer(&self, lb: &LoadBalancer, finalizer: &str) -> Result<LoadBalancer> {
        self.patch_guarded(lb, Target::Object, |basis| with_finalizer(basis, finalizer))
            .await
    }

    async fn remove_finalizer(&self, lb: &LoadBalancer, finalizer: &str) -> Result<()> {
        match self
            .patch_guarded(lb, Target::Object, |basis| without_finalizer(basis, finalizer))
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Kube(e)) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_sets(&self, lb: &LoadBalancer) -> Result<Vec<LoadBalancerSet>> {
        let selector = format!("{}={}", LOAD_BALANCER_LABEL, lb.name_any());
        let list = self
            .sets(&lb.namespace().unwrap_or_default())
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(list.items)
    }

    async fn create_set(&self, set: &LoadBalancerSet) -> Result<LoadBalancerSet> {
        Ok(self
            .sets(&set.namespace().unwrap_or_default())
            .create(&PostParams::default(), set)
            .await?)
    }

    async fn scale_set(&self, set: &LoadBalancerSet, replicas: i32) -> Result<()> {
        self.sets(&set.namespace().unwrap_or_default())
            .patch(&set.name_any(), &self.params, &Patch::Merge(&replicas_patch(replicas)))
            .await?;
        Ok(())
    }

    async fn delete_set(&self, set: &LoadBalancerSet) -> Result<()> {
        match self
            .sets(&set.namespace().unwrap_or_default())
            .delete(&set.name_any(), &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
