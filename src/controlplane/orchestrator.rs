//! Main Orchestrator
//!
//! Entry point of every reconcile invocation:
//! - Administrative gate (pause, single object filter)
//! - Deletion or finalizer bookkeeping
//! - Cloud reconcile, skipped unless needed
//! - Rollout of LoadBalancerSets
//!
//! Also owns the controller runner and the per-object error backoff.

use super::hash::reconcile_hash;
use super::{
    deletion, floating_ip, port, rollout, security_group, Outcome, Reconciliation, GATE_REQUEUE,
    RESYNC_INTERVAL,
};
use crate::crd::{LoadBalancer, LoadBalancerSet, LoadBalancerStatus, LOAD_BALANCER_FINALIZER};
use crate::domain::ports::{CloudClientFactoryRef, CloudClients, ClusterStoreRef, ObjectKey};
use crate::error::{Error, ErrorAction, Result};
use crate::events::EventPublisher;
use crate::metrics::LoadBalancerMetrics;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound of the error backoff
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(300);

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Namespace to watch, all namespaces when unset
    pub namespace: Option<String>,
    /// Maximum number of concurrent reconciles
    pub workers: u16,
    /// Cloud reconcile runs at least this often
    pub cloud_resync_interval: Duration,
    /// Deadline of one reconcile invocation
    pub reconcile_timeout: Duration,
    /// Administrative pause
    pub skip_reconciles: bool,
    /// Only reconcile this object
    pub only_reconcile: Option<ObjectKey>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 10,
            cloud_resync_interval: Duration::from_secs(300),
            reconcile_timeout: Duration::from_secs(120),
            skip_reconciles: false,
            only_reconcile: None,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: ClusterStoreRef,
    clouds: CloudClientFactoryRef,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<LoadBalancerMetrics>,
    /// Error backoff per object, reset by the first successful pass
    backoffs: DashMap<ObjectKey, ExponentialBackoff>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: ClusterStoreRef,
        clouds: CloudClientFactoryRef,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<LoadBalancerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            clouds,
            events,
            metrics,
            backoffs: DashMap::new(),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Reconcile one LoadBalancer within the configured deadline
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        let deadline = self.config.reconcile_timeout;
        let outcome = tokio::time::timeout(deadline, self.reconcile_once(key))
            .await
            .map_err(|_| Error::Timeout(deadline))??;
        self.backoffs.remove(key);
        Ok(outcome)
    }

    async fn reconcile_once(&self, key: &ObjectKey) -> Result<Outcome> {
        if self.config.skip_reconciles {
            debug!("Reconciles are paused, skipping {}", key);
            return Ok(Outcome::Requeue(GATE_REQUEUE));
        }
        if matches!(&self.config.only_reconcile, Some(only) if only != key) {
            debug!("Only reconciling {:?}, skipping {}", self.config.only_reconcile, key);
            return Ok(Outcome::Requeue(GATE_REQUEUE));
        }

        let Some(lb) = self.store.get_load_balancer(key).await? else {
            debug!("LoadBalancer {} is gone", key);
            return Ok(Outcome::Done);
        };
        self.metrics.observe(&lb);
        let mut rec = Reconciliation::new(lb, self.store.as_ref(), self.events.as_ref());

        if rec.lb.metadata.deletion_timestamp.is_some() {
            return self.reconcile_deletion(&mut rec).await;
        }

        if !rec.lb.has_finalizer(LOAD_BALANCER_FINALIZER) {
            debug!("Adding finalizer to {}", key);
            rec.add_finalizer(LOAD_BALANCER_FINALIZER).await?;
        }

        let hash = reconcile_hash(&rec.lb)?;
        if self.cloud_reconcile_needed(&rec.lb, &hash) {
            let cloud = self.clients(&rec).await?;
            let outcome = reconcile_cloud(&mut rec, &cloud).await?;
            if outcome.is_requeue() {
                return Ok(outcome);
            }

            let status = rec.status();
            let changed = status.openstack_reconcile_hash.as_deref() != Some(hash.as_str());
            rec.patch_status(LoadBalancerStatus {
                last_openstack_reconcile: Some(Utc::now()),
                openstack_reconcile_hash: changed.then_some(hash),
                ..Default::default()
            })
            .await?;
            info!("Cloud resources of {} are in sync", key);
        }

        let outcome = rollout::reconcile(&mut rec).await?;
        self.metrics.observe(&rec.lb);
        if outcome.is_requeue() {
            return Ok(outcome);
        }
        Ok(Outcome::Requeue(RESYNC_INTERVAL))
    }

    async fn reconcile_deletion(&self, rec: &mut Reconciliation<'_>) -> Result<Outcome> {
        if !rec.lb.has_finalizer(LOAD_BALANCER_FINALIZER) {
            return Ok(Outcome::Done);
        }
        let cloud = self.clients(rec).await?;
        let outcome = deletion::reconcile(rec, &cloud).await?;
        if outcome == Outcome::Done {
            info!("LoadBalancer {} cleaned up", rec.key());
            self.metrics.forget(&rec.lb);
        }
        Ok(outcome)
    }

    /// Cloud reconcile is skipped unless it never ran, ran longer than the
    /// resync interval ago, or ran against different spec inputs
    fn cloud_reconcile_needed(&self, lb: &LoadBalancer, hash: &str) -> bool {
        let status = lb.status_or_default();
        let Some(last) = status.last_openstack_reconcile else {
            return true;
        };
        let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
        elapsed > self.config.cloud_resync_interval
            || status.openstack_reconcile_hash.as_deref() != Some(hash)
    }

    async fn clients(&self, rec: &Reconciliation<'_>) -> Result<CloudClients> {
        rec.reported(self.clouds.clients_for(&rec.lb).await).await
    }

    /// Delay before retrying a failed object
    fn next_backoff(&self, key: &ObjectKey) -> Duration {
        let mut backoff = self.backoffs.entry(key.clone()).or_insert_with(error_backoff);
        backoff.next_backoff().unwrap_or(MAX_ERROR_BACKOFF)
    }
}

/// Security group, floating IP, port, association. Stops at the first
/// sub-reconciler asking for a requeue.
async fn reconcile_cloud(rec: &mut Reconciliation<'_>, cloud: &CloudClients) -> Result<Outcome> {
    let outcome = security_group::reconcile(rec, cloud).await?;
    if outcome.is_requeue() {
        return Ok(outcome);
    }
    let outcome = floating_ip::reconcile(rec, cloud).await?;
    if outcome.is_requeue() {
        return Ok(outcome);
    }
    let outcome = port::reconcile(rec, cloud).await?;
    if outcome.is_requeue() {
        return Ok(outcome);
    }
    floating_ip::associate(rec, cloud).await
}

fn error_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_interval(MAX_ERROR_BACKOFF)
        .with_max_elapsed_time(None)
        .build()
}

// =============================================================================
// Controller
// =============================================================================

impl From<Outcome> for Action {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Done => Action::await_change(),
            Outcome::Requeue(delay) => Action::requeue(delay),
        }
    }
}

/// Controller reconcile function
pub async fn reconcile(lb: Arc<LoadBalancer>, ctx: Arc<Orchestrator>) -> Result<Action> {
    let key = ObjectKey::of(&lb);
    ctx.reconcile(&key).await.map(Action::from)
}

/// Controller error policy: fixed delays for errors the user has to fix,
/// exponential backoff per object for everything else
pub fn error_policy(lb: Arc<LoadBalancer>, error: &Error, ctx: Arc<Orchestrator>) -> Action {
    let key = ObjectKey::of(&lb);
    match error.action() {
        ErrorAction::RequeueAfter(delay) => {
            warn!("Reconcile of {} failed, retrying in {:?}: {}", key, delay, error);
            Action::requeue(delay)
        }
        ErrorAction::NoRequeue => {
            error!("Reconcile of {} failed, waiting for a change: {}", key, error);
            Action::await_change()
        }
        ErrorAction::RequeueWithBackoff => {
            let delay = ctx.next_backoff(&key);
            warn!("Reconcile of {} failed, retrying in {:?}: {}", key, delay, error);
            Action::requeue(delay)
        }
    }
}

/// Run the LoadBalancer controller until `shutdown` fires
pub async fn run(client: Client, orchestrator: Arc<Orchestrator>, ready: Arc<AtomicBool>, shutdown: CancellationToken) {
    let config = orchestrator.config().clone();
    let (load_balancers, sets): (Api<LoadBalancer>, Api<LoadBalancerSet>) = match &config.namespace {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
        None => (Api::all(client.clone()), Api::all(client)),
    };

    info!(
        "Starting LoadBalancer controller (namespace: {}, workers: {})",
        config.namespace.as_deref().unwrap_or("<all>"),
        config.workers
    );
    let controller = Controller::new(load_balancers, watcher::Config::default())
        .owns(sets, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(config.workers))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, orchestrator)
        .for_each(|result| {
            match result {
                Ok((object, action)) => debug!("Reconciled {}: {:?}", object.name, action),
                Err(e) => debug!("Reconcile failed: {}", e),
            }
            futures::future::ready(())
        });

    ready.store(true, Ordering::SeqCst);
    controller.await;
    ready.store(false, Ordering::SeqCst);
    info!("LoadBalancer controller stopped");
}
