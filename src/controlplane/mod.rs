//! LoadBalancer Control Plane
//!
//! The reconciliation state machine of a LoadBalancer:
//! - Security group, floating IP and port lifecycle (one sub-reconciler each)
//! - Floating IP association
//! - Revision based blue/green rollout of LoadBalancerSets
//! - Ordered teardown on deletion
//!
//! Sub-reconcilers report an [`Outcome`] or an error. Every status write is
//! committed before the next step runs, so a pass that fails halfway resumes
//! from the last committed point.

pub mod deletion;
pub mod floating_ip;
pub mod hash;
pub mod orchestrator;
pub mod platform;
pub mod port;
pub mod rollout;
pub mod rules;
pub mod security_group;

pub use orchestrator::*;
pub use platform::*;

use crate::crd::{LoadBalancer, LoadBalancerStatus, StatusField};
use crate::domain::ports::ClusterStore;
use crate::error::{Error, Result};
use crate::events::{actions, reasons, EventPublisher};
use kube::runtime::events::EventType;
use kube::Resource;
use std::time::Duration;
use tracing::warn;

// =============================================================================
// Requeue Delays
// =============================================================================

/// Requeue after a step made progress
pub const DEFAULT_REQUEUE: Duration = Duration::from_millis(10);

/// Waiting for a LoadBalancerSet to report ready replicas
pub const READINESS_REQUEUE: Duration = Duration::from_secs(1);

/// Waiting for LoadBalancerSets to disappear during deletion
pub const DELETION_REQUEUE: Duration = Duration::from_secs(10);

/// Steady state heartbeat
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Objects held back by the administrative gate
pub const GATE_REQUEUE: Duration = Duration::from_secs(5);

// =============================================================================
// Outcome
// =============================================================================

/// Result of a reconcile step that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    /// Nothing left to do in this step
    #[default]
    Done,
    /// Invoke the reconciler again after the delay
    Requeue(Duration),
}

impl Outcome {
    pub fn requeue() -> Self {
        Outcome::Requeue(DEFAULT_REQUEUE)
    }

    pub fn is_requeue(&self) -> bool {
        matches!(self, Outcome::Requeue(_))
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// One pass over one LoadBalancer.
///
/// Holds the object as last written, so every step sees the status committed
/// by the steps before it.
pub struct Reconciliation<'a> {
    pub lb: LoadBalancer,
    store: &'a dyn ClusterStore,
    events: &'a dyn EventPublisher,
}

impl<'a> Reconciliation<'a> {
    pub fn new(lb: LoadBalancer, store: &'a dyn ClusterStore, events: &'a dyn EventPublisher) -> Self {
        Self { lb, store, events }
    }

    pub fn key(&self) -> String {
        self.lb.key()
    }

    pub fn status(&self) -> LoadBalancerStatus {
        self.lb.status_or_default()
    }

    pub fn store(&self) -> &'a dyn ClusterStore {
        self.store
    }

    pub async fn patch_status(&mut self, patch: LoadBalancerStatus) -> Result<()> {
        self.lb = self.store.patch_status(&self.lb, &patch).await?;
        Ok(())
    }

    pub async fn remove_status(&mut self, fields: &[StatusField]) -> Result<()> {
        self.lb = self.store.remove_status_fields(&self.lb, fields).await?;
        Ok(())
    }

    pub async fn set_revision(&mut self, revision: i64) -> Result<()> {
        self.lb = self.store.set_revision(&self.lb, revision).await?;
        Ok(())
    }

    pub async fn add_finalizer(&mut self, finalizer: &str) -> Result<()> {
        self.lb = self.store.add_finalizer(&self.lb, finalizer).await?;
        Ok(())
    }

    /// Record `err` as a Warning event on the LoadBalancer and hand it back
    pub async fn record(&self, err: Error) -> Error {
        warn!(lb = %self.key(), error = %err, "Reconcile step failed");
        self.publish(EventType::Warning, reasons::RECONCILE_ERROR, actions::RECONCILE, err.to_string())
            .await;
        err
    }

    /// Pass `result` through, recording the error if there is one
    pub async fn reported<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => Err(self.record(err).await),
        }
    }

    pub async fn warning(&self, reason: &str, note: String) {
        self.publish(EventType::Warning, reason, actions::RECONCILE, note).await;
    }

    pub async fn normal(&self, reason: &str, action: &str, note: String) {
        self.publish(EventType::Normal, reason, action, note).await;
    }

    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: String) {
        let object_ref = self.lb.object_ref(&());
        self.events
            .publish(&object_ref, type_, reason, action, Some(note))
            .await;
    }
}
