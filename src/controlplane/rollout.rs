//! Rollout controller
//!
//! Blue/green rollout over LoadBalancerSet generations. A set is created per
//! machine template hash and numbered with a revision that never repeats.
//! Old generations are scaled to zero only once the current one is ready.

use super::hash::{machine_spec, machine_spec_hash};
use super::{Outcome, Reconciliation, READINESS_REQUEUE};
use crate::crd::{
    LoadBalancerMachineSpec, LoadBalancerMachineTemplate, LoadBalancerSet, LoadBalancerSetSpec,
    LoadBalancerStatus, HASH_LABEL, LOAD_BALANCER_LABEL, REVISION_ANNOTATION,
};
use crate::error::{Error, Result};
use crate::events::{actions, reasons};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub async fn reconcile(rec: &mut Reconciliation<'_>) -> Result<Outcome> {
    let revision = rec.lb.revision()?;
    if revision == 0 {
        info!("Initializing revision of {}", rec.key());
        rec.set_revision(1).await?;
        return Ok(Outcome::requeue());
    }

    let template = machine_spec(&rec.lb);
    let hash = machine_spec_hash(&template)?;
    let sets = rec.store().list_sets(&rec.lb).await?;

    let Some(current) = sets.iter().find(|s| s.template_hash() == Some(hash.as_str())) else {
        return create_revision(rec, &sets, template, hash).await;
    };

    let current_revision = current.revision()?;
    if current_revision != revision {
        debug!("Revision of {} follows set {}", rec.key(), current.name_any());
        rec.set_revision(current_revision).await?;
    }

    let replicas = rec.lb.spec.replicas;
    if current.spec.replicas != replicas {
        info!("Scaling LoadBalancerSet {} to {}", current.name_any(), replicas);
        rec.store().scale_set(current, replicas).await?;
        return Ok(Outcome::requeue());
    }

    let observed = current.status.clone().unwrap_or_default();
    let status = rec.status();
    let mirror = LoadBalancerStatus {
        replicas: observed.replicas.filter(|r| status.replicas != Some(*r)),
        ready_replicas: observed.ready_replicas.filter(|r| status.ready_replicas != Some(*r)),
        ..Default::default()
    };
    if mirror != LoadBalancerStatus::default() {
        rec.patch_status(mirror).await?;
    }

    if !current.is_ready() {
        debug!("LoadBalancerSet {} is not ready yet", current.name_any());
        return Ok(Outcome::Requeue(READINESS_REQUEUE));
    }

    let stale: Vec<&LoadBalancerSet> = sets
        .iter()
        .filter(|s| s.template_hash() != Some(hash.as_str()) && s.spec.replicas != 0)
        .collect();
    if stale.is_empty() {
        return Ok(Outcome::Done);
    }
    for set in &stale {
        info!("Scaling down LoadBalancerSet {}", set.name_any());
        rec.store().scale_set(set, 0).await?;
    }
    rec.normal(
        reasons::SCALED_DOWN,
        actions::SCALE,
        format!("Scaled down {} previous LoadBalancerSet(s)", stale.len()),
    )
    .await;
    Ok(Outcome::requeue())
}

/// Create the set of a new machine template under the next revision
async fn create_revision(
    rec: &mut Reconciliation<'_>,
    sets: &[LoadBalancerSet],
    template: LoadBalancerMachineSpec,
    hash: String,
) -> Result<Outcome> {
    if rec.status().port_id.is_none() {
        return Err(rec.record(Error::PortNotSet).await);
    }

    let mut next = 1;
    for set in sets {
        next = next.max(set.revision()? + 1);
    }

    let lb_name = rec.lb.name_any();
    let labels = BTreeMap::from([
        (LOAD_BALANCER_LABEL.to_string(), lb_name.clone()),
        (HASH_LABEL.to_string(), hash.clone()),
    ]);
    let set = LoadBalancerSet {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", lb_name, hash)),
            namespace: rec.lb.namespace(),
            labels: Some(labels.clone()),
            annotations: Some(BTreeMap::from([(
                REVISION_ANNOTATION.to_string(),
                next.to_string(),
            )])),
            owner_references: rec.lb.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: LoadBalancerSetSpec {
            selector: labels.clone(),
            replicas: rec.lb.spec.replicas,
            template: LoadBalancerMachineTemplate {
                labels,
                spec: template,
            },
        },
        status: None,
    };

    let created = rec.store().create_set(&set).await?;
    info!("Created LoadBalancerSet {} at revision {}", created.name_any(), next);
    rec.normal(
        reasons::REVISION_CREATED,
        actions::CREATE,
        format!("Created LoadBalancerSet {} (revision {})", created.name_any(), next),
    )
    .await;
    rec.set_revision(next).await?;
    Ok(Outcome::requeue())
}
