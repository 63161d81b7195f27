//! Security group reconciler
//!
//! Owns the security group of a LoadBalancer and its rule set.

use super::rules::desired_rules;
use super::{Outcome, Reconciliation};
use crate::crd::{LoadBalancerStatus, StatusField};
use crate::domain::ports::{
    CloudClients, RuleCreate, RuleSpec, SecurityGroup, SecurityGroupCreate, SecurityGroupFilter,
};
use crate::error::{Error, Result};
use crate::events::{actions, reasons};
use std::collections::BTreeSet;
use tracing::{debug, info};

const KIND: &str = "security group";

pub async fn reconcile(rec: &mut Reconciliation<'_>, cloud: &CloudClients) -> Result<Outcome> {
    let mut outcome = Outcome::Done;

    let name = match rec.status().security_group_name {
        Some(name) => name,
        None => {
            let name = rec.key();
            rec.patch_status(LoadBalancerStatus {
                security_group_name: Some(name.clone()),
                ..Default::default()
            })
            .await?;
            outcome = Outcome::requeue();
            name
        }
    };

    let id = match rec.status().security_group_id {
        Some(id) => id,
        None => {
            let group = adopt_or_create(rec, cloud, &name).await?;
            rec.patch_status(LoadBalancerStatus {
                security_group_id: Some(group.id.clone()),
                ..Default::default()
            })
            .await?;
            outcome = Outcome::requeue();
            group.id
        }
    };

    let group = match cloud.security_groups.get(&id).await {
        Ok(group) => group,
        Err(e) if e.is_not_found() => {
            info!("Security group {} of {} is gone, clearing it from status", id, rec.key());
            rec.remove_status(&[StatusField::SecurityGroupId]).await?;
            return Ok(Outcome::requeue());
        }
        Err(e) => return Err(rec.record(e).await),
    };

    reconcile_rules(rec, cloud, &group).await?;
    Ok(outcome)
}

async fn adopt_or_create(rec: &Reconciliation<'_>, cloud: &CloudClients, name: &str) -> Result<SecurityGroup> {
    let filter = SecurityGroupFilter {
        name: Some(name.to_string()),
    };
    let existing = rec.reported(cloud.security_groups.list(&filter).await).await?;
    if let Some(group) = existing.into_iter().find(|g| g.name == name && !g.id.is_empty()) {
        info!("Adopting security group {} ({})", name, group.id);
        rec.normal(
            reasons::ADOPTED,
            actions::CREATE,
            format!("Adopted security group {}", group.id),
        )
        .await;
        return Ok(group);
    }

    let params = SecurityGroupCreate {
        name: name.to_string(),
        description: format!("Security group of LoadBalancer {}", rec.key()),
    };
    let group = rec.reported(cloud.security_groups.create(&params).await).await?;
    if group.id.is_empty() {
        return Err(rec.record(Error::EmptyResourceId { kind: KIND }).await);
    }
    info!("Created security group {} ({})", name, group.id);
    rec.normal(
        reasons::SECURITY_GROUP_CREATED,
        actions::CREATE,
        format!("Created security group {}", group.id),
    )
    .await;
    Ok(group)
}

/// Delete rules that are not desired, then create the missing ones
async fn reconcile_rules(rec: &Reconciliation<'_>, cloud: &CloudClients, group: &SecurityGroup) -> Result<()> {
    let desired = desired_rules(&rec.lb, &group.id);
    for range in &desired.invalid_source_ranges {
        rec.warning(
            reasons::INVALID_SOURCE_RANGE,
            format!("Ignoring invalid load balancer source range {:?}", range),
        )
        .await;
    }

    let wanted: BTreeSet<&RuleSpec> = desired.rules.iter().collect();
    let mut present: BTreeSet<&RuleSpec> = BTreeSet::new();

    for rule in &group.rules {
        if wanted.contains(&rule.spec) && present.insert(&rule.spec) {
            continue;
        }
        debug!("Deleting security group rule {} of {}", rule.id, group.id);
        match cloud.rules.delete(&rule.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(rec.record(e).await),
        }
    }

    for spec in wanted.difference(&present) {
        let params = RuleCreate {
            security_group_id: group.id.clone(),
            description: rec.key(),
            spec: (*spec).clone(),
        };
        debug!("Creating security group rule on {}: {:?}", group.id, spec);
        rec.reported(cloud.rules.create(&params).await).await?;
    }
    Ok(())
}
