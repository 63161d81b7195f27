//! Deletion controller
//!
//! Teardown runs in a fixed order, each stage blocking the next until it is
//! drained: LoadBalancerSets, floating IP, port, security group, finalizer.

use super::{Outcome, Reconciliation, DELETION_REQUEUE};
use crate::crd::{LoadBalancerStatus, StatusField, LOAD_BALANCER_FINALIZER};
use crate::domain::ports::{CloudClients, FloatingIpFilter, PortFilter, PortUpdate, SecurityGroupFilter};
use crate::error::Result;
use crate::events::{actions, reasons};
use tracing::{debug, info};

pub async fn reconcile(rec: &mut Reconciliation<'_>, cloud: &CloudClients) -> Result<Outcome> {
    let sets = rec.store().list_sets(&rec.lb).await?;
    if !sets.is_empty() {
        let mut deleted = 0;
        for set in sets.iter().filter(|s| !s.is_deleting()) {
            info!("Deleting LoadBalancerSet {:?} of {}", set.metadata.name, rec.key());
            rec.store().delete_set(set).await?;
            deleted += 1;
        }
        if deleted > 0 {
            rec.normal(
                reasons::DELETING_SETS,
                actions::DELETE,
                format!("Waiting for {} LoadBalancerSet(s) to be deleted", sets.len()),
            )
            .await;
        } else {
            debug!("Waiting for {} LoadBalancerSet(s) of {} to go away", sets.len(), rec.key());
        }
        return Ok(Outcome::Requeue(DELETION_REQUEUE));
    }

    let outcome = teardown_floating_ip(rec, cloud).await?;
    if outcome.is_requeue() {
        return Ok(outcome);
    }
    let outcome = teardown(rec, cloud, Owned::Port).await?;
    if outcome.is_requeue() {
        return Ok(outcome);
    }
    let outcome = teardown_security_group(rec, cloud).await?;
    if outcome.is_requeue() {
        return Ok(outcome);
    }

    info!("Cloud resources of {} are gone, removing finalizer", rec.key());
    rec.store()
        .remove_finalizer(&rec.lb, LOAD_BALANCER_FINALIZER)
        .await?;
    Ok(Outcome::Done)
}

/// Release the floating IP. A user managed address is only dereferenced.
pub async fn teardown_floating_ip(rec: &mut Reconciliation<'_>, cloud: &CloudClients) -> Result<Outcome> {
    if rec.lb.spec.existing_floating_ip.is_none() {
        return teardown(rec, cloud, Owned::FloatingIp).await;
    }
    let status = rec.status();
    if status.floating_id.is_none() && status.floating_name.is_none() {
        return Ok(Outcome::Done);
    }
    info!("Releasing user managed floating IP of {}", rec.key());
    rec.remove_status(&[StatusField::FloatingId, StatusField::FloatingName])
        .await?;
    Ok(Outcome::requeue())
}

async fn teardown_security_group(rec: &mut Reconciliation<'_>, cloud: &CloudClients) -> Result<Outcome> {
    if let Some(group) = rec.status().security_group_id {
        let ports = rec
            .reported(cloud.ports.list(&PortFilter::default()).await)
            .await?;
        for port in ports.iter().filter(|p| p.security_groups.contains(&group)) {
            info!("Detaching security group {} from port {}", group, port.id);
            let update = PortUpdate {
                security_groups: Some(
                    port.security_groups
                        .iter()
                        .filter(|g| **g != group)
                        .cloned()
                        .collect(),
                ),
            };
            match cloud.ports.update(&port.id, &update).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(rec.record(e).await),
            }
        }
    }
    teardown(rec, cloud, Owned::SecurityGroup).await
}

// =============================================================================
// Shared Teardown
// =============================================================================

/// Cloud resource kinds owned by a LoadBalancer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owned {
    FloatingIp,
    Port,
    SecurityGroup,
}

impl Owned {
    fn fields(self) -> (StatusField, StatusField) {
        match self {
            Owned::FloatingIp => (StatusField::FloatingId, StatusField::FloatingName),
            Owned::Port => (StatusField::PortId, StatusField::PortName),
            Owned::SecurityGroup => (StatusField::SecurityGroupId, StatusField::SecurityGroupName),
        }
    }

    fn recorded(self, status: &LoadBalancerStatus) -> (Option<String>, Option<String>) {
        match self {
            Owned::FloatingIp => (status.floating_id.clone(), status.floating_name.clone()),
            Owned::Port => (status.port_id.clone(), status.port_name.clone()),
            Owned::SecurityGroup => (status.security_group_id.clone(), status.security_group_name.clone()),
        }
    }

    async fn exists(self, cloud: &CloudClients, id: &str) -> Result<()> {
        match self {
            Owned::FloatingIp => cloud.floating_ips.get(id).await.map(|_| ()),
            Owned::Port => cloud.ports.get(id).await.map(|_| ()),
            Owned::SecurityGroup => cloud.security_groups.get(id).await.map(|_| ()),
        }
    }

    async fn delete(self, cloud: &CloudClients, id: &str) -> Result<()> {
        let result = match self {
            Owned::FloatingIp => cloud.floating_ips.delete(id).await,
            Owned::Port => cloud.ports.delete(id).await,
            Owned::SecurityGroup => cloud.security_groups.delete(id).await,
        };
        match result {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Ids of the resources carrying exactly `name`
    async fn named(self, cloud: &CloudClients, name: &str) -> Result<Vec<String>> {
        let ids = match self {
            Owned::FloatingIp => {
                let filter = FloatingIpFilter {
                    description: Some(name.to_string()),
                    ..Default::default()
                };
                cloud
                    .floating_ips
                    .list(&filter)
                    .await?
                    .into_iter()
                    .filter(|f| f.description == name)
                    .map(|f| f.id)
                    .collect::<Vec<_>>()
            }
            Owned::Port => {
                let filter = PortFilter {
                    name: Some(name.to_string()),
                };
                cloud
                    .ports
                    .list(&filter)
                    .await?
                    .into_iter()
                    .filter(|p| p.name == name)
                    .map(|p| p.id)
                    .collect()
            }
            Owned::SecurityGroup => {
                let filter = SecurityGroupFilter {
                    name: Some(name.to_string()),
                };
                cloud
                    .security_groups
                    .list(&filter)
                    .await?
                    .into_iter()
                    .filter(|g| g.name == name)
                    .map(|g| g.id)
                    .collect()
            }
        };
        Ok(ids.into_iter().filter(|id| !id.is_empty()).collect())
    }
}

/// Delete by recorded id, then sweep orphans by recorded name
async fn teardown(rec: &mut Reconciliation<'_>, cloud: &CloudClients, kind: Owned) -> Result<Outcome> {
    let (id_field, name_field) = kind.fields();
    let (id, name) = kind.recorded(&rec.status());
    let mut outcome = Outcome::Done;

    if let Some(id) = id {
        match kind.exists(cloud, &id).await {
            Ok(()) => {
                info!("Deleting {:?} {} of {}", kind, id, rec.key());
                rec.reported(kind.delete(cloud, &id).await).await?;
            }
            Err(e) if e.is_not_found() => {
                debug!("{:?} {} already gone", kind, id);
                rec.remove_status(&[id_field]).await?;
            }
            Err(e) => return Err(rec.record(e).await),
        }
        outcome = Outcome::requeue();
    }

    if let Some(name) = name {
        let orphans = rec.reported(kind.named(cloud, &name).await).await?;
        if orphans.is_empty() {
            rec.remove_status(&[name_field]).await?;
        } else {
            for orphan in &orphans {
                info!("Deleting {:?} {} named {}", kind, orphan, name);
                rec.reported(kind.delete(cloud, orphan).await).await?;
            }
            outcome = Outcome::requeue();
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::testing::Harness;
    use crate::domain::ObjectKey;

    async fn converged(harness: &Harness, customize: impl FnOnce(&mut crate::crd::LoadBalancer)) -> ObjectKey {
        let key = harness.apply("web", customize);
        harness.converge(&key).await;
        key
    }

    async fn delete_all(harness: &Harness, key: &ObjectKey) -> usize {
        harness.store.delete_load_balancer(key);
        for pass in 1..=20 {
            if harness.store.load_balancer(key).is_none() {
                return pass;
            }
            let outcome = harness.orchestrator.reconcile(key).await.unwrap();
            if outcome == Outcome::Done {
                assert!(harness.store.load_balancer(key).is_none());
                return pass;
            }
        }
        panic!("{} was not deleted", key);
    }

    #[tokio::test]
    async fn test_deletion_waits_for_sets() {
        let harness = Harness::new();
        let key = converged(&harness, |_| {}).await;
        let set = harness.store.sets_of("web").remove(0);
        let set_name = set.metadata.name.clone().unwrap();
        harness.store.hold_set("default", &set_name);
        harness.store.delete_load_balancer(&key);

        for _ in 0..3 {
            let outcome = harness.orchestrator.reconcile(&key).await.unwrap();
            assert_eq!(outcome, Outcome::Requeue(DELETION_REQUEUE));
        }
        // announced once, when the delete was issued
        assert_eq!(harness.events.count_reason(reasons::DELETING_SETS), 1);
        assert_eq!(harness.events.count_reason(reasons::SCALED_DOWN), 0);
        // nothing in the cloud was touched while the set exists
        assert_eq!(harness.cloud.ports().await.len(), 1);
        assert_eq!(harness.cloud.floating_ips().await.len(), 1);
        assert!(harness.store.load_balancer(&key).is_some());

        harness.store.release_set("default", &set_name);
        delete_all(&harness, &key).await;
        assert!(harness.cloud.ports().await.is_empty());
        assert!(harness.cloud.floating_ips().await.is_empty());
        assert!(harness.cloud.security_groups().await.is_empty());
    }

    #[tokio::test]
    async fn test_user_managed_floating_ip_survives_deletion() {
        let harness = Harness::new();
        let fip = harness.cloud.seed_floating_ip("1.2.3.4", "reserved").await;
        let key = converged(&harness, |lb| lb.spec.existing_floating_ip = Some("1.2.3.4".into())).await;

        delete_all(&harness, &key).await;

        let remaining = harness.cloud.floating_ips().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fip.id);
        assert_eq!(remaining[0].port_id, None);
        assert!(harness.cloud.ports().await.is_empty());
    }

    #[tokio::test]
    async fn test_orphans_are_swept_by_name() {
        let harness = Harness::new();
        let key = harness.apply("web", |lb| {
            lb.metadata.finalizers = Some(vec![LOAD_BALANCER_FINALIZER.to_string()]);
        });
        // created but never recorded by id
        harness.cloud.seed_port("default/web", "net-1", vec![]).await;
        harness.cloud.seed_port("default/web", "net-1", vec![]).await;
        harness
            .reconciliation(&key)
            .patch_status(LoadBalancerStatus {
                port_name: Some("default/web".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut rec = harness.reconciliation(&key);
        let outcome = teardown(&mut rec, &harness.clients(), Owned::Port).await.unwrap();
        assert!(outcome.is_requeue());
        assert!(harness.cloud.ports().await.is_empty());

        let outcome = teardown(&mut rec, &harness.clients(), Owned::Port).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(harness.get(&key).status_or_default().port_name, None);
    }

    #[tokio::test]
    async fn test_security_group_is_detached_from_foreign_ports() {
        let harness = Harness::new();
        let key = converged(&harness, |_| {}).await;
        let group = harness.get(&key).status_or_default().security_group_id.unwrap();
        let foreign = harness
            .cloud
            .seed_port("someone-else", "net-1", vec![group.clone(), "other".into()])
            .await;

        delete_all(&harness, &key).await;

        let ports = harness.cloud.ports().await;
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].id, foreign.id);
        assert_eq!(ports[0].security_groups, vec!["other".to_string()]);
        assert!(harness.cloud.security_groups().await.is_empty());
    }
}
