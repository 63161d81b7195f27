//! Floating IP reconciler and floating IP association
//!
//! A LoadBalancer either owns its floating IP (created or adopted by
//! description) or references one the user allocated and named in
//! `spec.existingFloatingIP`. User managed addresses are never deleted.

use super::deletion;
use super::{Outcome, Reconciliation};
use crate::crd::{LoadBalancerStatus, StatusField};
use crate::domain::ports::{CloudClients, FloatingIp, FloatingIpCreate, FloatingIpFilter, FloatingIpUpdate};
use crate::error::{Error, Result};
use crate::events::{actions, reasons};
use tracing::{debug, info, warn};

const KIND: &str = "floating IP";

/// Appended to the description of a user managed floating IP that carries
/// the name this reconciler would give its own
pub const USER_MANAGED_SUFFIX: &str = " (user managed)";

pub async fn reconcile(rec: &mut Reconciliation<'_>, cloud: &CloudClients) -> Result<Outcome> {
    if rec.lb.is_internal() {
        return deletion::teardown_floating_ip(rec, cloud).await;
    }
    let mut outcome = Outcome::Done;

    let name = match rec.status().floating_name {
        Some(name) => name,
        None => {
            let name = rec.key();
            rec.patch_status(LoadBalancerStatus {
                floating_name: Some(name.clone()),
                ..Default::default()
            })
            .await?;
            outcome = Outcome::requeue();
            name
        }
    };

    if rec.status().floating_id.is_none() {
        let fip = assign_or_create(rec, cloud, &name).await?;
        rec.patch_status(LoadBalancerStatus {
            floating_id: Some(fip.id),
            ..Default::default()
        })
        .await?;
        outcome = Outcome::requeue();
    }
    let Some(id) = rec.status().floating_id else {
        return Ok(Outcome::requeue());
    };

    let fip = match cloud.floating_ips.get(&id).await {
        Ok(fip) => fip,
        Err(e) if e.is_not_found() => {
            info!("Floating IP {} of {} is gone, clearing it from status", id, rec.key());
            rec.remove_status(&[StatusField::FloatingId]).await?;
            return Ok(Outcome::requeue());
        }
        Err(e) => return Err(rec.record(e).await),
    };

    if rec.status().external_ip.as_deref() != Some(fip.floating_ip_address.as_str()) {
        info!("External IP of {} is {}", rec.key(), fip.floating_ip_address);
        rec.patch_status(LoadBalancerStatus {
            external_ip: Some(fip.floating_ip_address.clone()),
            ..Default::default()
        })
        .await?;
    }

    if rec.lb.spec.existing_floating_ip.is_some() && fip.description == name {
        let description = format!("{}{}", fip.description, USER_MANAGED_SUFFIX);
        warn!("Floating IP {} is user managed, renaming it to {:?}", fip.id, description);
        let update = FloatingIpUpdate {
            description: Some(description),
            ..Default::default()
        };
        rec.reported(cloud.floating_ips.update(&fip.id, &update).await).await?;
    }

    Ok(outcome)
}

/// Resolve the user's floating IP, or adopt or create one of our own
async fn assign_or_create(rec: &Reconciliation<'_>, cloud: &CloudClients, name: &str) -> Result<FloatingIp> {
    if let Some(address) = rec.lb.spec.existing_floating_ip.clone() {
        let filter = FloatingIpFilter {
            floating_ip_address: Some(address.clone()),
            ..Default::default()
        };
        let found = rec
            .reported(cloud.floating_ips.list(&filter).await)
            .await?
            .into_iter()
            .find(|f| f.floating_ip_address == address);
        return match found {
            Some(fip) if fip.id.is_empty() => Err(rec.record(Error::EmptyResourceId { kind: KIND }).await),
            Some(fip) => {
                info!("Using existing floating IP {} ({}) for {}", address, fip.id, rec.key());
                Ok(fip)
            }
            None => Err(rec.record(Error::ExistingFloatingIpNotFound { address }).await),
        };
    }

    let filter = FloatingIpFilter {
        description: Some(name.to_string()),
        ..Default::default()
    };
    let existing = rec.reported(cloud.floating_ips.list(&filter).await).await?;
    if let Some(fip) = existing.into_iter().find(|f| f.description == name && !f.id.is_empty()) {
        info!("Adopting floating IP {} ({})", fip.floating_ip_address, fip.id);
        rec.normal(
            reasons::ADOPTED,
            actions::CREATE,
            format!("Adopted floating IP {}", fip.floating_ip_address),
        )
        .await;
        return Ok(fip);
    }

    let params = FloatingIpCreate {
        description: name.to_string(),
        floating_network_id: rec.lb.spec.infrastructure.floating_net_id.clone(),
    };
    let fip = rec.reported(cloud.floating_ips.create(&params).await).await?;
    if fip.id.is_empty() {
        return Err(rec.record(Error::EmptyResourceId { kind: KIND }).await);
    }
    info!("Created floating IP {} ({})", fip.floating_ip_address, fip.id);
    rec.normal(
        reasons::FLOATING_IP_CREATED,
        actions::CREATE,
        format!("Created floating IP {}", fip.floating_ip_address),
    )
    .await;
    Ok(fip)
}

/// Bind the floating IP to the port
pub async fn associate(rec: &mut Reconciliation<'_>, cloud: &CloudClients) -> Result<Outcome> {
    if rec.lb.is_internal() {
        return Ok(Outcome::Done);
    }
    let status = rec.status();
    let (Some(port_id), Some(floating_id)) = (status.port_id, status.floating_id) else {
        debug!("Port or floating IP of {} not known yet", rec.key());
        return Ok(Outcome::requeue());
    };

    let fip = match cloud.floating_ips.get(&floating_id).await {
        Ok(fip) => fip,
        Err(e) if e.is_not_found() => {
            rec.remove_status(&[StatusField::FloatingId]).await?;
            return Ok(Outcome::requeue());
        }
        Err(e) => return Err(rec.record(e).await),
    };
    if fip.port_id.as_deref() == Some(port_id.as_str()) && fip.status == FloatingIp::ACTIVE {
        debug!("Floating IP {} already bound to {}", fip.id, port_id);
        return Ok(Outcome::Done);
    }

    let update = FloatingIpUpdate {
        port_id: Some(port_id.clone()),
        ..Default::default()
    };
    rec.reported(cloud.floating_ips.update(&fip.id, &update).await).await?;
    info!("Bound floating IP {} to port {}", fip.floating_ip_address, port_id);
    rec.normal(
        reasons::FLOATING_IP_BOUND,
        actions::BIND,
        format!("Bound floating IP {} to port {}", fip.floating_ip_address, port_id),
    )
    .await;
    Ok(Outcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::testing::Harness;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_creates_floating_ip_and_records_address() {
        let harness = Harness::new();
        let key = harness.apply("web", |_| {});
        let clients = harness.clients();

        let outcome = reconcile(&mut harness.reconciliation(&key), &clients).await.unwrap();
        assert!(outcome.is_requeue());

        let fips = harness.cloud.floating_ips().await;
        assert_eq!(fips.len(), 1);
        assert_eq!(fips[0].description, "default/web");
        assert_eq!(fips[0].floating_network_id.as_deref(), Some("ext-net"));
        let status = harness.get(&key).status_or_default();
        assert_eq!(status.floating_id.as_deref(), Some(fips[0].id.as_str()));
        assert_eq!(status.external_ip.as_deref(), Some(fips[0].floating_ip_address.as_str()));
    }

    #[tokio::test]
    async fn test_adopts_floating_ip_by_description() {
        let harness = Harness::new();
        let seeded = harness.cloud.seed_floating_ip("172.24.9.9", "default/web").await;
        let key = harness.apply("web", |_| {});

        reconcile(&mut harness.reconciliation(&key), &harness.clients())
            .await
            .unwrap();

        assert_eq!(harness.cloud.floating_ips().await.len(), 1);
        let status = harness.get(&key).status_or_default();
        assert_eq!(status.floating_id, Some(seeded.id));
        assert_eq!(status.external_ip.as_deref(), Some("172.24.9.9"));
    }

    #[tokio::test]
    async fn test_missing_existing_floating_ip_keeps_failing() {
        let harness = Harness::new();
        let key = harness.apply("web", |lb| {
            lb.spec.existing_floating_ip = Some("1.2.3.4".into());
        });
        let clients = harness.clients();

        for _ in 0..3 {
            let err = reconcile(&mut harness.reconciliation(&key), &clients)
                .await
                .unwrap_err();
            assert_matches!(err, Error::ExistingFloatingIpNotFound { ref address } if address == "1.2.3.4");
            assert!(err.is_retryable());
        }
        assert!(harness.cloud.floating_ips().await.is_empty());
        assert_eq!(harness.events.warnings().len(), 3);

        harness.cloud.seed_floating_ip("1.2.3.4", "").await;
        reconcile(&mut harness.reconciliation(&key), &clients).await.unwrap();
        assert_eq!(
            harness.get(&key).status_or_default().external_ip.as_deref(),
            Some("1.2.3.4")
        );
    }

    #[tokio::test]
    async fn test_user_managed_floating_ip_is_renamed_on_collision() {
        let harness = Harness::new();
        let fip = harness.cloud.seed_floating_ip("1.2.3.4", "default/web").await;
        let key = harness.apply("web", |lb| {
            lb.spec.existing_floating_ip = Some("1.2.3.4".into());
        });

        reconcile(&mut harness.reconciliation(&key), &harness.clients())
            .await
            .unwrap();

        let renamed = harness
            .cloud
            .floating_ips()
            .await
            .into_iter()
            .find(|f| f.id == fip.id)
            .unwrap();
        assert_eq!(renamed.description, "default/web (user managed)");
    }

    #[tokio::test]
    async fn test_missing_floating_ip_clears_id() {
        let harness = Harness::new();
        let key = harness.apply("web", |_| {});
        let clients = harness.clients();
        reconcile(&mut harness.reconciliation(&key), &clients).await.unwrap();
        let id = harness.get(&key).status_or_default().floating_id.unwrap();
        harness.cloud.remove_out_of_band(&id).await;

        let outcome = reconcile(&mut harness.reconciliation(&key), &clients).await.unwrap();
        assert!(outcome.is_requeue());
        assert_eq!(harness.get(&key).status_or_default().floating_id, None);
    }

    #[tokio::test]
    async fn test_association_waits_for_port() {
        let harness = Harness::new();
        let key = harness.apply("web", |_| {});
        let clients = harness.clients();
        reconcile(&mut harness.reconciliation(&key), &clients).await.unwrap();

        let calls = harness.cloud.call_count();
        let outcome = associate(&mut harness.reconciliation(&key), &clients).await.unwrap();
        assert!(outcome.is_requeue());
        assert_eq!(harness.cloud.call_count(), calls);
    }

    #[tokio::test]
    async fn test_association_binds_once() {
        let harness = Harness::new();
        let port = harness.cloud.seed_port("default/web", "net-1", vec![]).await;
        let key = harness.apply("web", |_| {});
        let clients = harness.clients();
        reconcile(&mut harness.reconciliation(&key), &clients).await.unwrap();
        let mut rec = harness.reconciliation(&key);
        rec.patch_status(LoadBalancerStatus {
            port_id: Some(port.id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();

        associate(&mut rec, &clients).await.unwrap();
        let fip = &harness.cloud.floating_ips().await[0];
        assert_eq!(fip.port_id.as_deref(), Some(port.id.as_str()));
        assert_eq!(fip.status, FloatingIp::ACTIVE);

        let calls = harness.cloud.call_count();
        associate(&mut rec, &clients).await.unwrap();
        assert_eq!(harness.cloud.call_count(), calls + 1);
        assert_eq!(harness.events.count_reason(reasons::FLOATING_IP_BOUND), 1);
    }
}
