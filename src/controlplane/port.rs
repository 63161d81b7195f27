//! Port reconciler
//!
//! The virtual port carries the load balancer address. The reconciler
//! assumes exclusive ownership of it: the security group list is collapsed
//! to the one group recorded in status.

use super::{Outcome, Reconciliation};
use crate::crd::{LoadBalancerStatus, StatusField};
use crate::domain::ports::{CloudClients, Port, PortCreate, PortFilter, PortUpdate};
use crate::error::{Error, Result};
use crate::events::{actions, reasons};
use tracing::{debug, info};

const KIND: &str = "port";

pub async fn reconcile(rec: &mut Reconciliation<'_>, cloud: &CloudClients) -> Result<Outcome> {
    let mut outcome = Outcome::Done;

    let name = match rec.status().port_name {
        Some(name) => name,
        None => {
            let name = rec.key();
            rec.patch_status(LoadBalancerStatus {
                port_name: Some(name.clone()),
                ..Default::default()
            })
            .await?;
            outcome = Outcome::requeue();
            name
        }
    };

    let id = match rec.status().port_id {
        Some(id) => id,
        None => {
            let port = adopt_or_create(rec, cloud, &name).await?;
            rec.patch_status(LoadBalancerStatus {
                port_id: Some(port.id.clone()),
                ..Default::default()
            })
            .await?;
            outcome = Outcome::requeue();
            port.id
        }
    };

    let mut port = match cloud.ports.get(&id).await {
        Ok(port) => port,
        Err(e) if e.is_not_found() => {
            info!("Port {} of {} is gone, clearing it from status", id, rec.key());
            rec.remove_status(&[StatusField::PortId]).await?;
            return Ok(Outcome::requeue());
        }
        Err(e) => return Err(rec.record(e).await),
    };

    if let Some(group) = rec.status().security_group_id {
        if port.security_groups != [group.as_str()] {
            info!("Setting security group of port {} to {}", port.id, group);
            port = bind_security_group(rec, cloud, &port, &group).await?;
            outcome = Outcome::requeue();
        }
        // the update above may have been answered with a stale port
        if !port.security_groups.contains(&group) {
            port = bind_security_group(rec, cloud, &port, &group).await?;
        }
    }

    if rec.lb.is_internal() {
        if let Some(fixed) = port.fixed_ips.first() {
            if rec.status().external_ip.as_deref() != Some(fixed.ip_address.as_str()) {
                info!("External IP of internal {} is {}", rec.key(), fixed.ip_address);
                rec.patch_status(LoadBalancerStatus {
                    external_ip: Some(fixed.ip_address.clone()),
                    ..Default::default()
                })
                .await?;
            }
        }
    }

    Ok(outcome)
}

async fn bind_security_group(
    rec: &Reconciliation<'_>,
    cloud: &CloudClients,
    port: &Port,
    group: &str,
) -> Result<Port> {
    let update = PortUpdate {
        security_groups: Some(vec![group.to_string()]),
    };
    rec.reported(cloud.ports.update(&port.id, &update).await).await
}

async fn adopt_or_create(rec: &Reconciliation<'_>, cloud: &CloudClients, name: &str) -> Result<Port> {
    let filter = PortFilter {
        name: Some(name.to_string()),
    };
    let existing = rec.reported(cloud.ports.list(&filter).await).await?;
    if let Some(port) = existing.into_iter().find(|p| p.name == name && !p.id.is_empty()) {
        info!("Adopting port {} ({})", name, port.id);
        rec.normal(reasons::ADOPTED, actions::CREATE, format!("Adopted port {}", port.id))
            .await;
        return Ok(port);
    }

    let params = PortCreate {
        name: name.to_string(),
        network_id: rec.lb.spec.infrastructure.network_id.clone(),
        security_groups: rec.status().security_group_id.into_iter().collect(),
    };
    debug!("Creating port {} in network {}", name, params.network_id);
    let port = rec.reported(cloud.ports.create(&params).await).await?;
    if port.id.is_empty() {
        return Err(rec.record(Error::EmptyResourceId { kind: KIND }).await);
    }
    info!("Created port {} ({})", name, port.id);
    rec.normal(
        reasons::PORT_CREATED,
        actions::CREATE,
        format!("Created port {}", port.id),
    )
    .await;
    Ok(port)
}
