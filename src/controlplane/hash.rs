//! Content hashes
//!
//! Hashes are the first 16 hex characters of a SHA-256 over the JSON
//! encoding. Field order is fixed by the struct definitions and maps are
//! `BTreeMap`s, so the encoding is deterministic.

use crate::crd::{
    DebugSettings, LoadBalancer, LoadBalancerMachineSpec, LoadBalancerOptions, LoadBalancerPort,
    LoadBalancerRef,
};
use crate::error::Result;
use kube::ResourceExt;
use serde::Serialize;
use sha2::{Digest, Sha256};

const HASH_LEN: usize = 16;

pub fn content_hash<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    let digest = Sha256::digest(&bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    Ok(hex)
}

/// Machine template of the LoadBalancer's instances, attached to the
/// port currently recorded in status (empty while there is none).
pub fn machine_spec(lb: &LoadBalancer) -> LoadBalancerMachineSpec {
    LoadBalancerMachineSpec {
        infrastructure: lb.spec.infrastructure.clone(),
        port_id: lb.status_or_default().port_id.unwrap_or_default(),
        load_balancer_ref: LoadBalancerRef {
            namespace: lb.namespace().unwrap_or_default(),
            name: lb.name_any(),
        },
    }
}

pub fn machine_spec_hash(spec: &LoadBalancerMachineSpec) -> Result<String> {
    content_hash(spec)
}

/// Spec fields the cloud reconcile depends on
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileInputs<'a> {
    ports: &'a [LoadBalancerPort],
    options: &'a LoadBalancerOptions,
    existing_floating_ip: Option<&'a str>,
    network_id: &'a str,
    floating_net_id: Option<&'a str>,
    debug_settings: &'a DebugSettings,
}

pub fn reconcile_hash(lb: &LoadBalancer) -> Result<String> {
    content_hash(&ReconcileInputs {
        ports: &lb.spec.ports,
        options: &lb.spec.options,
        existing_floating_ip: lb.spec.existing_floating_ip.as_deref(),
        network_id: &lb.spec.infrastructure.network_id,
        floating_net_id: lb.spec.infrastructure.floating_net_id.as_deref(),
        debug_settings: &lb.spec.debug_settings,
    })
}
