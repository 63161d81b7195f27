//! Domain Ports - Core trait definitions for the LoadBalancer operator
//!
//! These traits define the boundaries between the reconcilers and external
//! systems: the cloud networking API (one capability trait per resource kind)
//! and the cluster object store. Adapters implement these traits to provide
//! concrete functionality.
//!
//! Every adapter reports a missing resource as [`Error::NotFound`](crate::Error::NotFound),
//! whatever shape the provider uses for it.

use crate::crd::{LoadBalancer, LoadBalancerSet, LoadBalancerStatus, StatusField};
use crate::error::Result;
use async_trait::async_trait;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Object Identity
// =============================================================================

/// Namespaced identity of a LoadBalancer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(lb: &LoadBalancer) -> Self {
        Self::new(lb.namespace().unwrap_or_default(), lb.name_any())
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for ObjectKey {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(crate::Error::Configuration(format!(
                "expected <namespace>/<name>, got {:?}",
                s
            ))),
        }
    }
}

// =============================================================================
// Cloud Resource Types
// =============================================================================

/// Neutron security group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "security_group_rules")]
    pub rules: Vec<SecurityGroupRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EtherType {
    IPv4,
    IPv6,
}

impl EtherType {
    pub fn any_prefix(&self) -> &'static str {
        match self {
            EtherType::IPv4 => "0.0.0.0/0",
            EtherType::IPv6 => "::/0",
        }
    }
}

/// Content signature of a security group rule; two rules with the same
/// signature are the same rule regardless of id or description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleSpec {
    pub direction: RuleDirection,
    #[serde(rename = "ethertype")]
    pub ether_type: EtherType,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub port_range_min: Option<u16>,
    #[serde(default)]
    pub port_range_max: Option<u16>,
    #[serde(default)]
    pub remote_ip_prefix: Option<String>,
    #[serde(default)]
    pub remote_group_id: Option<String>,
}

impl RuleSpec {
    /// Rule matching any traffic in one direction
    pub fn any(direction: RuleDirection, ether_type: EtherType) -> Self {
        Self {
            direction,
            ether_type,
            protocol: None,
            port_range_min: None,
            port_range_max: None,
            remote_ip_prefix: None,
            remote_group_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub id: String,
    pub security_group_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub spec: RuleSpec,
}

/// Neutron floating IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: String,
    #[serde(default)]
    pub floating_ip_address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub port_id: Option<String>,
    #[serde(default)]
    pub floating_network_id: Option<String>,
    #[serde(default)]
    pub status: String,
}

impl FloatingIp {
    pub const ACTIVE: &'static str = "ACTIVE";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    #[serde(default)]
    pub subnet_id: Option<String>,
    pub ip_address: String,
}

/// Neutron port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub network_id: String,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

// =============================================================================
// Filters and Parameters
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityGroupFilter {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleFilter {
    pub security_group_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FloatingIpFilter {
    pub description: Option<String>,
    pub floating_ip_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortFilter {
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupCreate {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityGroupUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleCreate {
    pub security_group_id: String,
    pub description: String,
    pub spec: RuleSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleUpdate {
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingIpCreate {
    pub description: String,
    pub floating_network_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FloatingIpUpdate {
    pub description: Option<String>,
    /// Port to associate the floating IP with
    pub port_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCreate {
    pub name: String,
    pub network_id: String,
    pub security_groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortUpdate {
    /// Replaces the whole security group list
    pub security_groups: Option<Vec<String>>,
}

// =============================================================================
// Cloud Client Ports
// =============================================================================

/// Security group operations
#[async_trait]
pub trait SecurityGroupClient: Send + Sync {
    async fn list(&self, filter: &SecurityGroupFilter) -> Result<Vec<SecurityGroup>>;
    async fn get(&self, id: &str) -> Result<SecurityGroup>;
    async fn create(&self, params: &SecurityGroupCreate) -> Result<SecurityGroup>;
    async fn update(&self, id: &str, params: &SecurityGroupUpdate) -> Result<SecurityGroup>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Security group rule operations
#[async_trait]
pub trait RuleClient: Send + Sync {
    async fn list(&self, filter: &RuleFilter) -> Result<Vec<SecurityGroupRule>>;
    async fn get(&self, id: &str) -> Result<SecurityGroupRule>;
    async fn create(&self, params: &RuleCreate) -> Result<SecurityGroupRule>;
    async fn update(&self, id: &str, params: &RuleUpdate) -> Result<SecurityGroupRule>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Floating IP operations
#[async_trait]
pub trait FloatingIpClient: Send + Sync {
    async fn list(&self, filter: &FloatingIpFilter) -> Result<Vec<FloatingIp>>;
    async fn get(&self, id: &str) -> Result<FloatingIp>;
    async fn create(&self, params: &FloatingIpCreate) -> Result<FloatingIp>;
    async fn update(&self, id: &str, params: &FloatingIpUpdate) -> Result<FloatingIp>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Port operations
#[async_trait]
pub trait PortClient: Send + Sync {
    async fn list(&self, filter: &PortFilter) -> Result<Vec<Port>>;
    async fn get(&self, id: &str) -> Result<Port>;
    async fn create(&self, params: &PortCreate) -> Result<Port>;
    async fn update(&self, id: &str, params: &PortUpdate) -> Result<Port>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Clients for one set of cloud credentials
#[derive(Clone)]
pub struct CloudClients {
    pub security_groups: Arc<dyn SecurityGroupClient>,
    pub rules: Arc<dyn RuleClient>,
    pub floating_ips: Arc<dyn FloatingIpClient>,
    pub ports: Arc<dyn PortClient>,
}

/// Resolves the credential reference of a LoadBalancer into cloud clients
#[async_trait]
pub trait CloudClientFactory: Send + Sync {
    async fn clients_for(&self, lb: &LoadBalancer) -> Result<CloudClients>;
}

pub type CloudClientFactoryRef = Arc<dyn CloudClientFactory>;

// =============================================================================
// Cluster Store Port
// =============================================================================

/// Access to LoadBalancers and their LoadBalancerSets.
///
/// Every write is a merge patch guarded by the object's resourceVersion.
/// Implementations retry conflicts by re-reading and reapplying the patch,
/// and return the object as stored after the write.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// `None` when the object does not exist (anymore)
    async fn get_load_balancer(&self, key: &ObjectKey) -> Result<Option<LoadBalancer>>;

    /// Merge the set fields of `patch` into the status
    async fn patch_status(&self, lb: &LoadBalancer, patch: &LoadBalancerStatus) -> Result<LoadBalancer>;

    /// Remove fields from the status
    async fn remove_status_fields(&self, lb: &LoadBalancer, fields: &[StatusField]) -> Result<LoadBalancer>;

    async fn set_revision(&self, lb: &LoadBalancer, revision: i64) -> Result<LoadBalancer>;

    async fn add_finalizer(&self, lb: &LoadBalancer, finalizer: &str) -> Result<LoadBalancer>;

    async fn remove_finalizer(&self, lb: &LoadBalancer, finalizer: &str) -> Result<()>;

    /// Sets carrying the owner label of this LoadBalancer
    async fn list_sets(&self, lb: &LoadBalancer) -> Result<Vec<LoadBalancerSet>>;

    async fn create_set(&self, set: &LoadBalancerSet) -> Result<LoadBalancerSet>;

    async fn scale_set(&self, set: &LoadBalancerSet, replicas: i32) -> Result<()>;

    /// Deleting a set that is already gone is not an error
    async fn delete_set(&self, set: &LoadBalancerSet) -> Result<()>;
}

pub type ClusterStoreRef = Arc<dyn ClusterStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_parse() {
        let key: ObjectKey = "default/web".parse().unwrap();
        assert_eq!(key, ObjectKey::new("default", "web"));
        assert_eq!(key.to_string(), "default/web");

        assert!("web".parse::<ObjectKey>().is_err());
        assert!("/web".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn test_rule_deserializes_from_neutron_shape() {
        let json = serde_json::json!({
            "id": "r-1",
            "security_group_id": "sg-1",
            "description": "",
            "direction": "ingress",
            "ethertype": "IPv4",
            "protocol": "tcp",
            "port_range_min": 80,
            "port_range_max": 80,
            "remote_ip_prefix": "0.0.0.0/0",
            "remote_group_id": null
        });
        let rule: SecurityGroupRule = serde_json::from_value(json).unwrap();
        assert_eq!(rule.spec.direction, RuleDirection::Ingress);
        assert_eq!(rule.spec.ether_type, EtherType::IPv4);
        assert_eq!(rule.spec.protocol.as_deref(), Some("tcp"));
        assert_eq!(rule.spec.remote_group_id, None);
    }
}
