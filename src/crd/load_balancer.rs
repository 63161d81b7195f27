//! LoadBalancer CRD
//!
//! The desired-state object. The spec is owned by the user, the status is
//! written exclusively by the reconciler through merge patches.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Annotation carrying the current fleet revision (on LoadBalancers and sets)
pub const REVISION_ANNOTATION: &str = "network.billyronks.io/revision";

/// Finalizer guarding cloud resource cleanup
pub const LOAD_BALANCER_FINALIZER: &str = "network.billyronks.io/cleanup";

// =============================================================================
// LoadBalancer CRD
// =============================================================================

/// LoadBalancer describes a cloud load balancer: one security group, one
/// virtual port, an optional floating IP and a fleet of instances rolled out
/// through LoadBalancerSets.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.billyronks.io",
    version = "v1",
    kind = "LoadBalancer",
    plural = "loadbalancers",
    shortname = "lb",
    status = "LoadBalancerStatus",
    scale = r#"{"specReplicasPath": ".spec.replicas", "statusReplicasPath": ".status.replicas"}"#,
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicas"}"#,
    printcolumn = r#"{"name": "Ready", "type": "integer", "jsonPath": ".status.readyReplicas"}"#,
    printcolumn = r#"{"name": "External IP", "type": "string", "jsonPath": ".status.externalIP"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Desired number of load balancer instances
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Pre-existing floating IP address owned by the user
    #[serde(default, rename = "existingFloatingIP")]
    pub existing_floating_ip: Option<String>,

    /// Debug access to the instances
    #[serde(default)]
    pub debug_settings: DebugSettings,

    /// Backend endpoints traffic is forwarded to
    #[serde(default)]
    pub endpoints: Vec<LoadBalancerEndpoint>,

    /// Ports exposed by the load balancer
    #[serde(default)]
    pub ports: Vec<LoadBalancerPort>,

    /// Cloud placement of the load balancer
    pub infrastructure: LoadBalancerInfrastructure,

    #[serde(default)]
    pub options: LoadBalancerOptions,
}

fn default_replicas() -> i32 {
    1
}

// =============================================================================
// Sub-Types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DebugSettings {
    /// Opens TCP 22 on the security group
    #[serde(default)]
    pub enabled: bool,

    /// Keypair injected into the instances
    #[serde(default)]
    pub sshkey_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerEndpoint {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Transport protocol of an exposed port
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortProtocol::Tcp => write!(f, "tcp"),
            PortProtocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerPort {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub protocol: PortProtocol,

    /// Port exposed on the load balancer address
    pub port: u16,

    /// Port on the backend endpoints
    #[serde(default)]
    pub node_port: Option<u16>,
}

/// Flavor or image reference; exactly one of the fields is expected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenStackReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    /// Defaults to the namespace of the LoadBalancer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerInfrastructure {
    /// External network floating IPs are allocated from
    #[serde(default, rename = "floatingNetID", skip_serializing_if = "Option::is_none")]
    pub floating_net_id: Option<String>,

    /// Network the virtual port is created in
    #[serde(rename = "networkID")]
    pub network_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<OpenStackReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<OpenStackReference>,

    #[serde(default)]
    pub availability_zone: String,

    /// Secret holding the OpenStack credentials
    pub auth_secret_ref: SecretReference,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerOptions {
    /// Keep the load balancer on the internal network (no floating IP)
    #[serde(default, rename = "internalLB")]
    pub internal_lb: bool,

    /// CIDRs allowed to reach the exposed ports
    #[serde(default)]
    pub load_balancer_source_ranges: Vec<String>,

    #[serde(default)]
    pub tcp_proxy_protocol: bool,

    /// Ports the proxy protocol is limited to (all when empty)
    #[serde(default)]
    pub tcp_proxy_protocol_port_filter: Vec<u16>,
}

// =============================================================================
// Status
// =============================================================================

/// LoadBalancer status
///
/// Every field is optional and skipped when unset so that a value of this type
/// doubles as a merge patch carrying only the fields being written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,

    #[serde(default, rename = "externalIP", skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,

    #[serde(default, rename = "floatingID", skip_serializing_if = "Option::is_none")]
    pub floating_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floating_name: Option<String>,

    #[serde(default, rename = "portID", skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,

    #[serde(default, rename = "securityGroupID", skip_serializing_if = "Option::is_none")]
    pub security_group_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_group_name: Option<String>,

    /// Last completed cloud reconcile pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_openstack_reconcile: Option<DateTime<Utc>>,

    /// Hash of the spec fields the last cloud reconcile pass was based on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openstack_reconcile_hash: Option<String>,
}

/// Status fields the reconciler may remove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusField {
    ExternalIp,
    FloatingId,
    FloatingName,
    PortId,
    PortName,
    SecurityGroupId,
    SecurityGroupName,
}

impl StatusField {
    /// JSON key of the field in the status object
    pub fn json_name(&self) -> &'static str {
        match self {
            StatusField::ExternalIp => "externalIP",
            StatusField::FloatingId => "floatingID",
            StatusField::FloatingName => "floatingName",
            StatusField::PortId => "portID",
            StatusField::PortName => "portName",
            StatusField::SecurityGroupId => "securityGroupID",
            StatusField::SecurityGroupName => "securityGroupName",
        }
    }
}

impl std::fmt::Display for StatusField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.json_name())
    }
}

// =============================================================================
// Helpers
// =============================================================================

impl LoadBalancer {
    /// `namespace/name`, also used as the name of every owned cloud resource
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn status_or_default(&self) -> LoadBalancerStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn is_internal(&self) -> bool {
        self.spec.options.internal_lb
    }

    /// Current fleet revision; 0 when the annotation is absent
    pub fn revision(&self) -> Result<i64> {
        parse_revision(&self.key(), self.annotations().get(REVISION_ANNOTATION))
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }
}

pub(crate) fn parse_revision(object: &str, value: Option<&String>) -> Result<i64> {
    match value {
        None => Ok(0),
        Some(raw) => match raw.parse::<i64>() {
            Ok(rev) if rev >= 0 => Ok(rev),
            _ => Err(Error::InvalidRevision {
                object: object.to_string(),
                value: raw.clone(),
            }),
        },
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use kube::api::ObjectMeta;

    pub fn load_balancer(namespace: &str, name: &str) -> LoadBalancer {
        LoadBalancer {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: LoadBalancerSpec {
                replicas: 1,
                existing_floating_ip: None,
                debug_settings: DebugSettings::default(),
                endpoints: vec![],
                ports: vec![LoadBalancerPort {
                    name: Some("http".to_string()),
                    protocol: PortProtocol::Tcp,
                    port: 80,
                    node_port: Some(30080),
                }],
                infrastructure: LoadBalancerInfrastructure {
                    floating_net_id: Some("ext-net".to_string()),
                    network_id: "net-1".to_string(),
                    flavor: Some(OpenStackReference {
                        name: Some("m1.small".to_string()),
                        ..Default::default()
                    }),
                    image: None,
                    availability_zone: "nova".to_string(),
                    auth_secret_ref: SecretReference {
                        name: "cloud-credentials".to_string(),
                        namespace: None,
                    },
                },
                options: LoadBalancerOptions::default(),
            },
            status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_patch_serializes_only_set_fields() {
        let patch = LoadBalancerStatus {
            port_id: Some("p-1".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({"portID": "p-1"}));
    }

    #[test]
    fn test_spec_field_names() {
        let json = serde_json::json!({
            "existingFloatingIP": "1.2.3.4",
            "infrastructure": {
                "networkID": "net-1",
                "floatingNetID": "ext",
                "authSecretRef": {"name": "creds"}
            },
            "options": {"internalLB": true, "loadBalancerSourceRanges": ["10.0.0.0/8"]}
        });
        let spec: LoadBalancerSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.existing_floating_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(spec.infrastructure.network_id, "net-1");
        assert!(spec.options.internal_lb);
        assert!(spec.ports.is_empty());
    }

    #[test]
    fn test_revision_annotation() {
        let mut lb = fixtures::load_balancer("default", "web");
        assert_eq!(lb.revision().unwrap(), 0);

        lb.annotations_mut()
            .insert(REVISION_ANNOTATION.to_string(), "3".to_string());
        assert_eq!(lb.revision().unwrap(), 3);

        lb.annotations_mut()
            .insert(REVISION_ANNOTATION.to_string(), "three".to_string());
        assert!(matches!(lb.revision(), Err(Error::InvalidRevision { .. })));
    }

    #[test]
    fn test_key() {
        let lb = fixtures::load_balancer("team-a", "web");
        assert_eq!(lb.key(), "team-a/web");
    }

    #[test]
    fn test_status_field_names_match_serde() {
        let status = LoadBalancerStatus {
            external_ip: Some("x".into()),
            floating_id: Some("x".into()),
            floating_name: Some("x".into()),
            port_id: Some("x".into()),
            port_name: Some("x".into()),
            security_group_id: Some("x".into()),
            security_group_name: Some("x".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        for field in [
            StatusField::ExternalIp,
            StatusField::FloatingId,
            StatusField::FloatingName,
            StatusField::PortId,
            StatusField::PortName,
            StatusField::SecurityGroupId,
            StatusField::SecurityGroupName,
        ] {
            assert!(json.get(field.json_name()).is_some(), "{}", field);
        }
    }
}
