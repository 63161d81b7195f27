//! LoadBalancerSet CRD
//!
//! One generation of the load balancer instance fleet. Sets are created and
//! scaled by the LoadBalancer reconciler; their own controller manages the
//! machines and reports readiness through the status.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::load_balancer::{parse_revision, LoadBalancerInfrastructure, REVISION_ANNOTATION};
use crate::error::Result;

/// Label carrying the name of the owning LoadBalancer
pub const LOAD_BALANCER_LABEL: &str = "network.billyronks.io/loadbalancer";

/// Label carrying the machine template hash
pub const HASH_LABEL: &str = "network.billyronks.io/hash";

// =============================================================================
// LoadBalancerSet CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.billyronks.io",
    version = "v1",
    kind = "LoadBalancerSet",
    plural = "loadbalancersets",
    shortname = "lbs",
    status = "LoadBalancerSetStatus",
    scale = r#"{"specReplicasPath": ".spec.replicas", "statusReplicasPath": ".status.replicas"}"#,
    printcolumn = r#"{"name": "Desired", "type": "integer", "jsonPath": ".spec.replicas"}"#,
    printcolumn = r#"{"name": "Current", "type": "integer", "jsonPath": ".status.replicas"}"#,
    printcolumn = r#"{"name": "Ready", "type": "integer", "jsonPath": ".status.readyReplicas"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSetSpec {
    /// Labels selecting the machines of this set
    #[serde(default)]
    pub selector: BTreeMap<String, String>,

    #[serde(default)]
    pub replicas: i32,

    pub template: LoadBalancerMachineTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerMachineTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub spec: LoadBalancerMachineSpec,
}

/// Fields defining a machine; a change to any of them starts a new generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerMachineSpec {
    pub infrastructure: LoadBalancerInfrastructure,

    /// Port the instances attach to
    #[serde(rename = "portID")]
    pub port_id: String,

    pub load_balancer_ref: LoadBalancerRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,
}

impl LoadBalancerSet {
    pub fn revision(&self) -> Result<i64> {
        let object = format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any());
        parse_revision(&object, self.annotations().get(REVISION_ANNOTATION))
    }

    pub fn template_hash(&self) -> Option<&str> {
        self.labels().get(HASH_LABEL).map(String::as_str)
    }

    /// Ready once the observed ready replicas reach the desired count.
    /// A set that has not reported readiness yet is not ready.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .map_or(false, |ready| ready >= self.spec.replicas)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::load_balancer::fixtures;
    use kube::api::ObjectMeta;

    fn set(replicas: i32, ready: Option<i32>) -> LoadBalancerSet {
        let lb = fixtures::load_balancer("default", "web");
        LoadBalancerSet {
            metadata: ObjectMeta {
                name: Some("web-abc".into()),
                namespace: Some("default".into()),
                labels: Some(BTreeMap::from([(HASH_LABEL.to_string(), "abc".to_string())])),
                annotations: Some(BTreeMap::from([(
                    REVISION_ANNOTATION.to_string(),
                    "2".to_string(),
                )])),
                ..Default::default()
            },
            spec: LoadBalancerSetSpec {
                selector: BTreeMap::new(),
                replicas,
                template: LoadBalancerMachineTemplate {
                    labels: BTreeMap::new(),
                    spec: LoadBalancerMachineSpec {
                        infrastructure: lb.spec.infrastructure,
                        port_id: "p-1".into(),
                        load_balancer_ref: LoadBalancerRef {
                            namespace: "default".into(),
                            name: "web".into(),
                        },
                    },
                },
            },
            status: ready.map(|r| LoadBalancerSetStatus {
                ready_replicas: Some(r),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_readiness() {
        assert!(!set(2, None).is_ready());
        assert!(!set(2, Some(1)).is_ready());
        assert!(set(2, Some(2)).is_ready());
        assert!(set(0, Some(0)).is_ready());
    }

    #[test]
    fn test_labels_and_revision() {
        let s = set(1, None);
        assert_eq!(s.template_hash(), Some("abc"));
        assert_eq!(s.revision().unwrap(), 2);
        assert!(!s.is_deleting());
    }
}
