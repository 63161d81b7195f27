//! Cluster store adapters
//!
//! Both stores speak JSON merge patches (RFC 7386). Removing a status field
//! is a patch setting it to `null`. Every LoadBalancer write carries the
//! resourceVersion it was computed against.

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeStore;
pub use memory::InMemoryStore;

use crate::crd::{LoadBalancer, LoadBalancerStatus, StatusField, REVISION_ANNOTATION};
use crate::error::Result;
use kube::ResourceExt;
use serde_json::{json, Map, Value};

pub(crate) fn status_patch(patch: &LoadBalancerStatus) -> Result<Value> {
    Ok(json!({ "status": serde_json::to_value(patch)? }))
}

pub(crate) fn status_removal(fields: &[StatusField]) -> Value {
    let nulls: Map<String, Value> = fields
        .iter()
        .map(|f| (f.json_name().to_string(), Value::Null))
        .collect();
    json!({ "status": nulls })
}

pub(crate) fn revision_patch(revision: i64) -> Value {
    json!({ "metadata": { "annotations": { REVISION_ANNOTATION: revision.to_string() } } })
}

/// Merge patches replace lists whole, so finalizer patches are rebuilt from
/// whichever version of the object they end up applied to.
pub(crate) fn with_finalizer(lb: &LoadBalancer, finalizer: &str) -> Value {
    let mut finalizers = lb.finalizers().to_vec();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers_patch(&finalizers)
}

pub(crate) fn without_finalizer(lb: &LoadBalancer, finalizer: &str) -> Value {
    let finalizers: Vec<&String> = lb.finalizers().iter().filter(|f| *f != finalizer).collect();
    finalizers_patch(&finalizers)
}

fn finalizers_patch(finalizers: &[impl serde::Serialize]) -> Value {
    json!({ "metadata": { "finalizers": finalizers } })
}

pub(crate) fn replicas_patch(replicas: i32) -> Value {
    json!({ "spec": { "replicas": replicas } })
}

/// Pin a patch to the resourceVersion it was computed against
pub(crate) fn guarded(mut patch: Value, resource_version: Option<&str>) -> Value {
    if let (Some(rv), Some(obj)) = (resource_version, patch.as_object_mut()) {
        let metadata = obj
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.insert("resourceVersion".to_string(), Value::String(rv.to_string()));
        }
    }
    patch
}

/// Apply a JSON merge patch to `target` in place
pub fn merge_json(target: &mut Value, patch: &Value) {
    let Value::Object(patch_obj) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_obj) = target {
        for (key, value) in patch_obj {
            if value.is_null() {
                target_obj.remove(key);
            } else {
                merge_json(target_obj.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_json() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}, "list": [1, 2]});
        merge_json(&mut target, &json!({"b": {"c": null, "e": 4}, "list": [3], "f": "x"}));
        assert_eq!(target, json!({"a": 1, "b": {"d": 3, "e": 4}, "list": [3], "f": "x"}));
    }

    #[test]
    fn test_status_removal_body() {
        let body = status_removal(&[StatusField::PortId, StatusField::ExternalIp]);
        assert_eq!(body, json!({"status": {"portID": null, "externalIP": null}}));
    }

    #[test]
    fn test_finalizer_patches_keep_foreign_entries() {
        let mut lb = crate::crd::load_balancer::fixtures::load_balancer("default", "web");
        lb.finalizers_mut().push("other.io/protect".to_string());

        let added = with_finalizer(&lb, "network.billyronks.io/cleanup");
        assert_eq!(
            added["metadata"]["finalizers"],
            json!(["other.io/protect", "network.billyronks.io/cleanup"])
        );

        lb.finalizers_mut().push("network.billyronks.io/cleanup".to_string());
        assert_eq!(with_finalizer(&lb, "network.billyronks.io/cleanup"), added);

        let removed = without_finalizer(&lb, "network.billyronks.io/cleanup");
        assert_eq!(removed["metadata"]["finalizers"], json!(["other.io/protect"]));
    }

    #[test]
    fn test_guarded_adds_resource_version() {
        let body = guarded(revision_patch(2), Some("42"));
        assert_eq!(body["metadata"]["resourceVersion"], "42");
        assert_eq!(body["metadata"]["annotations"][REVISION_ANNOTATION], "2");

        let unguarded = guarded(replicas_patch(1), None);
        assert!(unguarded.get("metadata").is_none());
    }
}
