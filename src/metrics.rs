//! LoadBalancer Metrics
//!
//! Collectors are registered once on a registry owned by `main` and shared
//! by `Arc` with the reconcilers and the OpenStack adapter.

use crate::crd::LoadBalancer;
use crate::domain::ObjectKey;
use crate::error::Result;
use dashmap::DashMap;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

// =============================================================================
// Label Sets
// =============================================================================

const LB_LABELS: &[&str] = &["lb", "namespace"];
const INFO_LABELS: &[&str] = &["lb", "namespace", "is_internal", "tcp_proxy_protocol", "external_ip"];
const OPENSTACK_INFO_LABELS: &[&str] = &["lb", "namespace", "port_id", "floating_id", "security_group_id"];
const OPENSTACK_REQUEST_LABELS: &[&str] = &["api", "object", "operation"];

#[derive(Debug, Clone, PartialEq, Eq)]
struct InfoSeries {
    info: Vec<String>,
    openstack: Vec<String>,
}

// =============================================================================
// Metrics
// =============================================================================

pub struct LoadBalancerMetrics {
    openstack_requests: IntCounterVec,
    info: IntGaugeVec,
    openstack_info: IntGaugeVec,
    replicas: IntGaugeVec,
    replicas_current: IntGaugeVec,
    replicas_ready: IntGaugeVec,
    /// Label values of the info series last written per LoadBalancer
    series: DashMap<ObjectKey, InfoSeries>,
}

impl LoadBalancerMetrics {
    /// Create the collectors and register them on `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let openstack_requests = IntCounterVec::new(
            Opts::new("lb_openstack_requests_total", "OpenStack API calls made by the operator"),
            OPENSTACK_REQUEST_LABELS,
        )?;
        let info = IntGaugeVec::new(
            Opts::new("loadbalancer_info", "LoadBalancer information"),
            INFO_LABELS,
        )?;
        let openstack_info = IntGaugeVec::new(
            Opts::new("loadbalancer_openstack_info", "OpenStack resources of a LoadBalancer"),
            OPENSTACK_INFO_LABELS,
        )?;
        let replicas = IntGaugeVec::new(
            Opts::new("loadbalancer_replicas", "Desired replicas of a LoadBalancer"),
            LB_LABELS,
        )?;
        let replicas_current = IntGaugeVec::new(
            Opts::new("loadbalancer_replicas_current", "Current replicas of a LoadBalancer"),
            LB_LABELS,
        )?;
        let replicas_ready = IntGaugeVec::new(
            Opts::new("loadbalancer_replicas_ready", "Ready replicas of a LoadBalancer"),
            LB_LABELS,
        )?;

        registry.register(Box::new(openstack_requests.clone()))?;
        registry.register(Box::new(info.clone()))?;
        registry.register(Box::new(openstack_info.clone()))?;
        registry.register(Box::new(replicas.clone()))?;
        registry.register(Box::new(replicas_current.clone()))?;
        registry.register(Box::new(replicas_ready.clone()))?;

        Ok(Self {
            openstack_requests,
            info,
            openstack_info,
            replicas,
            replicas_current,
            replicas_ready,
            series: DashMap::new(),
        })
    }

    /// Count one cloud API call
    pub fn record_openstack_request(&self, api: &str, object: &str, operation: &str) {
        self.openstack_requests
            .with_label_values(&[api, object, operation])
            .inc();
    }

    /// Refresh every series of a LoadBalancer
    pub fn observe(&self, lb: &LoadBalancer) {
        let key = ObjectKey::of(lb);
        let status = lb.status_or_default();
        let lb_labels = [key.name.as_str(), key.namespace.as_str()];

        self.replicas
            .with_label_values(&lb_labels)
            .set(i64::from(lb.spec.replicas));
        self.replicas_current
            .with_label_values(&lb_labels)
            .set(i64::from(status.replicas.unwrap_or_default()));
        self.replicas_ready
            .with_label_values(&lb_labels)
            .set(i64::from(status.ready_replicas.unwrap_or_default()));

        let series = InfoSeries {
            info: vec![
                key.name.clone(),
                key.namespace.clone(),
                lb.spec.options.internal_lb.to_string(),
                lb.spec.options.tcp_proxy_protocol.to_string(),
                status.external_ip.clone().unwrap_or_default(),
            ],
            openstack: vec![
                key.name.clone(),
                key.namespace.clone(),
                status.port_id.clone().unwrap_or_default(),
                status.floating_id.clone().unwrap_or_default(),
                status.security_group_id.clone().unwrap_or_default(),
            ],
        };

        if let Some(previous) = self.series.insert(key, series.clone()) {
            if previous != series {
                self.remove_info(&previous);
            }
        }
        self.info.with_label_values(&as_strs(&series.info)).set(1);
        self.openstack_info
            .with_label_values(&as_strs(&series.openstack))
            .set(1);
    }

    /// Drop every series of a deleted LoadBalancer
    pub fn forget(&self, lb: &LoadBalancer) {
        let key = ObjectKey::of(lb);
        let lb_labels = [key.name.as_str(), key.namespace.as_str()];
        let _ = self.replicas.remove_label_values(&lb_labels);
        let _ = self.replicas_current.remove_label_values(&lb_labels);
        let _ = self.replicas_ready.remove_label_values(&lb_labels);
        if let Some((_, previous)) = self.series.remove(&key) {
            self.remove_info(&previous);
        }
    }

    fn remove_info(&self, series: &InfoSeries) {
        let _ = self.info.remove_label_values(&as_strs(&series.info));
        let _ = self
            .openstack_info
            .remove_label_values(&as_strs(&series.openstack));
    }
}

fn as_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}
