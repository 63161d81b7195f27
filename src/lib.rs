//! Smart LB Operator
//!
//! A Kubernetes operator that drives `LoadBalancer` resources onto OpenStack
//! networking and a blue/green fleet of load balancer instances.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                  Controller runtime (kube-runtime)                │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                           Orchestrator                            │
//! │   gate ─▶ finalizer ─▶ cloud reconcile ─▶ rollout   (or deletion) │
//! │                                                                   │
//! │   ┌──────────────┐ ┌─────────────┐ ┌──────┐ ┌──────────────────┐  │
//! │   │SecurityGroup │ │ FloatingIP  │ │ Port │ │ FIP association  │  │
//! │   └──────────────┘ └─────────────┘ └──────┘ └──────────────────┘  │
//! ├───────────────────────────────┬───────────────────────────────────┤
//! │   Cluster store (status,      │   Cloud clients                   │
//! │   finalizers, sets)           │   (Neutron / in-memory)           │
//! └───────────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator, sub-reconcilers and cloud adapters
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Cloud records and the ports adapters implement
//! - [`store`]: Cluster store implementations
//! - [`events`]: Kubernetes Event publishing
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod events;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use controlplane::{
    InMemoryCloud, OpenStackCloudFactory, Orchestrator, OrchestratorConfig, Outcome,
    StaticCloudFactory,
};

pub use crd::{
    LoadBalancer, LoadBalancerSet, LoadBalancerSetSpec, LoadBalancerSpec, LoadBalancerStatus,
};

pub use domain::ports::{
    CloudClientFactory, CloudClients, ClusterStore, FloatingIpClient, ObjectKey, PortClient,
    RuleClient, SecurityGroupClient,
};

pub use error::{Error, ErrorAction, Result};

pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

pub use metrics::LoadBalancerMetrics;

pub use store::{InMemoryStore, KubeStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
