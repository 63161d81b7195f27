//! Custom Resource Definitions for the LoadBalancer operator
//!
//! This module contains all CRD types:
//! - LoadBalancer: desired load balancer, status written by the reconciler
//! - LoadBalancerSet: one generation of the load balancer instance fleet

pub mod load_balancer;
pub mod load_balancer_set;

pub use load_balancer::*;
pub use load_balancer_set::*;
