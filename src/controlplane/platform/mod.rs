//! Platform Adapters
//!
//! Cloud networking backends behind the domain client traits:
//! - OpenStack Neutron over HTTP
//! - An in-memory cloud for tests and standalone runs

pub mod memory;
pub mod openstack;

pub use memory::*;
pub use openstack::*;

use crate::crd::LoadBalancer;
use crate::domain::ports::{CloudClientFactory, CloudClients};
use crate::error::Result;
use async_trait::async_trait;

/// Hands out the same clients for every LoadBalancer
pub struct StaticCloudFactory {
    clients: CloudClients,
}

impl StaticCloudFactory {
    pub fn new(clients: CloudClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl CloudClientFactory for StaticCloudFactory {
    async fn clients_for(&self, _lb: &LoadBalancer) -> Result<CloudClients> {
        Ok(self.clients.clone())
    }
}
