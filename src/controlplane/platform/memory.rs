//! In-memory cloud
//!
//! Behaves like Neutron for the subset of calls the reconcilers make:
//! exact-match list filters, default egress rules on new security groups,
//! floating IPs turning ACTIVE when associated with an existing port,
//! rule prefixes stored as network addresses. Individual operations can be
//! switched to fail for error path tests.
//! Used by the test suite and by `--standalone` runs.

use crate::domain::ports::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

const DOWN: &str = "DOWN";

// =============================================================================
// In-Memory Cloud
// =============================================================================

pub struct InMemoryCloud {
    security_groups: RwLock<BTreeMap<String, SecurityGroup>>,
    rules: RwLock<BTreeMap<String, SecurityGroupRule>>,
    floating_ips: RwLock<BTreeMap<String, FloatingIp>>,
    ports: RwLock<BTreeMap<String, Port>>,
    next_id: AtomicU64,
    /// Calls made through the client traits
    calls: AtomicU64,
    /// Create calls answer with an empty id and store nothing
    empty_ids: AtomicBool,
    /// (object, operation) pairs answering with a provider error
    failing: Mutex<BTreeSet<(String, String)>>,
    last_call: Mutex<Option<String>>,
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self {
            security_groups: RwLock::new(BTreeMap::new()),
            rules: RwLock::new(BTreeMap::new()),
            floating_ips: RwLock::new(BTreeMap::new()),
            ports: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            calls: AtomicU64::new(0),
            empty_ids: AtomicBool::new(false),
            failing: Mutex::new(BTreeSet::new()),
            last_call: Mutex::new(None),
        }
    }

    /// Client bundle backed by this cloud
    pub fn clients(self: &Arc<Self>) -> CloudClients {
        CloudClients {
            security_groups: self.clone(),
            rules: self.clone(),
            floating_ips: self.clone(),
            ports: self.clone(),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// "<object> <operation>" of the most recent call
    pub fn last_call(&self) -> Option<String> {
        self.last_call.lock().clone()
    }

    pub fn set_empty_ids(&self, enabled: bool) {
        self.empty_ids.store(enabled, Ordering::SeqCst);
    }

    /// Make `operation` on `object` ("security group", "security group rule",
    /// "floating ip", "port") fail with a provider error until healed
    pub fn fail(&self, object: &str, operation: &str) {
        self.failing
            .lock()
            .insert((object.to_string(), operation.to_string()));
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn call(&self, object: &str, operation: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!("in-memory cloud: {} {}", operation, object);
        *self.last_call.lock() = Some(format!("{} {}", object, operation));
        if self
            .failing
            .lock()
            .contains(&(object.to_string(), operation.to_string()))
        {
            return Err(Error::CloudApi {
                service: "neutron".to_string(),
                reason: format!("503 ServiceUnavailable ({} {})", operation, object),
            });
        }
        Ok(())
    }

    fn empty_ids(&self) -> bool {
        self.empty_ids.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Seeding (not counted as calls)
    // -------------------------------------------------------------------------

    /// Floating IP allocated outside the operator
    pub async fn seed_floating_ip(&self, address: &str, description: &str) -> FloatingIp {
        let fip = FloatingIp {
            id: format!("fip-{:04}", self.next()),
            floating_ip_address: address.to_string(),
            description: description.to_string(),
            port_id: None,
            floating_network_id: Some("ext-net".to_string()),
            status: DOWN.to_string(),
        };
        self.floating_ips
            .write()
            .await
            .insert(fip.id.clone(), fip.clone());
        fip
    }

    pub async fn seed_security_group(&self, name: &str) -> SecurityGroup {
        let group = SecurityGroup {
            id: format!("sg-{:04}", self.next()),
            name: name.to_string(),
            description: String::new(),
            rules: vec![],
        };
        self.security_groups
            .write()
            .await
            .insert(group.id.clone(), group.clone());
        group
    }

    pub async fn seed_port(&self, name: &str, network_id: &str, security_groups: Vec<String>) -> Port {
        let n = self.next();
        let port = Port {
            id: format!("port-{:04}", n),
            name: name.to_string(),
            network_id: network_id.to_string(),
            security_groups,
            fixed_ips: vec![FixedIp {
                subnet_id: None,
                ip_address: format!("10.0.{}.{}", n / 250, n % 250 + 1),
            }],
        };
        self.ports.write().await.insert(port.id.clone(), port.clone());
        port
    }

    // -------------------------------------------------------------------------
    // Inspection (not counted as calls)
    // -------------------------------------------------------------------------

    pub async fn security_groups(&self) -> Vec<SecurityGroup> {
        self.security_groups.read().await.values().cloned().collect()
    }

    pub async fn rules_of(&self, security_group_id: &str) -> Vec<SecurityGroupRule> {
        self.rules
            .read()
            .await
            .values()
            .filter(|r| r.security_group_id == security_group_id)
            .cloned()
            .collect()
    }

    pub async fn floating_ips(&self) -> Vec<FloatingIp> {
        self.floating_ips.read().await.values().cloned().collect()
    }

    pub async fn ports(&self) -> Vec<Port> {
        self.ports.read().await.values().cloned().collect()
    }

    /// Drop a resource behind the operator's back
    pub async fn remove_out_of_band(&self, id: &str) {
        self.security_groups.write().await.remove(id);
        self.rules.write().await.remove(id);
        self.floating_ips.write().await.remove(id);
        self.ports.write().await.remove(id);
    }

    fn not_found(kind: &'static str, id: &str) -> Error {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

// =============================================================================
// Security Groups
// =============================================================================

#[async_trait]
impl SecurityGroupClient for InMemoryCloud {
    async fn list(&self, filter: &SecurityGroupFilter) -> Result<Vec<SecurityGroup>> {
        self.call("security group", "list")?;
        let groups = self.security_groups.read().await;
        Ok(groups
            .values()
            .filter(|g| filter.name.as_ref().map_or(true, |n| &g.name == n))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<SecurityGroup> {
        self.call("security group", "get")?;
        let mut group = self
            .security_groups
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Self::not_found("security group", id))?;
        group.rules = self.rules_of(id).await;
        Ok(group)
    }

    async fn create(&self, params: &SecurityGroupCreate) -> Result<SecurityGroup> {
        self.call("security group", "create")?;
        if self.empty_ids() {
            return Ok(SecurityGroup {
                id: String::new(),
                name: params.name.clone(),
                description: params.description.clone(),
                rules: vec![],
            });
        }
        let group = SecurityGroup {
            id: format!("sg-{:04}", self.next()),
            name: params.name.clone(),
            description: params.description.clone(),
            rules: vec![],
        };
        info!("Creating security group: {} ({})", group.name, group.id);

        let mut rules = self.rules.write().await;
        for ether_type in [EtherType::IPv4, EtherType::IPv6] {
            let rule = SecurityGroupRule {
                id: format!("rule-{:04}", self.next()),
                security_group_id: group.id.clone(),
                description: String::new(),
                spec: RuleSpec::any(RuleDirection::Egress, ether_type),
            };
            rules.insert(rule.id.clone(), rule);
        }
        drop(rules);

        self.security_groups
            .write()
            .await
            .insert(group.id.clone(), group.clone());
        Ok(group)
    }

    async fn update(&self, id: &str, params: &SecurityGroupUpdate) -> Result<SecurityGroup> {
        self.call("security group", "update")?;
        let mut groups = self.security_groups.write().await;
        let group = groups
            .get_mut(id)
            .ok_or_else(|| Self::not_found("security group", id))?;
        if let Some(name) = &params.name {
            group.name = name.clone();
        }
        if let Some(description) = &params.description {
            group.description = description.clone();
        }
        Ok(group.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.call("security group", "delete")?;
        if self.security_groups.write().await.remove(id).is_none() {
            return Err(Self::not_found("security group", id));
        }
        self.rules
            .write()
            .await
            .retain(|_, r| r.security_group_id != id);
        Ok(())
    }
}

// =============================================================================
// Rules
// =============================================================================

#[async_trait]
impl RuleClient for InMemoryCloud {
    async fn list(&self, filter: &RuleFilter) -> Result<Vec<SecurityGroupRule>> {
        self.call("security group rule", "list")?;
        let rules = self.rules.read().await;
        Ok(rules
            .values()
            .filter(|r| {
                filter
                    .security_group_id
                    .as_ref()
                    .map_or(true, |id| &r.security_group_id == id)
            })
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<SecurityGroupRule> {
        self.call("security group rule", "get")?;
        self.rules
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Self::not_found("security group rule", id))
    }

    async fn create(&self, params: &RuleCreate) -> Result<SecurityGroupRule> {
        self.call("security group rule", "create")?;
        if !self
            .security_groups
            .read()
            .await
            .contains_key(&params.security_group_id)
        {
            return Err(Self::not_found("security group", &params.security_group_id));
        }
        let mut spec = params.spec.clone();
        if let Some(net) = spec.remote_ip_prefix.as_deref().and_then(|p| p.parse::<IpNet>().ok()) {
            spec.remote_ip_prefix = Some(net.trunc().to_string());
        }
        let mut rules = self.rules.write().await;
        if rules
            .values()
            .any(|r| r.security_group_id == params.security_group_id && r.spec == spec)
        {
            return Err(Error::CloudApi {
                service: "neutron".to_string(),
                reason: "409 SecurityGroupRuleExists".to_string(),
            });
        }
        let rule = SecurityGroupRule {
            id: if self.empty_ids() {
                String::new()
            } else {
                format!("rule-{:04}", self.next())
            },
            security_group_id: params.security_group_id.clone(),
            description: params.description.clone(),
            spec,
        };
        if !rule.id.is_empty() {
            rules.insert(rule.id.clone(), rule.clone());
        }
        Ok(rule)
    }

    async fn update(&self, id: &str, params: &RuleUpdate) -> Result<SecurityGroupRule> {
        self.call("security group rule", "update")?;
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(id)
            .ok_or_else(|| Self::not_found("security group rule", id))?;
        if let Some(description) = &params.description {
            rule.description = description.clone();
        }
        Ok(rule.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.call("security group rule", "delete")?;
        self.rules
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("security group rule", id))
    }
}

// =============================================================================
// Floating IPs
// =============================================================================

#[async_trait]
impl FloatingIpClient for InMemoryCloud {
    async fn list(&self, filter: &FloatingIpFilter) -> Result<Vec<FloatingIp>> {
        self.call("floating ip", "list")?;
        let fips = self.floating_ips.read().await;
        Ok(fips
            .values()
            .filter(|f| filter.description.as_ref().map_or(true, |d| &f.description == d))
            .filter(|f| {
                filter
                    .floating_ip_address
                    .as_ref()
                    .map_or(true, |a| &f.floating_ip_address == a)
            })
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<FloatingIp> {
        self.call("floating ip", "get")?;
        self.floating_ips
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Self::not_found("floating ip", id))
    }

    async fn create(&self, params: &FloatingIpCreate) -> Result<FloatingIp> {
        self.call("floating ip", "create")?;
        let n = self.next();
        let fip = FloatingIp {
            id: if self.empty_ids() {
                String::new()
            } else {
                format!("fip-{:04}", n)
            },
            floating_ip_address: format!("172.24.{}.{}", n / 250, n % 250 + 1),
            description: params.description.clone(),
            port_id: None,
            floating_network_id: params.floating_network_id.clone(),
            status: DOWN.to_string(),
        };
        if !fip.id.is_empty() {
            info!("Allocating floating IP: {} ({})", fip.floating_ip_address, fip.id);
            self.floating_ips
                .write()
                .await
                .insert(fip.id.clone(), fip.clone());
        }
        Ok(fip)
    }

    async fn update(&self, id: &str, params: &FloatingIpUpdate) -> Result<FloatingIp> {
        self.call("floating ip", "update")?;
        let port_exists = match &params.port_id {
            Some(port_id) => self.ports.read().await.contains_key(port_id),
            None => false,
        };
        let mut fips = self.floating_ips.write().await;
        let fip = fips
            .get_mut(id)
            .ok_or_else(|| Self::not_found("floating ip", id))?;
        if let Some(description) = &params.description {
            fip.description = description.clone();
        }
        if let Some(port_id) = &params.port_id {
            if !port_exists {
                return Err(Self::not_found("port", port_id));
            }
            fip.port_id = Some(port_id.clone());
            fip.status = FloatingIp::ACTIVE.to_string();
        }
        Ok(fip.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.call("floating ip", "delete")?;
        self.floating_ips
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("floating ip", id))
    }
}

// =============================================================================
// Ports
// =============================================================================

#[async_trait]
impl PortClient for InMemoryCloud {
    async fn list(&self, filter: &PortFilter) -> Result<Vec<Port>> {
        self.call("port", "list")?;
        let ports = self.ports.read().await;
        Ok(ports
            .values()
            .filter(|p| filter.name.as_ref().map_or(true, |n| &p.name == n))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Port> {
        self.call("port", "get")?;
        self.ports
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Self::not_found("port", id))
    }

    async fn create(&self, params: &PortCreate) -> Result<Port> {
        self.call("port", "create")?;
        let n = self.next();
        let port = Port {
            id: if self.empty_ids() {
                String::new()
            } else {
                format!("port-{:04}", n)
            },
            name: params.name.clone(),
            network_id: params.network_id.clone(),
            security_groups: params.security_groups.clone(),
            fixed_ips: vec![FixedIp {
                subnet_id: None,
                ip_address: format!("10.0.{}.{}", n / 250, n % 250 + 1),
            }],
        };
        if !port.id.is_empty() {
            info!("Creating port: {} ({})", port.name, port.id);
            self.ports.write().await.insert(port.id.clone(), port.clone());
        }
        Ok(port)
    }

    async fn update(&self, id: &str, params: &PortUpdate) -> Result<Port> {
        self.call("port", "update")?;
        let mut ports = self.ports.write().await;
        let port = ports.get_mut(id).ok_or_else(|| Self::not_found("port", id))?;
        if let Some(groups) = &params.security_groups {
            port.security_groups = groups.clone();
        }
        Ok(port.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.call("port", "delete")?;
        if self.ports.write().await.remove(id).is_none() {
            return Err(Self::not_found("port", id));
        }
        for fip in self.floating_ips.write().await.values_mut() {
            if fip.port_id.as_deref() == Some(id) {
                fip.port_id = None;
                fip.status = DOWN.to_string();
            }
        }
        Ok(())
    }
}
