//! OpenStack Platform Adapter
//!
//! Talks to Neutron (security groups, rules, floating IPs, ports) over its
//! v2.0 REST API, authenticating with Keystone v3 passwords. The token is
//! cached until shortly before it expires.

use crate::crd::LoadBalancer;
use crate::domain::ports::*;
use crate::error::{Error, Result};
use crate::metrics::LoadBalancerMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, ResourceExt};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SERVICE: &str = "neutron";

// =============================================================================
// Configuration
// =============================================================================

/// Credentials and endpoint selection for one OpenStack project
#[derive(Debug, Clone)]
pub struct OpenStackConfig {
    /// Keystone v3 auth URL
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub user_domain_name: String,
    pub project_domain_name: String,
    /// Region of the network endpoint; any region when empty
    pub region: String,
    /// Endpoint interface (public, internal, admin)
    pub interface: String,
    /// Deadline of every single request
    pub timeout: Duration,
}

impl Default for OpenStackConfig {
    fn default() -> Self {
        Self {
            auth_url: "http://keystone:5000/v3".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            project_name: "admin".to_string(),
            user_domain_name: "Default".to_string(),
            project_domain_name: "Default".to_string(),
            region: "RegionOne".to_string(),
            interface: "public".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

impl OpenStackConfig {
    /// Read the credential keys of a Secret
    pub fn from_secret(secret_name: &str, secret: &Secret, timeout: Duration) -> Result<Self> {
        let data = secret.data.clone().unwrap_or_default();
        let value = |key: &str| -> Option<String> {
            data.get(key)
                .and_then(|v| String::from_utf8(v.0.clone()).ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &str| -> Result<String> {
            value(key).ok_or_else(|| Error::Credentials {
                secret: secret_name.to_string(),
                reason: format!("missing key {}", key),
            })
        };

        let defaults = Self::default();
        Ok(Self {
            auth_url: required("auth-url")?,
            username: required("username")?,
            password: required("password")?,
            project_name: required("project-name")?,
            user_domain_name: value("user-domain-name").unwrap_or(defaults.user_domain_name),
            project_domain_name: value("project-domain-name").unwrap_or(defaults.project_domain_name),
            region: value("region").unwrap_or_default(),
            interface: value("interface").unwrap_or(defaults.interface),
            timeout,
        })
    }
}

// =============================================================================
// Keystone
// =============================================================================

#[derive(Debug, Clone)]
struct Session {
    token: String,
    network_endpoint: String,
    expires_at: DateTime<Utc>,
}

impl Session {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - ChronoDuration::minutes(5) > now
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

fn network_endpoint(catalog: &[CatalogEntry], interface: &str, region: &str) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == "network")
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| {
            ep.interface == interface
                && (region.is_empty()
                    || ep.region.as_deref() == Some(region)
                    || ep.region_id.as_deref() == Some(region))
        })
        .map(|ep| ep.url.trim_end_matches('/').to_string())
}

fn password_auth_body(config: &OpenStackConfig) -> Value {
    json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": config.username,
                        "domain": {"name": config.user_domain_name},
                        "password": config.password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": config.project_name,
                    "domain": {"name": config.project_domain_name},
                }
            }
        }
    })
}

fn unwrap_envelope<T: DeserializeOwned>(mut body: Value, key: &str) -> Result<T> {
    let inner = body
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| Error::CloudApi {
            service: SERVICE.to_string(),
            reason: format!("response without {:?}", key),
        })?;
    Ok(serde_json::from_value(inner)?)
}

// =============================================================================
// Neutron Client
// =============================================================================

/// Neutron client implementing all four cloud capability traits
pub struct NeutronClient {
    http: reqwest::Client,
    config: OpenStackConfig,
    session: RwLock<Option<Session>>,
    metrics: Arc<LoadBalancerMetrics>,
}

impl NeutronClient {
    pub fn new(config: OpenStackConfig, metrics: Arc<LoadBalancerMetrics>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            config,
            session: RwLock::new(None),
            metrics,
        })
    }

    pub fn clients(self: &Arc<Self>) -> CloudClients {
        CloudClients {
            security_groups: self.clone(),
            rules: self.clone(),
            floating_ips: self.clone(),
            ports: self.clone(),
        }
    }

    async fn session(&self) -> Result<Session> {
        let now = Utc::now();
        if let Some(session) = self.session.read().await.as_ref() {
            if session.is_fresh(now) {
                return Ok(session.clone());
            }
        }

        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            if session.is_fresh(now) {
                return Ok(session.clone());
            }
        }
        let session = self.authenticate().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn authenticate(&self) -> Result<Session> {
        let url = format!("{}/auth/tokens", self.config.auth_url.trim_end_matches('/'));
        debug!("Requesting Keystone token for {}", self.config.username);
        self.metrics
            .record_openstack_request("keystone", "token", "create");

        let resp = self
            .http
            .post(&url)
            .json(&password_auth_body(&self.config))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::CloudApi {
                service: "keystone".to_string(),
                reason: format!("{}: {}", status, text),
            });
        }

        let token = resp
            .headers()
            .get("x-subject-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::CloudApi {
                service: "keystone".to_string(),
                reason: "response without X-Subject-Token".to_string(),
            })?;
        let body: TokenResponse = resp.json().await?;
        let network_endpoint =
            network_endpoint(&body.token.catalog, &self.config.interface, &self.config.region)
                .ok_or_else(|| Error::CloudApi {
                    service: "keystone".to_string(),
                    reason: format!(
                        "no {} network endpoint in region {:?}",
                        self.config.interface, self.config.region
                    ),
                })?;

        info!("Authenticated against Keystone, network endpoint {}", network_endpoint);
        Ok(Session {
            token,
            network_endpoint,
            expires_at: body.token.expires_at,
        })
    }

    async fn send(
        &self,
        method: Method,
        object: &'static str,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Option<Value>> {
        let session = self.session().await?;
        let operation = if method == Method::GET {
            "get"
        } else if method == Method::POST {
            "create"
        } else if method == Method::PUT {
            "update"
        } else if method == Method::DELETE {
            "delete"
        } else {
            "other"
        };
        self.metrics.record_openstack_request(SERVICE, object, operation);

        let url = format!("{}/v2.0/{}", session.network_endpoint, path);
        let mut request = self
            .http
            .request(method, &url)
            .header("X-Auth-Token", &session.token)
            .query(query);
        if let Some(body) = &body {
            request = request.json(body);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound {
                kind: object,
                id: path.rsplit('/').next().unwrap_or(path).to_string(),
            });
        }
        if status == StatusCode::UNAUTHORIZED {
            warn!("Neutron rejected the token, re-authenticating on next call");
            *self.session.write().await = None;
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::CloudApi {
                service: SERVICE.to_string(),
                reason: format!("{} {} {}: {}", operation, object, status, text),
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(resp.json().await?))
    }

    async fn list_of<T: DeserializeOwned>(
        &self,
        object: &'static str,
        collection: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let body = self
            .send(Method::GET, object, collection, query, None)
            .await?
            .unwrap_or(Value::Null);
        unwrap_envelope(body, collection_key(collection))
    }

    async fn one<T: DeserializeOwned>(
        &self,
        method: Method,
        object: &'static str,
        path: &str,
        key: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let resp = self
            .send(method, object, path, &[], body)
            .await?
            .unwrap_or(Value::Null);
        unwrap_envelope(resp, key)
    }

    async fn remove(&self, object: &'static str, collection: &str, id: &str) -> Result<()> {
        self.send(Method::DELETE, object, &format!("{}/{}", collection, id), &[], None)
            .await
            .map(|_| ())
    }
}

/// JSON key of a collection (`security-groups` -> `security_groups`)
fn collection_key(collection: &str) -> &'static str {
    match collection {
        "security-groups" => "security_groups",
        "security-group-rules" => "security_group_rules",
        "floatingips" => "floatingips",
        _ => "ports",
    }
}

fn filters(pairs: &[(&'static str, &Option<String>)]) -> Vec<(&'static str, String)> {
    pairs
        .iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (*key, v.clone())))
        .collect()
}

#[derive(Serialize)]
struct RuleBody<'a> {
    security_group_id: &'a str,
    description: &'a str,
    #[serde(flatten)]
    spec: &'a RuleSpec,
}

#[async_trait]
impl SecurityGroupClient for NeutronClient {
    async fn list(&self, filter: &SecurityGroupFilter) -> Result<Vec<SecurityGroup>> {
        let query = filters(&[("name", &filter.name)]);
        self.list_of("security group", "security-groups", &query).await
    }

    async fn get(&self, id: &str) -> Result<SecurityGroup> {
        let path = format!("security-groups/{}", id);
        self.one(Method::GET, "security group", &path, "security_group", None)
            .await
    }

    async fn create(&self, params: &SecurityGroupCreate) -> Result<SecurityGroup> {
        let body = json!({"security_group": {"name": params.name, "description": params.description}});
        self.one(Method::POST, "security group", "security-groups", "security_group", Some(body))
            .await
    }

    async fn update(&self, id: &str, params: &SecurityGroupUpdate) -> Result<SecurityGroup> {
        let mut fields = serde_json::Map::new();
        if let Some(name) = &params.name {
            fields.insert("name".into(), json!(name));
        }
        if let Some(description) = &params.description {
            fields.insert("description".into(), json!(description));
        }
        let path = format!("security-groups/{}", id);
        let body = json!({ "security_group": fields });
        self.one(Method::PUT, "security group", &path, "security_group", Some(body))
            .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.remove("security group", "security-groups", id).await
    }
}

#[async_trait]
impl RuleClient for NeutronClient {
    async fn list(&self, filter: &RuleFilter) -> Result<Vec<SecurityGroupRule>> {
        let query = filters(&[("security_group_id", &filter.security_group_id)]);
        self.list_of("security group rule", "security-group-rules", &query)
            .await
    }

    async fn get(&self, id: &str) -> Result<SecurityGroupRule> {
        let path = format!("security-group-rules/{}", id);
        self.one(Method::GET, "security group rule", &path, "security_group_rule", None)
            .await
    }

    async fn create(&self, params: &RuleCreate) -> Result<SecurityGroupRule> {
        let rule = serde_json::to_value(RuleBody {
            security_group_id: &params.security_group_id,
            description: &params.description,
            spec: &params.spec,
        })?;
        let body = json!({ "security_group_rule": rule });
        self.one(
            Method::POST,
            "security group rule",
            "security-group-rules",
            "security_group_rule",
            Some(body),
        )
        .await
    }

    async fn update(&self, id: &str, params: &RuleUpdate) -> Result<SecurityGroupRule> {
        let path = format!("security-group-rules/{}", id);
        let body = json!({"security_group_rule": {"description": params.description}});
        self.one(Method::PUT, "security group rule", &path, "security_group_rule", Some(body))
            .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.remove("security group rule", "security-group-rules", id)
            .await
    }
}

#[async_trait]
impl FloatingIpClient for NeutronClient {
    async fn list(&self, filter: &FloatingIpFilter) -> Result<Vec<FloatingIp>> {
        let query = filters(&[
            ("description", &filter.description),
            ("floating_ip_address", &filter.floating_ip_address),
        ]);
        self.list_of("floating ip", "floatingips", &query).await
    }

    async fn get(&self, id: &str) -> Result<FloatingIp> {
        let path = format!("floatingips/{}", id);
        self.one(Method::GET, "floating ip", &path, "floatingip", None)
            .await
    }

    async fn create(&self, params: &FloatingIpCreate) -> Result<FloatingIp> {
        let body = json!({"floatingip": {
            "description": params.description,
            "floating_network_id": params.floating_network_id,
        }});
        self.one(Method::POST, "floating ip", "floatingips", "floatingip", Some(body))
            .await
    }

    async fn update(&self, id: &str, params: &FloatingIpUpdate) -> Result<FloatingIp> {
        let mut fields = serde_json::Map::new();
        if let Some(description) = &params.description {
            fields.insert("description".into(), json!(description));
        }
        if let Some(port_id) = &params.port_id {
            fields.insert("port_id".into(), json!(port_id));
        }
        let path = format!("floatingips/{}", id);
        let body = json!({ "floatingip": fields });
        self.one(Method::PUT, "floating ip", &path, "floatingip", Some(body))
            .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.remove("floating ip", "floatingips", id).await
    }
}

#[async_trait]
impl PortClient for NeutronClient {
    async fn list(&self, filter: &PortFilter) -> Result<Vec<Port>> {
        let query = filters(&[("name", &filter.name)]);
        self.list_of("port", "ports", &query).await
    }

    async fn get(&self, id: &str) -> Result<Port> {
        let path = format!("ports/{}", id);
        self.one(Method::GET, "port", &path, "port", None).await
    }

    async fn create(&self, params: &PortCreate) -> Result<Port> {
        let body = json!({"port": {
            "name": params.name,
            "network_id": params.network_id,
            "security_groups": params.security_groups,
        }});
        self.one(Method::POST, "port", "ports", "port", Some(body))
            .await
    }

    async fn update(&self, id: &str, params: &PortUpdate) -> Result<Port> {
        let mut fields = serde_json::Map::new();
        if let Some(groups) = &params.security_groups {
            fields.insert("security_groups".into(), json!(groups));
        }
        let path = format!("ports/{}", id);
        let body = json!({ "port": fields });
        self.one(Method::PUT, "port", &path, "port", Some(body)).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.remove("port", "ports", id).await
    }
}

// =============================================================================
// Client Factory
// =============================================================================

/// Builds Neutron clients from the credential Secret a LoadBalancer
/// references, one client per Secret revision.
pub struct OpenStackCloudFactory {
    client: kube::Client,
    timeout: Duration,
    metrics: Arc<LoadBalancerMetrics>,
    /// secret key -> (resourceVersion, clients)
    cache: DashMap<String, (String, CloudClients)>,
}

impl OpenStackCloudFactory {
    pub fn new(client: kube::Client, timeout: Duration, metrics: Arc<LoadBalancerMetrics>) -> Self {
        Self {
            client,
            timeout,
            metrics,
            cache: DashMap::new(),
        }
    }
}

#[async_trait]
impl CloudClientFactory for OpenStackCloudFactory {
    async fn clients_for(&self, lb: &LoadBalancer) -> Result<CloudClients> {
        let secret_ref = &lb.spec.infrastructure.auth_secret_ref;
        let namespace = secret_ref
            .namespace
            .clone()
            .or_else(|| lb.namespace())
            .unwrap_or_default();
        let key = format!("{}/{}", namespace, secret_ref.name);

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = api
            .get_opt(&secret_ref.name)
            .await?
            .ok_or_else(|| Error::Credentials {
                secret: key.clone(),
                reason: "secret not found".to_string(),
            })?;
        let version = secret.resource_version().unwrap_or_default();

        if let Some(entry) = self.cache.get(&key) {
            if entry.0 == version {
                return Ok(entry.1.clone());
            }
        }

        info!("Building OpenStack clients from secret {}", key);
        let config = OpenStackConfig::from_secret(&key, &secret, self.timeout)?;
        let clients = Arc::new(NeutronClient::new(config, self.metrics.clone())?).clients();
        self.cache.insert(key, (version, clients.clone()));
        Ok(clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(pairs: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_from_secret() {
        let s = secret(&[
            ("auth-url", "https://keystone.example:5000/v3"),
            ("username", "lb-operator"),
            ("password", "hunter2\n"),
            ("project-name", "team-a"),
            ("region", "RegionTwo"),
        ]);
        let config = OpenStackConfig::from_secret("default/creds", &s, Duration::from_secs(5)).unwrap();
        assert_eq!(config.password, "hunter2");
        assert_eq!(config.user_domain_name, "Default");
        assert_eq!(config.region, "RegionTwo");
        assert_eq!(config.interface, "public");
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_missing_key() {
        let s = secret(&[("auth-url", "https://keystone.example:5000/v3")]);
        let err = OpenStackConfig::from_secret("default/creds", &s, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::Credentials { reason, .. } if reason.contains("username")));
    }

    #[test]
    fn test_network_endpoint_selection() {
        let body: TokenResponse = serde_json::from_value(json!({
            "token": {
                "expires_at": "2030-01-01T00:00:00.000000Z",
                "catalog": [
                    {"type": "compute", "endpoints": [
                        {"interface": "public", "region": "RegionOne", "url": "https://nova"}
                    ]},
                    {"type": "network", "endpoints": [
                        {"interface": "internal", "region": "RegionOne", "url": "https://neutron-int"},
                        {"interface": "public", "region": "RegionTwo", "url": "https://neutron-two/"},
                        {"interface": "public", "region_id": "RegionOne", "url": "https://neutron-one/"}
                    ]}
                ]
            }
        }))
        .unwrap();

        let catalog = &body.token.catalog;
        assert_eq!(
            network_endpoint(catalog, "public", "RegionOne").as_deref(),
            Some("https://neutron-one")
        );
        assert_eq!(
            network_endpoint(catalog, "internal", "").as_deref(),
            Some("https://neutron-int")
        );
        assert_eq!(network_endpoint(catalog, "admin", ""), None);
    }

    #[test]
    fn test_envelopes() {
        let fip: FloatingIp = unwrap_envelope(
            json!({"floatingip": {
                "id": "f-1",
                "floating_ip_address": "1.2.3.4",
                "description": "default/web",
                "port_id": null,
                "status": "DOWN"
            }}),
            "floatingip",
        )
        .unwrap();
        assert_eq!(fip.floating_ip_address, "1.2.3.4");

        let ports: Vec<Port> = unwrap_envelope(json!({"ports": []}), collection_key("ports")).unwrap();
        assert!(ports.is_empty());

        assert!(matches!(
            unwrap_envelope::<Port>(json!({}), "port"),
            Err(Error::CloudApi { .. })
        ));
    }

    #[test]
    fn test_session_freshness() {
        let now = Utc::now();
        let session = Session {
            token: "t".into(),
            network_endpoint: "https://neutron".into(),
            expires_at: now + ChronoDuration::minutes(30),
        };
        assert!(session.is_fresh(now));
        assert!(!session.is_fresh(now + ChronoDuration::minutes(26)));
    }

    #[test]
    fn test_rule_body_shape() {
        let spec = RuleSpec {
            protocol: Some("tcp".into()),
            port_range_min: Some(80),
            port_range_max: Some(80),
            remote_ip_prefix: Some("0.0.0.0/0".into()),
            ..RuleSpec::any(RuleDirection::Ingress, EtherType::IPv4)
        };
        let body = serde_json::to_value(RuleBody {
            security_group_id: "sg-1",
            description: "default/web",
            spec: &spec,
        })
        .unwrap();
        assert_eq!(body["ethertype"], "IPv4");
        assert_eq!(body["direction"], "ingress");
        assert_eq!(body["port_range_min"], 80);
        assert_eq!(body["security_group_id"], "sg-1");
    }
}
