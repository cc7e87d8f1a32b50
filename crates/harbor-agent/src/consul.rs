//! Consul agent HTTP client

use std::time::Duration;

use async_trait::async_trait;
use harbor_core::time::format_duration;
use harbor_core::{
    CHECK_TTL, CheckStatus, InstanceHandle, Registry, RegistryConfig, RegistryError, ServiceDescriptor,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    check: TtlCheck<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TtlCheck<'a> {
    #[serde(rename = "CheckID")]
    check_id: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deregister_critical_service_after: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckUpdate<'a> {
    status: &'a str,
    output: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct HealthEntry {
    #[serde(default)]
    node: HealthNode,
    service: HealthService,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(default)]
    address: String,
    port: u16,
}

impl HealthEntry {
    /// Consul leaves the service address empty when it equals the node's.
    pub(crate) fn address(&self) -> String {
        let host = if self.service.address.is_empty() {
            &self.node.address
        } else {
            &self.service.address
        };
        format!("{}:{}", host, self.service.port)
    }
}

/// Registry client speaking to a Consul agent over HTTP.
pub struct ConsulRegistry {
    client: reqwest::Client,
    config: RegistryConfig,
    base: Url,
    deregister_critical_after: Option<Duration>,
}

impl ConsulRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let base = Url::parse(&config.base_url()).map_err(|e| {
            RegistryError::Configuration(format!("invalid registry address {}: {e}", config.address()))
        })?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RegistryError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            config,
            base,
            deregister_critical_after: None,
        })
    }

    /// Lets Consul reap instances whose check stayed critical for `after`.
    pub fn with_deregister_critical_after(mut self, after: Duration) -> Self {
        self.deregister_critical_after = Some(after);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| RegistryError::Configuration(format!("{} cannot be a base url", self.base)))?;
            path.clear().extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match self.config.credentials() {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }

    async fn send(&self, operation: &str, builder: RequestBuilder) -> Result<Response, RegistryError> {
        builder
            .send()
            .await
            .map_err(|e| RegistryError::Registration(format!("{operation}: {e}")))
    }
}

async fn rejection(operation: &str, response: Response) -> RegistryError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    RegistryError::Registration(format!("{operation} rejected with {status}: {}", body.trim()))
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn register(&self, service: &ServiceDescriptor) -> Result<InstanceHandle, RegistryError> {
        service.validate()?;

        let handle = InstanceHandle::generate(&service.name);
        let payload = ServiceRegistration {
            id: handle.id(),
            name: &service.name,
            address: &service.host,
            port: service.port,
            tags: &service.tags,
            check: TtlCheck {
                check_id: handle.check_id(),
                ttl: format_duration(CHECK_TTL),
                deregister_critical_service_after: self.deregister_critical_after.map(format_duration),
            },
        };

        let url = self.endpoint(&["v1", "agent", "service", "register"])?;
        let response = self
            .send("register", self.request(Method::PUT, url).json(&payload))
            .await?;
        if !response.status().is_success() {
            return Err(rejection("register", response).await);
        }

        info!(instance = %handle, address = %service.address(), "Registered service with Consul");
        Ok(handle)
    }

    async fn deregister(&self, handle: &InstanceHandle) -> Result<(), RegistryError> {
        let url = self.endpoint(&["v1", "agent", "service", "deregister", handle.id()])?;
        let response = self.send("deregister", self.request(Method::PUT, url)).await?;
        match response.status() {
            status if status.is_success() => {
                info!(instance = %handle, "Deregistered service from Consul");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(RegistryError::InstanceNotFound(handle.id().to_string())),
            _ => Err(rejection("deregister", response).await),
        }
    }

    async fn service_addresses(&self, service_name: &str) -> Result<Vec<String>, RegistryError> {
        let mut url = self.endpoint(&["v1", "health", "service", service_name])?;
        url.query_pairs_mut().append_pair("passing", "true");

        let response = self.send("health query", self.request(Method::GET, url)).await?;
        if !response.status().is_success() {
            return Err(rejection("health query", response).await);
        }
        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| RegistryError::Registration(format!("health query: {e}")))?;

        debug!(service = service_name, count = entries.len(), "Queried healthy instances");
        if entries.is_empty() {
            return Err(RegistryError::NoAddressesFound(service_name.to_string()));
        }
        Ok(entries.iter().map(HealthEntry::address).collect())
    }

    async fn report_heartbeat(&self, handle: &InstanceHandle, status: CheckStatus) -> Result<(), RegistryError> {
        let url = self.endpoint(&["v1", "agent", "check", "update", handle.check_id()])?;
        let update = CheckUpdate {
            status: status.as_str(),
            output: "",
        };
        let response = self
            .send("heartbeat", self.request(Method::PUT, url).json(&update))
            .await?;
        if !response.status().is_success() {
            return Err(rejection("heartbeat", response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consul_registry_creation() {
        let consul = ConsulRegistry::new(RegistryConfig::default());
        assert!(consul.is_ok());
    }

    #[test]
    fn endpoints_escape_path_segments() {
        let consul = ConsulRegistry::new(RegistryConfig::new("consul.internal", 8500)).unwrap();
        let url = consul
            .endpoint(&["v1", "health", "service", "orders/v2"])
            .unwrap();
        assert_eq!(url.as_str(), "http://consul.internal:8500/v1/health/service/orders%2Fv2");
    }

    #[test]
    fn registration_payload_uses_consul_field_names() {
        let tags = vec!["v2".to_string()];
        let payload = ServiceRegistration {
            id: "orders-1",
            name: "orders",
            address: "10.0.0.5",
            port: 9000,
            tags: &tags,
            check: TtlCheck {
                check_id: "orders-1",
                ttl: format_duration(CHECK_TTL),
                deregister_critical_service_after: None,
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "ID": "orders-1",
                "Name": "orders",
                "Address": "10.0.0.5",
                "Port": 9000,
                "Tags": ["v2"],
                "Check": { "CheckID": "orders-1", "TTL": "5s" }
            })
        );
    }

    #[test]
    fn empty_service_address_falls_back_to_node() {
        let entries: Vec<HealthEntry> = serde_json::from_str(
            r#"[
                {"Node": {"Address": "10.0.0.9"}, "Service": {"Address": "", "Port": 9000}, "Checks": []},
                {"Node": {"Address": "10.0.0.9"}, "Service": {"Address": "10.0.0.5", "Port": 9001}}
            ]"#,
        )
        .unwrap();
        let addresses: Vec<String> = entries.iter().map(HealthEntry::address).collect();
        assert_eq!(addresses, vec!["10.0.0.9:9000", "10.0.0.5:9001"]);
    }
}
