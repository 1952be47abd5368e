//! Thin HTTP client for the Consul agent API

use crate::config::ConsulConfig;
use crate::error::RegistryError;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Service registration payload for `PUT /v1/agent/service/register`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Meta")]
    pub meta: HashMap<String, String>,
    #[serde(rename = "Check", skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckRegistration>,
}

/// Health check definition attached to a service registration
#[derive(Debug, Clone, Serialize)]
pub struct CheckRegistration {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(rename = "GRPC", skip_serializing_if = "Option::is_none")]
    pub grpc: Option<String>,
    #[serde(rename = "Interval")]
    pub interval: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    pub deregister_critical_service_after: String,
}

/// One entry from `GET /v1/health/service/{name}`
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    #[serde(rename = "Service")]
    pub service: AgentService,
    #[serde(rename = "Checks", default)]
    pub checks: Vec<HealthCheck>,
}

impl ServiceEntry {
    /// Aggregated check status: healthy iff every check is passing
    pub fn is_passing(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.status == "passing")
    }
}

/// The service record inside a health entry
#[derive(Debug, Clone, Deserialize)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
    #[serde(rename = "Meta", default)]
    pub meta: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "Status")]
    pub status: String,
}

/// Client for the Consul agent HTTP API
///
/// Shared across the process; reqwest's client is already connection-pooled
/// and concurrent-safe.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http_client: HttpClient,
    base_url: String,
    token: Option<String>,
    datacenter: Option<String>,
}

impl ConsulClient {
    pub fn new(config: &ConsulConfig) -> Result<Self, RegistryError> {
        let http_client = HttpClient::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| {
                RegistryError::Configuration(format!("Failed to build Consul HTTP client: {}", e))
            })?;

        Ok(Self {
            http_client,
            base_url: config.base_url(),
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.base_url, path)
    }

    fn apply_auth(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref token) = self.token {
            request = request.header("X-Consul-Token", token);
        }
        if let Some(ref dc) = self.datacenter {
            request = request.query(&[("dc", dc)]);
        }
        request
    }

    /// Verify the agent is reachable
    pub async fn is_healthy(&self) -> bool {
        let request = self.apply_auth(self.http_client.get(self.url("/agent/self")));
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Register a service with the local agent
    pub async fn register_service(
        &self,
        registration: &ServiceRegistration,
    ) -> Result<(), RegistryError> {
        let request = self
            .apply_auth(self.http_client.put(self.url("/agent/service/register")))
            .json(registration);

        let response = request.send().await.map_err(|e| {
            RegistryError::ServiceDiscovery(format!("Consul register request failed: {}", e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::ServiceDiscovery(format!(
                "Consul rejected registration: HTTP {} - {}",
                status, body
            )));
        }

        debug!("Registered service {} with Consul", registration.id);
        Ok(())
    }

    /// Deregister a service from the local agent.
    ///
    /// Idempotent: deregistering an unknown id is not an error, but reports
    /// `false` so callers can distinguish "removed" from "was never there".
    pub async fn deregister_service(&self, service_id: &str) -> Result<bool, RegistryError> {
        let path = format!("/agent/service/deregister/{}", service_id);
        let request = self.apply_auth(self.http_client.put(self.url(&path)));

        let response = request.send().await.map_err(|e| {
            RegistryError::ServiceDiscovery(format!("Consul deregister request failed: {}", e))
        })?;

        if response.status().is_success() {
            return Ok(true);
        }
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::ServiceDiscovery(format!(
            "Consul rejected deregistration: HTTP {} - {}",
            status, body
        )))
    }

    /// List all service names known to the catalog
    pub async fn catalog_services(&self) -> Result<Vec<String>, RegistryError> {
        let request = self.apply_auth(self.http_client.get(self.url("/catalog/services")));

        let response = request.send().await.map_err(|e| {
            RegistryError::ServiceDiscovery(format!("Consul catalog request failed: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(RegistryError::ServiceDiscovery(format!(
                "Failed to list catalog services: HTTP {}",
                response.status()
            )));
        }

        let services: HashMap<String, Vec<String>> = response.json().await.map_err(|e| {
            RegistryError::ServiceDiscovery(format!("Failed to parse catalog response: {}", e))
        })?;

        Ok(services.into_keys().collect())
    }

    /// List instances of a service, optionally restricted to passing ones
    pub async fn health_service_nodes(
        &self,
        service_name: &str,
        passing_only: bool,
    ) -> Result<Vec<ServiceEntry>, RegistryError> {
        let path = format!("/health/service/{}", service_name);
        let mut request = self.apply_auth(self.http_client.get(self.url(&path)));
        if passing_only {
            request = request.query(&[("passing", "true")]);
        }

        let response = request.send().await.map_err(|e| {
            RegistryError::ServiceDiscovery(format!("Consul health request failed: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(RegistryError::ServiceDiscovery(format!(
                "Failed to list instances of {}: HTTP {}",
                service_name,
                response.status()
            )));
        }

        response.json().await.map_err(|e| {
            RegistryError::ServiceDiscovery(format!("Failed to parse health response: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_entry_aggregated_status() {
        let entry = ServiceEntry {
            service: AgentService {
                id: "svc-1".to_string(),
                service: "svc".to_string(),
                address: "10.0.0.1".to_string(),
                port: 7000,
                tags: vec![],
                meta: HashMap::new(),
            },
            checks: vec![
                HealthCheck {
                    status: "passing".to_string(),
                },
                HealthCheck {
                    status: "critical".to_string(),
                },
            ],
        };
        assert!(!entry.is_passing());

        let all_passing = ServiceEntry {
            checks: vec![HealthCheck {
                status: "passing".to_string(),
            }],
            ..entry
        };
        assert!(all_passing.is_passing());
    }

    #[test]
    fn test_registration_payload_shape() {
        let registration = ServiceRegistration {
            id: "svc-10.0.0.1-7000".to_string(),
            name: "svc".to_string(),
            address: "10.0.0.1".to_string(),
            port: 7000,
            tags: vec!["module".to_string()],
            meta: HashMap::from([("version".to_string(), "1.0.0".to_string())]),
            check: Some(CheckRegistration {
                name: "svc Health Check".to_string(),
                http: Some("http://10.0.0.1:7000/health".to_string()),
                grpc: None,
                interval: "10s".to_string(),
                deregister_critical_service_after: "1m".to_string(),
            }),
        };

        let json = serde_json::to_value(&registration).unwrap();
        assert_eq!(json["ID"], "svc-10.0.0.1-7000");
        assert_eq!(json["Check"]["HTTP"], "http://10.0.0.1:7000/health");
        assert_eq!(json["Check"]["DeregisterCriticalServiceAfter"], "1m");
        assert!(json["Check"].get("GRPC").is_none());
    }
}
