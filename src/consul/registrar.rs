//! Maps registration requests onto Consul service records

use crate::consul::client::{CheckRegistration, ConsulClient, ServiceRegistration};
use crate::error::RegistryError;
use crate::proto::{HttpEndpoint, RegisterRequest, ServiceType};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// Tag that marks a registrant as a processing module during discovery reads
pub const MODULE_TAG: &str = "module";

/// Tag prefix for advertised capabilities
pub const CAPABILITY_TAG_PREFIX: &str = "capability:";

/// Generate the deterministic service id for a registrant.
///
/// Identical `(name, host, port)` triples always yield the same id, so
/// retried registrations converge on one Consul record.
pub fn generate_service_id(service_name: &str, host: &str, port: i32) -> String {
    format!("{}-{}-{}", service_name, host, port)
}

/// Consul forbids `.` in metadata keys; rewrite to `_`.
///
/// Cross-language interop contract: every consumer of the store applies the
/// same rewrite.
pub fn sanitize_meta_key(key: &str) -> String {
    key.replace('.', "_")
}

/// Handles service registration and unregistration with Consul
pub struct ConsulRegistrar {
    client: Arc<ConsulClient>,
}

impl ConsulRegistrar {
    pub fn new(client: Arc<ConsulClient>) -> Self {
        Self { client }
    }

    /// Register a service with Consul including health check configuration.
    ///
    /// Works for both services and modules; returns `false` on any Consul
    /// failure rather than propagating, so pipelines can emit a clean FAILED
    /// event.
    pub async fn register(&self, request: &RegisterRequest, service_id: &str) -> bool {
        let registration = match build_registration(request, service_id) {
            Ok(registration) => registration,
            Err(e) => {
                error!("Failed to build Consul registration for {}: {}", service_id, e);
                return false;
            }
        };

        info!(
            "Registering service with Consul: {} (type={})",
            service_id,
            request.r#type().as_str_name()
        );

        match self.client.register_service(&registration).await {
            Ok(()) => {
                info!("Successfully registered service: {}", service_id);
                true
            }
            Err(e) => {
                error!("Failed to register service {}: {}", service_id, e);
                false
            }
        }
    }

    /// Unregister a service from Consul.
    ///
    /// Idempotent: an already-gone record counts as success.
    pub async fn deregister(&self, service_id: &str) -> bool {
        info!("Unregistering service from Consul: {}", service_id);

        match self.client.deregister_service(service_id).await {
            Ok(gone) => {
                info!("Successfully unregistered service: {}", service_id);
                gone
            }
            Err(e) => {
                error!("Failed to unregister service {}: {}", service_id, e);
                false
            }
        }
    }
}

/// Build the Consul registration payload from a register request.
///
/// The record's address/port is the internal pair when present (the probe
/// must be able to reach it); the advertised pair is preserved in metadata
/// for clients to dial.
pub(crate) fn build_registration(
    request: &RegisterRequest,
    service_id: &str,
) -> Result<ServiceRegistration, RegistryError> {
    let connectivity = request
        .connectivity
        .as_ref()
        .ok_or_else(|| RegistryError::Validation("Missing connectivity".to_string()))?;

    let advertised_host = connectivity.advertised_host.as_str();
    let advertised_port = connectivity.advertised_port;
    let internal_host = connectivity
        .internal_host
        .as_deref()
        .unwrap_or(advertised_host);
    let internal_port = connectivity.internal_port.unwrap_or(advertised_port);

    let mut meta: HashMap<String, String> = request
        .metadata
        .iter()
        .map(|(k, v)| (sanitize_meta_key(k), v.clone()))
        .collect();

    meta.insert("advertised-host".to_string(), advertised_host.to_string());
    meta.insert("advertised-port".to_string(), advertised_port.to_string());
    meta.insert("version".to_string(), request.version.clone());
    meta.insert(
        "service-type".to_string(),
        request.r#type().as_str_name().to_string(),
    );

    if !request.grpc_services.is_empty() {
        meta.insert("grpc-services".to_string(), request.grpc_services.join(","));
    }

    if let Some(ref artifact_id) = request.http_schema_artifact_id {
        meta.insert("http_schema_artifact_id".to_string(), artifact_id.clone());
    }
    if let Some(ref schema_version) = request.http_schema_version {
        meta.insert("http_schema_version".to_string(), schema_version.clone());
    }

    encode_http_endpoints(&request.http_endpoints, &mut meta);

    let mut tags = request.tags.clone();
    for capability in &request.capabilities {
        tags.push(format!("{}{}", CAPABILITY_TAG_PREFIX, capability));
    }
    if request.r#type() == ServiceType::Module {
        tags.push(MODULE_TAG.to_string());
    }

    let check = build_check(request, internal_host, internal_port);

    Ok(ServiceRegistration {
        id: service_id.to_string(),
        name: request.name.clone(),
        address: internal_host.to_string(),
        port: internal_port as u16,
        tags,
        meta,
        check: Some(check),
    })
}

/// HTTP check when the request declares at least one HTTP endpoint, gRPC
/// check against the internal endpoint otherwise.
fn build_check(request: &RegisterRequest, internal_host: &str, internal_port: i32) -> CheckRegistration {
    if let Some(endpoint) = request.http_endpoints.first() {
        let health_path = endpoint.health_path.as_deref().unwrap_or_default();
        CheckRegistration {
            name: format!("{} HTTP Health Check", request.name),
            http: Some(format!(
                "{}://{}:{}{}",
                endpoint.scheme, endpoint.host, endpoint.port, health_path
            )),
            grpc: None,
            interval: "10s".to_string(),
            deregister_critical_service_after: "1m".to_string(),
        }
    } else {
        CheckRegistration {
            name: format!("{} gRPC Health Check", request.name),
            http: None,
            grpc: Some(format!("{}:{}", internal_host, internal_port)),
            interval: "10s".to_string(),
            deregister_critical_service_after: "1m".to_string(),
        }
    }
}

/// Serialize HTTP endpoints into the flat numeric-indexed meta encoding.
///
/// Third-party readers of the store depend on these exact keys.
fn encode_http_endpoints(endpoints: &[HttpEndpoint], meta: &mut HashMap<String, String>) {
    if endpoints.is_empty() {
        return;
    }

    meta.insert(
        "http_endpoint_count".to_string(),
        endpoints.len().to_string(),
    );

    for (i, endpoint) in endpoints.iter().enumerate() {
        let prefix = format!("http_endpoint_{}_", i);
        meta.insert(format!("{}scheme", prefix), endpoint.scheme.clone());
        meta.insert(format!("{}host", prefix), endpoint.host.clone());
        meta.insert(format!("{}port", prefix), endpoint.port.to_string());

        if let Some(base_path) = endpoint.base_path.as_deref() {
            if !base_path.is_empty() {
                meta.insert(format!("{}base_path", prefix), base_path.to_string());
            }
        }
        if let Some(health_path) = endpoint.health_path.as_deref() {
            if !health_path.is_empty() {
                meta.insert(format!("{}health_path", prefix), health_path.to_string());
            }
        }
        meta.insert(
            format!("{}tls_enabled", prefix),
            endpoint.tls_enabled.to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Connectivity;

    fn base_request(name: &str) -> RegisterRequest {
        RegisterRequest {
            name: name.to_string(),
            r#type: ServiceType::Service as i32,
            connectivity: Some(Connectivity {
                advertised_host: "10.0.0.1".to_string(),
                advertised_port: 7000,
                internal_host: None,
                internal_port: None,
                tls_enabled: false,
            }),
            version: "1.0.0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_service_id_is_deterministic() {
        let a = generate_service_id("auth-svc", "10.0.0.1", 7000);
        let b = generate_service_id("auth-svc", "10.0.0.1", 7000);
        assert_eq!(a, "auth-svc-10.0.0.1-7000");
        assert_eq!(a, b);

        let c = generate_service_id("auth-svc", "10.0.0.2", 7000);
        assert_ne!(a, c);
    }

    #[test]
    fn test_http_check_when_endpoint_provided() {
        let mut request = base_request("my-http-service");
        request.http_endpoints.push(HttpEndpoint {
            scheme: "http".to_string(),
            host: "10.0.0.1".to_string(),
            port: 8080,
            base_path: None,
            health_path: Some("/health".to_string()),
            tls_enabled: false,
        });

        let registration = build_registration(&request, "my-http-service-10.0.0.1-7000").unwrap();
        let check = registration.check.unwrap();

        assert!(check.grpc.is_none(), "should not have a gRPC check");
        assert_eq!(check.http.as_deref(), Some("http://10.0.0.1:8080/health"));
        assert_eq!(check.interval, "10s");
        assert_eq!(check.deregister_critical_service_after, "1m");
    }

    #[test]
    fn test_grpc_check_uses_internal_endpoint() {
        let mut request = base_request("grpc-svc");
        let connectivity = request.connectivity.as_mut().unwrap();
        connectivity.internal_host = Some("172.17.0.2".to_string());
        connectivity.internal_port = Some(9090);

        let registration = build_registration(&request, "grpc-svc-10.0.0.1-7000").unwrap();

        assert_eq!(registration.address, "172.17.0.2");
        assert_eq!(registration.port, 9090);

        let check = registration.check.unwrap();
        assert!(check.http.is_none());
        assert_eq!(check.grpc.as_deref(), Some("172.17.0.2:9090"));
    }

    #[test]
    fn test_advertised_pair_preserved_in_meta() {
        let mut request = base_request("svc");
        let connectivity = request.connectivity.as_mut().unwrap();
        connectivity.internal_host = Some("172.17.0.2".to_string());
        connectivity.internal_port = Some(9090);

        let registration = build_registration(&request, "svc-10.0.0.1-7000").unwrap();
        assert_eq!(registration.meta["advertised-host"], "10.0.0.1");
        assert_eq!(registration.meta["advertised-port"], "7000");
        assert_eq!(registration.meta["version"], "1.0.0");
        assert_eq!(registration.meta["service-type"], "SERVICE_TYPE_SERVICE");
    }

    #[test]
    fn test_dotted_meta_keys_are_sanitized() {
        let mut request = base_request("svc");
        request
            .metadata
            .insert("build.commit.sha".to_string(), "abc123".to_string());

        let registration = build_registration(&request, "svc-10.0.0.1-7000").unwrap();
        assert_eq!(registration.meta["build_commit_sha"], "abc123");
        assert!(!registration.meta.contains_key("build.commit.sha"));
    }

    #[test]
    fn test_capabilities_become_prefixed_tags_and_modules_are_tagged() {
        let mut request = base_request("pdf-extract");
        request.r#type = ServiceType::Module as i32;
        request.tags.push("beta".to_string());
        request.capabilities.push("ocr".to_string());

        let registration = build_registration(&request, "pdf-extract-10.0.0.1-7000").unwrap();
        assert!(registration.tags.contains(&"beta".to_string()));
        assert!(registration.tags.contains(&"capability:ocr".to_string()));
        assert!(registration.tags.contains(&MODULE_TAG.to_string()));
    }

    #[test]
    fn test_http_endpoints_flat_encoding() {
        let mut request = base_request("svc");
        request.http_endpoints.push(HttpEndpoint {
            scheme: "http".to_string(),
            host: "10.0.0.1".to_string(),
            port: 8080,
            base_path: Some("/api".to_string()),
            health_path: Some("/q/health".to_string()),
            tls_enabled: false,
        });
        request.http_endpoints.push(HttpEndpoint {
            scheme: "https".to_string(),
            host: "10.0.0.1".to_string(),
            port: 8443,
            base_path: None,
            health_path: None,
            tls_enabled: true,
        });

        let registration = build_registration(&request, "svc-10.0.0.1-7000").unwrap();
        let meta = &registration.meta;

        assert_eq!(meta["http_endpoint_count"], "2");
        assert_eq!(meta["http_endpoint_0_scheme"], "http");
        assert_eq!(meta["http_endpoint_0_port"], "8080");
        assert_eq!(meta["http_endpoint_0_base_path"], "/api");
        assert_eq!(meta["http_endpoint_0_health_path"], "/q/health");
        assert_eq!(meta["http_endpoint_0_tls_enabled"], "false");
        assert_eq!(meta["http_endpoint_1_scheme"], "https");
        assert_eq!(meta["http_endpoint_1_tls_enabled"], "true");
        assert!(!meta.contains_key("http_endpoint_1_base_path"));
        assert!(!meta.contains_key("http_endpoint_1_health_path"));
    }
}
