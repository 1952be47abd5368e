//! Discovery reads: listing, lookup, resolution, and change-watch streams
//!
//! Everything here reconstructs typed records from the flat Consul metadata
//! encoding written by the registrar. Clients are handed the advertised
//! host/port pair from metadata, never the record's (possibly internal)
//! address.

use crate::consul::registrar::{CAPABILITY_TAG_PREFIX, MODULE_TAG};
use crate::consul::{ConsulClient, ServiceEntry};
use crate::error::RegistryError;
use crate::proto::{
    GetModuleResponse, GetServiceResponse, HttpEndpoint, ListModulesResponse,
    ListServicesResponse, ResolveServiceRequest, ResolveServiceResponse, WatchModulesResponse,
    WatchServicesResponse,
};
use prost_types::Timestamp;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const WATCH_INTERVAL: Duration = Duration::from_secs(2);

fn now_timestamp() -> Timestamp {
    let now = chrono::Utc::now();
    Timestamp {
        seconds: now.timestamp(),
        nanos: now.timestamp_subsec_nanos() as i32,
    }
}

/// Handles service discovery and lookup operations
#[derive(Clone)]
pub struct ServiceDiscoveryHandler {
    consul: Arc<ConsulClient>,
}

impl ServiceDiscoveryHandler {
    pub fn new(consul: Arc<ConsulClient>) -> Self {
        Self { consul }
    }

    /// List all healthy non-module services.
    ///
    /// Consul failures degrade to an empty snapshot rather than erroring, so
    /// watch streams built on top never terminate.
    pub async fn list_services(&self) -> ListServicesResponse {
        let services = self
            .collect_healthy_entries(|entry| !is_module(&entry.service.tags))
            .await
            .into_iter()
            .map(|entry| convert_to_service_response(&entry))
            .collect::<Vec<_>>();

        ListServicesResponse {
            total_count: services.len() as i32,
            services,
            as_of: Some(now_timestamp()),
        }
    }

    /// List all healthy modules
    pub async fn list_modules(&self) -> ListModulesResponse {
        let modules = self
            .collect_healthy_entries(|entry| is_module(&entry.service.tags))
            .await
            .into_iter()
            .map(|entry| convert_to_module_response(&entry))
            .collect::<Vec<_>>();

        ListModulesResponse {
            total_count: modules.len() as i32,
            modules,
            as_of: Some(now_timestamp()),
        }
    }

    async fn collect_healthy_entries(
        &self,
        keep: impl Fn(&ServiceEntry) -> bool,
    ) -> Vec<ServiceEntry> {
        let names = match self.consul.catalog_services().await {
            Ok(names) => names,
            Err(e) => {
                error!("Failed to list catalog services from Consul: {}", e);
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        for name in names {
            match self.consul.health_service_nodes(&name, true).await {
                Ok(instances) => entries.extend(instances.into_iter().filter(&keep)),
                Err(e) => {
                    warn!("Failed to list instances of {}: {}", name, e);
                }
            }
        }
        entries
    }

    /// Get a service by name: first healthy instance wins
    pub async fn get_service_by_name(
        &self,
        service_name: &str,
    ) -> Result<GetServiceResponse, RegistryError> {
        let entries = self.consul.health_service_nodes(service_name, true).await?;
        entries
            .first()
            .map(convert_to_service_response)
            .ok_or_else(|| RegistryError::NotFound(format!("Service not found: {}", service_name)))
    }

    /// Get a service by its instance id
    pub async fn get_service_by_id(
        &self,
        service_id: &str,
    ) -> Result<GetServiceResponse, RegistryError> {
        let service_name = extract_service_name_from_id(service_id).ok_or_else(|| {
            RegistryError::Validation(format!("Invalid service ID format: {}", service_id))
        })?;

        let entries = self.consul.health_service_nodes(&service_name, true).await?;
        entries
            .iter()
            .find(|entry| entry.service.id == service_id)
            .map(convert_to_service_response)
            .ok_or_else(|| {
                RegistryError::NotFound(format!("Service instance not found: {}", service_id))
            })
    }

    /// Get a module by name: first healthy instance carrying the module tag
    pub async fn get_module_by_name(
        &self,
        module_name: &str,
    ) -> Result<GetModuleResponse, RegistryError> {
        let entries = self.consul.health_service_nodes(module_name, true).await?;
        entries
            .iter()
            .find(|entry| is_module(&entry.service.tags))
            .map(convert_to_module_response)
            .ok_or_else(|| RegistryError::NotFound(format!("Module not found: {}", module_name)))
    }

    /// Get a module by its instance id
    pub async fn get_module_by_id(
        &self,
        service_id: &str,
    ) -> Result<GetModuleResponse, RegistryError> {
        let module_name = extract_service_name_from_id(service_id).ok_or_else(|| {
            RegistryError::Validation(format!("Invalid module ID format: {}", service_id))
        })?;

        let entries = self.consul.health_service_nodes(&module_name, true).await?;
        entries
            .iter()
            .find(|entry| entry.service.id == service_id && is_module(&entry.service.tags))
            .map(convert_to_module_response)
            .ok_or_else(|| {
                RegistryError::NotFound(format!("Module instance not found: {}", service_id))
            })
    }

    /// Resolve a service to its best available instance
    pub async fn resolve_service(&self, request: ResolveServiceRequest) -> ResolveServiceResponse {
        let service_name = request.service_name.clone();

        match self
            .consul
            .health_service_nodes(&service_name, true)
            .await
        {
            Ok(entries) => resolve_from_entries(&request, entries),
            Err(e) => {
                error!("Failed to resolve service {}: {}", service_name, e);
                ResolveServiceResponse {
                    found: false,
                    service_name,
                    selection_reason: format!("Error resolving service: {}", e),
                    resolved_at: Some(now_timestamp()),
                    ..Default::default()
                }
            }
        }
    }

    /// Stream service-list snapshots: one immediately, then one every 2s.
    ///
    /// The stream ends only when the receiver is dropped.
    pub fn watch_services(&self) -> mpsc::Receiver<WatchServicesResponse> {
        let (tx, rx) = mpsc::channel(4);
        let handler = self.clone();

        tokio::spawn(async move {
            info!("Starting service watch stream");
            loop {
                let list = handler.list_services().await;
                let snapshot = WatchServicesResponse {
                    services: list.services,
                    as_of: list.as_of,
                    total_count: list.total_count,
                };
                if tx.send(snapshot).await.is_err() {
                    info!("Service watch stream cancelled by client");
                    break;
                }
                tokio::select! {
                    _ = tx.closed() => {
                        info!("Service watch stream cancelled by client");
                        break;
                    }
                    _ = tokio::time::sleep(WATCH_INTERVAL) => {}
                }
            }
        });

        rx
    }

    /// Stream module-list snapshots on the same cadence as `watch_services`
    pub fn watch_modules(&self) -> mpsc::Receiver<WatchModulesResponse> {
        let (tx, rx) = mpsc::channel(4);
        let handler = self.clone();

        tokio::spawn(async move {
            info!("Starting module watch stream");
            loop {
                let list = handler.list_modules().await;
                let snapshot = WatchModulesResponse {
                    modules: list.modules,
                    as_of: list.as_of,
                    total_count: list.total_count,
                };
                if tx.send(snapshot).await.is_err() {
                    info!("Module watch stream cancelled by client");
                    break;
                }
                tokio::select! {
                    _ = tx.closed() => {
                        info!("Module watch stream cancelled by client");
                        break;
                    }
                    _ = tokio::time::sleep(WATCH_INTERVAL) => {}
                }
            }
        });

        rx
    }
}

fn is_module(tags: &[String]) -> bool {
    tags.iter().any(|tag| tag == MODULE_TAG)
}

/// Split raw tags into plain tags and capability names
fn split_tags(raw: &[String]) -> (Vec<String>, Vec<String>) {
    let mut tags = Vec::new();
    let mut capabilities = Vec::new();
    for tag in raw {
        match tag.strip_prefix(CAPABILITY_TAG_PREFIX) {
            Some(capability) => capabilities.push(capability.to_string()),
            None => tags.push(tag.clone()),
        }
    }
    (tags, capabilities)
}

/// The host/port peers should dial: the advertised pair from metadata,
/// falling back to the record's own address for pre-encoding registrations.
fn advertised_endpoint(entry: &ServiceEntry) -> (String, i32) {
    let host = entry
        .service
        .meta
        .get("advertised-host")
        .cloned()
        .unwrap_or_else(|| entry.service.address.clone());
    let port = entry
        .service
        .meta
        .get("advertised-port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(entry.service.port as i32);
    (host, port)
}

fn convert_to_service_response(entry: &ServiceEntry) -> GetServiceResponse {
    let (host, port) = advertised_endpoint(entry);
    let (tags, capabilities) = split_tags(&entry.service.tags);
    let meta = &entry.service.meta;

    GetServiceResponse {
        service_id: entry.service.id.clone(),
        service_name: entry.service.service.clone(),
        host,
        port,
        version: meta.get("version").cloned().unwrap_or_default(),
        is_healthy: true,
        metadata: meta.clone(),
        tags,
        capabilities,
        http_endpoints: parse_http_endpoints(meta),
        http_schema_artifact_id: meta.get("http_schema_artifact_id").cloned(),
        http_schema_version: meta.get("http_schema_version").cloned(),
        registered_at: Some(now_timestamp()),
        last_health_check: Some(now_timestamp()),
    }
}

fn convert_to_module_response(entry: &ServiceEntry) -> GetModuleResponse {
    let (host, port) = advertised_endpoint(entry);
    let (tags, capabilities) = split_tags(&entry.service.tags);
    let meta = &entry.service.meta;

    GetModuleResponse {
        service_id: entry.service.id.clone(),
        module_name: entry.service.service.clone(),
        host,
        port,
        version: meta.get("version").cloned().unwrap_or_default(),
        is_healthy: true,
        metadata: meta.clone(),
        tags,
        capabilities,
        http_endpoints: parse_http_endpoints(meta),
        registered_at: Some(now_timestamp()),
        last_health_check: Some(now_timestamp()),
    }
}

/// Decode the flat `http_endpoint_{i}_*` metadata keys back into endpoints.
///
/// Malformed counts or entries are skipped rather than failing the read.
fn parse_http_endpoints(meta: &HashMap<String, String>) -> Vec<HttpEndpoint> {
    let Some(count) = meta
        .get("http_endpoint_count")
        .and_then(|c| c.parse::<usize>().ok())
    else {
        return Vec::new();
    };

    let mut endpoints = Vec::new();
    for i in 0..count {
        let prefix = format!("http_endpoint_{}_", i);

        let host = meta.get(&format!("{}host", prefix)).cloned().unwrap_or_default();
        let Some(port) = meta
            .get(&format!("{}port", prefix))
            .and_then(|p| p.parse::<i32>().ok())
        else {
            continue;
        };
        if host.is_empty() {
            continue;
        }

        endpoints.push(HttpEndpoint {
            scheme: meta
                .get(&format!("{}scheme", prefix))
                .cloned()
                .unwrap_or_default(),
            host,
            port,
            base_path: meta.get(&format!("{}base_path", prefix)).cloned(),
            health_path: meta.get(&format!("{}health_path", prefix)).cloned(),
            tls_enabled: meta
                .get(&format!("{}tls_enabled", prefix))
                .map(|v| v == "true")
                .unwrap_or(false),
        });
    }

    endpoints
}

/// Reconstruct the service name from a `name-host-port` id by peeling the
/// last two dash-separated tokens.
///
/// Hostnames containing dashes defeat this parse; discovery reads take the
/// name from the Consul record itself and only id lookups rely on it.
fn extract_service_name_from_id(service_id: &str) -> Option<String> {
    let without_port = &service_id[..service_id.rfind('-')?];
    let name_end = without_port.rfind('-')?;
    Some(without_port[..name_end].to_string())
}

/// Pick the best instance for a resolve request from the healthy set
fn resolve_from_entries(
    request: &ResolveServiceRequest,
    entries: Vec<ServiceEntry>,
) -> ResolveServiceResponse {
    let service_name = request.service_name.clone();

    if entries.is_empty() {
        return ResolveServiceResponse {
            found: false,
            service_name,
            total_instances: 0,
            healthy_instances: 0,
            selection_reason: "No healthy instances found".to_string(),
            resolved_at: Some(now_timestamp()),
            ..Default::default()
        };
    }

    let total = entries.len() as i32;

    let mut candidates: Vec<&ServiceEntry> = entries.iter().collect();

    if !request.required_tags.is_empty() {
        candidates.retain(|entry| {
            let tags: HashSet<&str> = entry.service.tags.iter().map(String::as_str).collect();
            request.required_tags.iter().all(|t| tags.contains(t.as_str()))
        });
    }

    if !request.required_capabilities.is_empty() {
        candidates.retain(|entry| {
            let capabilities: HashSet<&str> = entry
                .service
                .tags
                .iter()
                .filter_map(|tag| tag.strip_prefix(CAPABILITY_TAG_PREFIX))
                .collect();
            request
                .required_capabilities
                .iter()
                .all(|c| capabilities.contains(c.as_str()))
        });
    }

    if candidates.is_empty() {
        return ResolveServiceResponse {
            found: false,
            service_name,
            total_instances: total,
            healthy_instances: total,
            selection_reason: "No instances match the required criteria".to_string(),
            resolved_at: Some(now_timestamp()),
            ..Default::default()
        };
    }

    let healthy = candidates.len() as i32;

    // No guaranteed LB strategy: local preference, then the store's
    // iteration order.
    let (selected, selection_reason) = if request.prefer_local {
        candidates
            .iter()
            .find(|entry| {
                entry.service.address == "localhost" || entry.service.address == "127.0.0.1"
            })
            .map(|entry| (*entry, "Selected local instance as requested"))
            .unwrap_or((candidates[0], "Selected first available healthy instance"))
    } else {
        (candidates[0], "Selected first available healthy instance")
    };

    let (host, port) = advertised_endpoint(selected);
    let (tags, capabilities) = split_tags(&selected.service.tags);
    let meta = &selected.service.meta;

    debug!(
        "Resolved {} to instance {} ({})",
        service_name, selected.service.id, selection_reason
    );

    ResolveServiceResponse {
        found: true,
        service_name,
        host,
        port,
        service_id: selected.service.id.clone(),
        version: meta.get("version").cloned().unwrap_or_default(),
        tags,
        capabilities,
        http_endpoints: parse_http_endpoints(meta),
        http_schema_artifact_id: meta.get("http_schema_artifact_id").cloned(),
        http_schema_version: meta.get("http_schema_version").cloned(),
        metadata: meta.clone(),
        total_instances: total,
        healthy_instances: healthy,
        selection_reason: selection_reason.to_string(),
        resolved_at: Some(now_timestamp()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consul::client::{AgentService, HealthCheck};

    fn entry(id: &str, name: &str, address: &str, tags: Vec<&str>) -> ServiceEntry {
        ServiceEntry {
            service: AgentService {
                id: id.to_string(),
                service: name.to_string(),
                address: address.to_string(),
                port: 7000,
                tags: tags.into_iter().map(String::from).collect(),
                meta: HashMap::new(),
            },
            checks: vec![HealthCheck {
                status: "passing".to_string(),
            }],
        }
    }

    #[test]
    fn test_extract_service_name_from_id() {
        assert_eq!(
            extract_service_name_from_id("auth-svc-10.0.0.1-7000").as_deref(),
            Some("auth-svc")
        );
        assert_eq!(
            extract_service_name_from_id("ocr-localhost-50051").as_deref(),
            Some("ocr")
        );
        assert_eq!(extract_service_name_from_id("nodashes"), None);
    }

    #[test]
    fn test_http_endpoints_roundtrip_through_meta() {
        // Encode with the registrar, decode here: the discovery side must see
        // exactly what the registrant declared.
        use crate::proto::{Connectivity, RegisterRequest};

        let request = RegisterRequest {
            name: "svc".to_string(),
            connectivity: Some(Connectivity {
                advertised_host: "10.0.0.1".to_string(),
                advertised_port: 7000,
                internal_host: None,
                internal_port: None,
                tls_enabled: false,
            }),
            http_endpoints: vec![
                HttpEndpoint {
                    scheme: "http".to_string(),
                    host: "10.0.0.1".to_string(),
                    port: 8080,
                    base_path: Some("/api".to_string()),
                    health_path: Some("/health".to_string()),
                    tls_enabled: false,
                },
                HttpEndpoint {
                    scheme: "https".to_string(),
                    host: "10.0.0.1".to_string(),
                    port: 8443,
                    base_path: None,
                    health_path: None,
                    tls_enabled: true,
                },
            ],
            ..Default::default()
        };

        let registration =
            crate::consul::registrar::build_registration(&request, "svc-10.0.0.1-7000").unwrap();
        let decoded = parse_http_endpoints(&registration.meta);

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].scheme, "http");
        assert_eq!(decoded[0].base_path.as_deref(), Some("/api"));
        assert_eq!(decoded[1].port, 8443);
        assert!(decoded[1].tls_enabled);
    }

    #[test]
    fn test_conversion_prefers_advertised_pair() {
        let mut instance = entry("svc-10.0.0.1-7000", "svc", "172.17.0.2", vec![]);
        instance
            .service
            .meta
            .insert("advertised-host".to_string(), "10.0.0.1".to_string());
        instance
            .service
            .meta
            .insert("advertised-port".to_string(), "7000".to_string());

        let response = convert_to_service_response(&instance);
        assert_eq!(response.host, "10.0.0.1");
        assert_eq!(response.port, 7000);
    }

    #[test]
    fn test_resolve_no_instances() {
        let request = ResolveServiceRequest {
            service_name: "ghost".to_string(),
            ..Default::default()
        };
        let response = resolve_from_entries(&request, vec![]);
        assert!(!response.found);
        assert_eq!(response.total_instances, 0);
        assert_eq!(response.healthy_instances, 0);
        assert_eq!(response.selection_reason, "No healthy instances found");
    }

    #[test]
    fn test_resolve_capability_filter() {
        let a = entry(
            "ocr-10.0.0.1-7000",
            "ocr",
            "10.0.0.1",
            vec!["capability:ocr", "capability:french"],
        );
        let b = entry("ocr-10.0.0.2-7000", "ocr", "10.0.0.2", vec!["capability:ocr"]);

        let request = ResolveServiceRequest {
            service_name: "ocr".to_string(),
            required_capabilities: vec!["french".to_string()],
            ..Default::default()
        };
        let response = resolve_from_entries(&request, vec![a.clone(), b.clone()]);
        assert!(response.found);
        assert_eq!(response.service_id, "ocr-10.0.0.1-7000");

        let request = ResolveServiceRequest {
            service_name: "ocr".to_string(),
            required_capabilities: vec!["german".to_string()],
            ..Default::default()
        };
        let response = resolve_from_entries(&request, vec![a, b]);
        assert!(!response.found);
        assert_eq!(
            response.selection_reason,
            "No instances match the required criteria"
        );
    }

    #[test]
    fn test_resolve_tag_filter_miss() {
        let a = entry("svc-10.0.0.1-7000", "svc", "10.0.0.1", vec!["t2"]);
        let request = ResolveServiceRequest {
            service_name: "svc".to_string(),
            required_tags: vec!["t1".to_string()],
            ..Default::default()
        };
        let response = resolve_from_entries(&request, vec![a]);
        assert!(!response.found);
    }

    #[test]
    fn test_resolve_prefers_local_instance() {
        let remote = entry("svc-10.0.0.1-7000", "svc", "10.0.0.1", vec![]);
        let local = entry("svc-127.0.0.1-7000", "svc", "127.0.0.1", vec![]);

        let request = ResolveServiceRequest {
            service_name: "svc".to_string(),
            prefer_local: true,
            ..Default::default()
        };
        let response = resolve_from_entries(&request, vec![remote, local]);
        assert!(response.found);
        assert_eq!(response.service_id, "svc-127.0.0.1-7000");
        assert_eq!(response.selection_reason, "Selected local instance as requested");
    }

    #[test]
    fn test_capability_tags_split_out_of_plain_tags() {
        let instance = entry(
            "m-10.0.0.1-7000",
            "m",
            "10.0.0.1",
            vec!["module", "beta", "capability:ocr"],
        );
        let response = convert_to_module_response(&instance);
        assert_eq!(response.capabilities, vec!["ocr".to_string()]);
        assert!(response.tags.contains(&"module".to_string()));
        assert!(response.tags.contains(&"beta".to_string()));
        assert!(!response.tags.iter().any(|t| t.starts_with("capability:")));
    }
}
