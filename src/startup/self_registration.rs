//! Self-registration of the registry process with Consul
//!
//! Runs the same registration pipeline the broker exposes to everyone else,
//! calling the local handler directly: going through our own gRPC front door
//! would deadlock startup.

use crate::config::SelfRegistrationConfig;
use crate::consul::{generate_service_id, ConsulClient};
use crate::proto::{Connectivity, PlatformEventType, RegisterRequest, ServiceType};
use crate::registration::ServiceRegistrationHandler;
use crate::startup::hostname::resolve_hostname_or;
use crate::REGISTRY_VERSION;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// gRPC service names this process serves, advertised in metadata
const SERVED_GRPC_SERVICES: &[&str] = &["platform.registration.v1.PlatformRegistration"];

pub struct SelfRegistration {
    config: SelfRegistrationConfig,
    handler: Arc<ServiceRegistrationHandler>,
    consul: Arc<ConsulClient>,
}

impl SelfRegistration {
    pub fn new(
        config: SelfRegistrationConfig,
        handler: Arc<ServiceRegistrationHandler>,
        consul: Arc<ConsulClient>,
    ) -> Self {
        Self {
            config,
            handler,
            consul,
        }
    }

    /// The id this process registers (and deregisters) under
    pub fn service_id(&self) -> String {
        generate_service_id(
            &self.config.service_name,
            &self.determine_host(),
            self.config.advertised_port as i32,
        )
    }

    /// Register this process on startup, if enabled.
    ///
    /// Outside production profiles, stale instances of our own name are
    /// deregistered first so restarts do not accumulate dead records.
    pub async fn register_on_startup(&self) {
        if !self.config.enabled {
            info!("Service registration disabled");
            return;
        }

        if self.should_cleanup_on_start() {
            info!(
                "Cleaning up existing registrations for {} before self-registration",
                self.config.service_name
            );
            self.cleanup_existing_registrations().await;
        }

        let request = self.build_register_request();
        info!(
            "Self-registering {} with Consul (local handler)",
            self.config.service_name
        );

        let mut events = self.handler.register(request);
        let service_name = self.config.service_name.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                info!(
                    "Self-registration event: {} - {}",
                    event.event_type().as_str_name(),
                    event.message
                );
                match event.event_type() {
                    PlatformEventType::Completed => {
                        info!("Successfully self-registered {} with Consul", service_name);
                    }
                    PlatformEventType::Failed => {
                        error!(
                            "Failed to self-register {}: {} ({})",
                            service_name,
                            event.message,
                            event.error_detail.as_deref().unwrap_or("no detail")
                        );
                    }
                    _ => {}
                }
            }
        });
    }

    /// Deregister on shutdown to avoid a stale record outliving the process
    pub async fn deregister_on_shutdown(&self) {
        if !self.config.enabled {
            return;
        }

        let service_id = self.service_id();
        info!("Deregistering {} from Consul on shutdown", service_id);
        match self.consul.deregister_service(&service_id).await {
            Ok(_) => info!("Deregistered {} from Consul", service_id),
            Err(e) => warn!("Failed to deregister {} from Consul: {}", service_id, e),
        }
    }

    fn build_register_request(&self) -> RegisterRequest {
        let host = self.determine_host();

        let mut metadata = HashMap::new();
        metadata.insert("description".to_string(), self.config.description.clone());
        metadata.insert("profile".to_string(), self.config.profile.clone());

        RegisterRequest {
            name: self.config.service_name.clone(),
            r#type: ServiceType::Service as i32,
            connectivity: Some(Connectivity {
                advertised_host: host,
                advertised_port: self.config.advertised_port as i32,
                internal_host: self.config.internal_host.clone(),
                internal_port: self
                    .config
                    .internal_port
                    .map(|p| p as i32)
                    .or_else(|| self.config.internal_host.as_ref().map(|_| self.config.advertised_port as i32)),
                tls_enabled: false,
            }),
            version: REGISTRY_VERSION.to_string(),
            metadata,
            tags: self.config.tags.clone(),
            capabilities: self.config.capabilities.clone(),
            grpc_services: SERVED_GRPC_SERVICES.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Advertised-host resolution: the shared env cascade, with the
    /// configured host slotted between the env overrides and the container
    /// fallbacks.
    fn determine_host(&self) -> String {
        resolve_hostname_or(
            Some(&self.config.service_name),
            Some(&self.config.advertised_host),
        )
    }

    fn should_cleanup_on_start(&self) -> bool {
        let profile = self.config.profile.trim().to_lowercase();
        profile != "prod" && profile != "production"
    }

    async fn cleanup_existing_registrations(&self) {
        let entries = match self
            .consul
            .health_service_nodes(&self.config.service_name, false)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Failed to list existing registrations for {}: {}",
                    self.config.service_name, e
                );
                return;
            }
        };

        for entry in entries {
            let service_id = entry.service.id;
            if service_id.is_empty() {
                continue;
            }
            match self.consul.deregister_service(&service_id).await {
                Ok(_) => info!("Deregistered stale service instance: {}", service_id),
                Err(e) => warn!(
                    "Failed to deregister stale service instance {}: {}",
                    service_id, e
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_skipped_for_prod_profiles() {
        let mut config = SelfRegistrationConfig {
            enabled: true,
            ..Default::default()
        };

        for profile in ["prod", "Production", " PROD "] {
            config.profile = profile.to_string();
            let registration = SelfRegistration::new(
                config.clone(),
                test_handler(),
                test_consul(),
            );
            assert!(!registration.should_cleanup_on_start(), "{}", profile);
        }

        config.profile = "dev".to_string();
        let registration = SelfRegistration::new(config, test_handler(), test_consul());
        assert!(registration.should_cleanup_on_start());
    }

    #[test]
    fn test_register_request_shape() {
        let config = SelfRegistrationConfig {
            enabled: true,
            service_name: "platform-registry".to_string(),
            advertised_host: "10.0.0.9".to_string(),
            advertised_port: 49000,
            capabilities: vec!["registration".to_string()],
            ..Default::default()
        };
        let registration = SelfRegistration::new(config, test_handler(), test_consul());

        let request = registration.build_register_request();
        assert_eq!(request.name, "platform-registry");
        assert_eq!(request.r#type(), ServiceType::Service);
        assert_eq!(
            request.connectivity.as_ref().unwrap().advertised_host,
            "10.0.0.9"
        );
        assert!(request
            .grpc_services
            .contains(&"platform.registration.v1.PlatformRegistration".to_string()));
        assert_eq!(
            registration.service_id(),
            "platform-registry-10.0.0.9-49000"
        );
    }

    fn test_consul() -> Arc<ConsulClient> {
        Arc::new(ConsulClient::new(&crate::config::ConsulConfig::default()).unwrap())
    }

    fn test_handler() -> Arc<ServiceRegistrationHandler> {
        use crate::config::{ApicurioConfig, HealthGateConfig, KafkaConfig};
        use crate::consul::{ConsulHealthChecker, ConsulRegistrar};
        use crate::events::PlatformEventsProducer;
        use crate::repository::ApicurioClient;

        let consul = test_consul();
        Arc::new(ServiceRegistrationHandler::new(
            Arc::new(ConsulRegistrar::new(consul.clone())),
            Arc::new(ConsulHealthChecker::new(
                consul,
                &HealthGateConfig::default(),
            )),
            Arc::new(ApicurioClient::new(&ApicurioConfig::default()).unwrap()),
            Arc::new(PlatformEventsProducer::new(&KafkaConfig::default()).unwrap()),
        ))
    }
}
