//! Registration pipeline for platform services

use crate::consul::{generate_service_id, ConsulHealthChecker, ConsulRegistrar};
use crate::events::PlatformEventsProducer;
use crate::proto::{
    PlatformEventType, RegisterRequest, RegistrationEvent, UnregisterRequest, UnregisterResponse,
};
use crate::registration::{
    create_event, create_failure_event, emit, now_timestamp, validate_request, Compensation,
    CompensationStack,
};
use crate::repository::ApicurioClient;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Drives service registrations end-to-end:
/// validate, register with Consul, gate on health, archive the HTTP schema
/// when one is declared, publish the lifecycle event.
pub struct ServiceRegistrationHandler {
    registrar: Arc<ConsulRegistrar>,
    health_checker: Arc<ConsulHealthChecker>,
    apicurio: Arc<ApicurioClient>,
    events: Arc<PlatformEventsProducer>,
}

impl ServiceRegistrationHandler {
    pub fn new(
        registrar: Arc<ConsulRegistrar>,
        health_checker: Arc<ConsulHealthChecker>,
        apicurio: Arc<ApicurioClient>,
        events: Arc<PlatformEventsProducer>,
    ) -> Self {
        Self {
            registrar,
            health_checker,
            apicurio,
            events,
        }
    }

    /// Register a service with streaming status updates.
    ///
    /// The pipeline runs on its own task; dropping the receiver cancels it
    /// and unwinds whatever was already created.
    pub fn register(&self, request: RegisterRequest) -> mpsc::Receiver<RegistrationEvent> {
        let (tx, rx) = mpsc::channel(16);

        let registrar = self.registrar.clone();
        let health_checker = self.health_checker.clone();
        let apicurio = self.apicurio.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            run_pipeline(request, tx, registrar, health_checker, apicurio, events).await;
        });

        rx
    }

    /// Unregister a service by its `(name, host, port)` identity
    pub async fn unregister(&self, request: UnregisterRequest) -> UnregisterResponse {
        let service_id = generate_service_id(&request.name, &request.host, request.port);
        let success = self.registrar.deregister(&service_id).await;

        let message = if success {
            self.events
                .emit_service_unregistered(&service_id, &request.name);
            "Service unregistered successfully".to_string()
        } else {
            "Failed to unregister service".to_string()
        };

        UnregisterResponse {
            success,
            message,
            timestamp: Some(now_timestamp()),
        }
    }
}

async fn run_pipeline(
    request: RegisterRequest,
    tx: mpsc::Sender<RegistrationEvent>,
    registrar: Arc<ConsulRegistrar>,
    health_checker: Arc<ConsulHealthChecker>,
    apicurio: Arc<ApicurioClient>,
    events: Arc<PlatformEventsProducer>,
) {
    let (host, port) = request
        .connectivity
        .as_ref()
        .map(|c| (c.advertised_host.clone(), c.advertised_port))
        .unwrap_or_default();
    let service_id = generate_service_id(&request.name, &host, port);

    if !emit(
        &tx,
        create_event(
            PlatformEventType::Started,
            "Starting service registration",
            Some(&service_id),
        ),
    )
    .await
    {
        return;
    }

    if !validate_request(&request) {
        emit(
            &tx,
            create_failure_event(
                Some(&service_id),
                "Invalid service registration request",
                "Missing required fields",
            ),
        )
        .await;
        return;
    }

    if !emit(
        &tx,
        create_event(
            PlatformEventType::Validated,
            "Service registration request validated",
            None,
        ),
    )
    .await
    {
        return;
    }

    let mut compensations = CompensationStack::new();

    if !registrar.register(&request, &service_id).await {
        emit(
            &tx,
            create_failure_event(
                Some(&service_id),
                "Failed to register with Consul",
                "Consul registration returned false",
            ),
        )
        .await;
        return;
    }
    compensations.push(Compensation::DeregisterConsul {
        service_id: service_id.clone(),
    });

    let sent = emit(
        &tx,
        create_event(
            PlatformEventType::ConsulRegistered,
            "Service registered with Consul",
            Some(&service_id),
        ),
    )
    .await
        && emit(
            &tx,
            create_event(
                PlatformEventType::HealthCheckConfigured,
                "Health check configured",
                None,
            ),
        )
        .await;
    if !sent {
        compensations.unwind(&registrar, None).await;
        return;
    }

    // The health wait is the longest suspension point; abort it as soon as
    // the caller goes away instead of polling to the deadline.
    let healthy = tokio::select! {
        _ = tx.closed() => {
            compensations.unwind(&registrar, None).await;
            return;
        }
        healthy = health_checker.wait_for_healthy(&request.name, &service_id) => healthy,
    };
    if !healthy {
        emit(
            &tx,
            create_failure_event(
                Some(&service_id),
                "Service registered but failed health checks",
                "Service did not become healthy within timeout period. Check service logs and connectivity.",
            ),
        )
        .await;
        compensations.unwind(&registrar, None).await;
        return;
    }

    if !emit(
        &tx,
        create_event(
            PlatformEventType::ConsulHealthy,
            "Service reported healthy by Consul",
            None,
        ),
    )
    .await
    {
        compensations.unwind(&registrar, None).await;
        return;
    }

    // HTTP schema archival is best-effort: the service is already registered
    // and healthy, so a registry outage must not fail the stream.
    if let Some(http_schema) = request.http_schema.as_deref().filter(|s| !s.trim().is_empty()) {
        let schema_version = request
            .http_schema_version
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(&request.version);
        let artifact_base = request
            .http_schema_artifact_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{}-http", request.name));

        match apicurio
            .create_or_update_with_artifact_base(&artifact_base, schema_version, http_schema)
            .await
        {
            Ok(result) => {
                info!(
                    "Archived HTTP schema for {} as {}",
                    request.name, result.artifact_id
                );
                if !emit(
                    &tx,
                    create_event(
                        PlatformEventType::ApicurioRegistered,
                        "HTTP schema registered in Apicurio",
                        None,
                    ),
                )
                .await
                {
                    compensations.unwind(&registrar, None).await;
                    return;
                }
            }
            Err(e) => {
                warn!(
                    "Failed to register HTTP schema for service {}: {}",
                    request.name, e
                );
            }
        }
    }

    events.emit_service_registered(&service_id, &request.name, &host, port, &request.version);

    emit(
        &tx,
        create_event(
            PlatformEventType::Completed,
            "Service registration completed successfully",
            Some(&service_id),
        ),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApicurioConfig, ConsulConfig, HealthGateConfig, KafkaConfig};
    use crate::consul::ConsulClient;
    use crate::proto::Connectivity;

    // Consul is pointed at a closed port, so pipelines fail fast at the
    // registration stage with a clean FAILED event.
    fn handler_with_unreachable_consul() -> ServiceRegistrationHandler {
        let consul_config = ConsulConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_ms: 50,
            request_timeout_ms: 50,
            ..ConsulConfig::default()
        };
        let consul = Arc::new(ConsulClient::new(&consul_config).unwrap());
        ServiceRegistrationHandler::new(
            Arc::new(ConsulRegistrar::new(consul.clone())),
            Arc::new(ConsulHealthChecker::new(consul, &HealthGateConfig::default())),
            Arc::new(crate::repository::ApicurioClient::new(&ApicurioConfig::default()).unwrap()),
            Arc::new(PlatformEventsProducer::new(&KafkaConfig::default()).unwrap()),
        )
    }

    async fn collect_events(
        mut rx: mpsc::Receiver<RegistrationEvent>,
    ) -> Vec<RegistrationEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_invalid_request_fails_after_started() {
        let handler = handler_with_unreachable_consul();
        let request = RegisterRequest {
            name: "auth-svc".to_string(),
            ..Default::default()
        };

        let events = collect_events(handler.register(request)).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), PlatformEventType::Started);
        assert_eq!(events[1].event_type(), PlatformEventType::Failed);
        assert_eq!(
            events[1].error_detail.as_deref(),
            Some("Missing required fields")
        );
    }

    #[tokio::test]
    async fn test_consul_failure_terminates_stream() {
        let handler = handler_with_unreachable_consul();
        let request = RegisterRequest {
            name: "auth-svc".to_string(),
            connectivity: Some(Connectivity {
                advertised_host: "10.0.0.1".to_string(),
                advertised_port: 7000,
                internal_host: None,
                internal_port: None,
                tls_enabled: false,
            }),
            version: "1.0.0".to_string(),
            ..Default::default()
        };

        let events = collect_events(handler.register(request)).await;

        let types: Vec<PlatformEventType> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                PlatformEventType::Started,
                PlatformEventType::Validated,
                PlatformEventType::Failed,
            ]
        );
        assert_eq!(events[0].service_id.as_deref(), Some("auth-svc-10.0.0.1-7000"));
    }
}
