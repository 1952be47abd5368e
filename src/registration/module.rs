//! Registration pipeline for processing modules
//!
//! Deeper than the service pipeline: after the health gate the broker calls
//! the module back for its metadata, persists the module row and config
//! schema transactionally, then archives the schema in Apicurio.

use crate::consul::{generate_service_id, ConsulHealthChecker, ConsulRegistrar};
use crate::events::PlatformEventsProducer;
use crate::grpc::ModuleRegistrationProbe;
use crate::proto::{
    PlatformEventType, RegisterRequest, RegistrationEvent, ServiceRegistrationMetadata,
    UnregisterRequest, UnregisterResponse,
};
use crate::registration::{
    create_event, create_failure_event, emit, now_timestamp, synthesize_default_schema,
    validate_request, Compensation, CompensationStack,
};
use crate::repository::{ApicurioClient, ModuleRepository};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Drives module registrations end-to-end
pub struct ModuleRegistrationHandler {
    registrar: Arc<ConsulRegistrar>,
    health_checker: Arc<ConsulHealthChecker>,
    repository: Arc<ModuleRepository>,
    apicurio: Arc<ApicurioClient>,
    probe: Arc<dyn ModuleRegistrationProbe>,
    events: Arc<PlatformEventsProducer>,
}

impl ModuleRegistrationHandler {
    pub fn new(
        registrar: Arc<ConsulRegistrar>,
        health_checker: Arc<ConsulHealthChecker>,
        repository: Arc<ModuleRepository>,
        apicurio: Arc<ApicurioClient>,
        probe: Arc<dyn ModuleRegistrationProbe>,
        events: Arc<PlatformEventsProducer>,
    ) -> Self {
        Self {
            registrar,
            health_checker,
            repository,
            apicurio,
            probe,
            events,
        }
    }

    /// Register a module with streaming status updates
    pub fn register(&self, request: RegisterRequest) -> mpsc::Receiver<RegistrationEvent> {
        let (tx, rx) = mpsc::channel(16);

        let registrar = self.registrar.clone();
        let health_checker = self.health_checker.clone();
        let repository = self.repository.clone();
        let apicurio = self.apicurio.clone();
        let probe = self.probe.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            run_pipeline(
                request,
                tx,
                registrar,
                health_checker,
                repository,
                apicurio,
                probe,
                events,
            )
            .await;
        });

        rx
    }

    /// Unregister a module by its `(name, host, port)` identity.
    ///
    /// Removes the Consul record only; metadata rows are kept as history.
    pub async fn unregister(&self, request: UnregisterRequest) -> UnregisterResponse {
        let service_id = generate_service_id(&request.name, &request.host, request.port);
        let success = self.registrar.deregister(&service_id).await;

        let message = if success {
            self.events
                .emit_module_unregistered(&service_id, &request.name);
            "Module unregistered successfully".to_string()
        } else {
            "Failed to unregister module".to_string()
        };

        UnregisterResponse {
            success,
            message,
            timestamp: Some(now_timestamp()),
        }
    }
}

/// Fold the callback metadata into the JSON blob stored on the module row
pub(crate) fn build_metadata_map(metadata: &ServiceRegistrationMetadata) -> JsonValue {
    let mut map = serde_json::Map::new();
    for (key, value) in &metadata.metadata {
        map.insert(key.clone(), json!(value));
    }

    if let Some(ref display_name) = metadata.display_name {
        map.insert("display_name".to_string(), json!(display_name));
    }
    if let Some(ref description) = metadata.description {
        map.insert("description".to_string(), json!(description));
    }
    if let Some(ref owner) = metadata.owner {
        map.insert("owner".to_string(), json!(owner));
    }
    if let Some(ref documentation_url) = metadata.documentation_url {
        map.insert("documentation_url".to_string(), json!(documentation_url));
    }
    if !metadata.tags.is_empty() {
        map.insert("tags".to_string(), json!(metadata.tags));
    }
    if !metadata.dependencies.is_empty() {
        map.insert("dependencies".to_string(), json!(metadata.dependencies));
    }

    JsonValue::Object(map)
}

/// The callback's schema when it reported one, a synthesized default otherwise
pub(crate) fn extract_or_synthesize_schema(
    metadata: &ServiceRegistrationMetadata,
    module_name: &str,
) -> String {
    match metadata.json_config_schema.as_deref() {
        Some(schema) if !schema.trim().is_empty() => schema.to_string(),
        _ => synthesize_default_schema(module_name),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    request: RegisterRequest,
    tx: mpsc::Sender<RegistrationEvent>,
    registrar: Arc<ConsulRegistrar>,
    health_checker: Arc<ConsulHealthChecker>,
    repository: Arc<ModuleRepository>,
    apicurio: Arc<ApicurioClient>,
    probe: Arc<dyn ModuleRegistrationProbe>,
    events: Arc<PlatformEventsProducer>,
) {
    let (host, port) = request
        .connectivity
        .as_ref()
        .map(|c| (c.advertised_host.clone(), c.advertised_port))
        .unwrap_or_default();
    let module_name = request.name.clone();
    let version = request.version.clone();
    let service_id = generate_service_id(&module_name, &host, port);

    if !emit(
        &tx,
        create_event(
            PlatformEventType::Started,
            "Starting module registration",
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
                "Invalid module registration request",
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
            "Module registration request validated",
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
                "Consul registration failed",
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
            "Module registered with Consul",
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
        compensations.unwind(&registrar, Some(&repository)).await;
        return;
    }

    // Abort the health wait as soon as the caller goes away
    let healthy = tokio::select! {
        _ = tx.closed() => {
            compensations.unwind(&registrar, Some(&repository)).await;
            return;
        }
        healthy = health_checker.wait_for_healthy(&module_name, &service_id) => healthy,
    };
    if !healthy {
        emit(
            &tx,
            create_failure_event(
                Some(&service_id),
                "Module failed health checks",
                "Module did not become healthy within timeout period",
            ),
        )
        .await;
        compensations.unwind(&registrar, Some(&repository)).await;
        return;
    }

    if !emit(
        &tx,
        create_event(
            PlatformEventType::ConsulHealthy,
            "Module reported healthy by Consul",
            None,
        ),
    )
    .await
    {
        compensations.unwind(&registrar, Some(&repository)).await;
        return;
    }

    // Callback into the module for version, display metadata, and schema
    let metadata = match probe.get_service_registration(&module_name).await {
        Ok(metadata) => metadata,
        Err(e) => {
            emit(
                &tx,
                create_failure_event(
                    Some(&service_id),
                    "Failed to retrieve module metadata",
                    &e.to_string(),
                ),
            )
            .await;
            compensations.unwind(&registrar, Some(&repository)).await;
            return;
        }
    };

    if !emit(
        &tx,
        create_event(
            PlatformEventType::MetadataRetrieved,
            "Module metadata retrieved",
            None,
        ),
    )
    .await
    {
        compensations.unwind(&registrar, Some(&repository)).await;
        return;
    }

    let schema = extract_or_synthesize_schema(&metadata, &module_name);
    let metadata_map = build_metadata_map(&metadata);

    if !emit(
        &tx,
        create_event(
            PlatformEventType::SchemaValidated,
            "Schema validated or synthesized",
            None,
        ),
    )
    .await
    {
        compensations.unwind(&registrar, Some(&repository)).await;
        return;
    }

    let module = match repository
        .register_module(&module_name, &host, port, &version, metadata_map, &schema)
        .await
    {
        Ok(module) => module,
        Err(e) => {
            emit(
                &tx,
                create_failure_event(
                    Some(&service_id),
                    "Failed to save module registration",
                    &e.to_string(),
                ),
            )
            .await;
            compensations.unwind(&registrar, Some(&repository)).await;
            return;
        }
    };
    compensations.push(Compensation::DeleteModuleRow {
        service_id: service_id.clone(),
    });

    if !emit(
        &tx,
        create_event(
            PlatformEventType::DatabaseSaved,
            "Module registration saved to database",
            Some(&module.service_id),
        ),
    )
    .await
    {
        compensations.unwind(&registrar, Some(&repository)).await;
        return;
    }

    // Archive on a fresh task so the transactional scope above is fully
    // closed before the registry's HTTP round-trip starts.
    let archive_result = {
        let apicurio = apicurio.clone();
        let name = module_name.clone();
        let schema_version = version.clone();
        let schema_json = schema.clone();
        tokio::spawn(async move {
            apicurio
                .create_or_update(&name, &schema_version, &schema_json)
                .await
        })
        .await
    };

    let schema_id = module.config_schema_id.clone();
    let mut artifact_id = None;

    let archive_event = match archive_result {
        Ok(Ok(result)) => {
            if let Some(ref schema_id) = schema_id {
                if let Err(e) = repository
                    .mark_schema_synced(schema_id, &result.artifact_id, result.global_id)
                    .await
                {
                    error!("Failed to record schema sync for {}: {}", schema_id, e);
                }
            }
            artifact_id = Some(result.artifact_id);
            create_event(
                PlatformEventType::ApicurioRegistered,
                "Schema registered in Apicurio",
                None,
            )
        }
        Ok(Err(e)) => {
            warn!(
                "Apicurio registration failed for {}:{}, continuing without registry sync: {}",
                module_name, version, e
            );
            if let Some(ref schema_id) = schema_id {
                if let Err(mark_err) = repository.mark_schema_failed(schema_id, &e.to_string()).await
                {
                    error!("Failed to record sync failure for {}: {}", schema_id, mark_err);
                }
            }
            create_event(
                PlatformEventType::SchemaValidated,
                "Apicurio registry sync skipped (failure)",
                None,
            )
        }
        Err(e) => {
            warn!("Apicurio archive task failed for {}: {}", module_name, e);
            create_event(
                PlatformEventType::SchemaValidated,
                "Apicurio registry sync skipped (failure)",
                None,
            )
        }
    };

    if !emit(&tx, archive_event).await {
        compensations.unwind(&registrar, Some(&repository)).await;
        return;
    }

    events.emit_module_registered(
        &module.service_id,
        &module_name,
        &host,
        port,
        &version,
        schema_id,
        artifact_id,
    );

    emit(
        &tx,
        create_event(
            PlatformEventType::Completed,
            "Module registration completed successfully",
            Some(&module.service_id),
        ),
    )
    .await;
}
