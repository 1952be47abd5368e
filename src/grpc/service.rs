//! The platform registration gRPC service
//!
//! Thin wiring layer: requests are routed to the registration, discovery,
//! and schema handlers; streaming responses are backed by the handlers'
//! event channels.

use crate::discovery::ServiceDiscoveryHandler;
use crate::error::RegistryError;
use crate::proto::platform_registration_server::PlatformRegistration;
use crate::proto::{
    get_module_request, get_service_request, GetModuleRequest, GetModuleResponse,
    GetModuleSchemaRequest, GetModuleSchemaResponse, GetModuleSchemaVersionsRequest,
    GetModuleSchemaVersionsResponse, GetServiceRequest, GetServiceResponse, ListModulesRequest,
    ListModulesResponse, ListServicesRequest, ListServicesResponse, PlatformEventType,
    RegisterRequest, RegisterResponse, ResolveServiceRequest, ResolveServiceResponse, ServiceType,
    UnregisterRequest, UnregisterResponse, WatchModulesRequest, WatchModulesResponse,
    WatchServicesRequest, WatchServicesResponse,
};
use crate::registration::{ModuleRegistrationHandler, ServiceRegistrationHandler};
use crate::schema::SchemaRetrievalHandler;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::{debug, info};

fn status_from_error(error: RegistryError) -> Status {
    match error {
        RegistryError::NotFound(message) => Status::not_found(message),
        RegistryError::Validation(message) => Status::invalid_argument(message),
        RegistryError::Unavailable(message) => Status::unavailable(message),
        RegistryError::Timeout(message) => Status::deadline_exceeded(message),
        other => Status::internal(other.to_string()),
    }
}

/// Main platform registration service implementation
pub struct PlatformRegistrationService {
    service_handler: Arc<ServiceRegistrationHandler>,
    module_handler: Arc<ModuleRegistrationHandler>,
    discovery_handler: Arc<ServiceDiscoveryHandler>,
    schema_handler: Arc<SchemaRetrievalHandler>,
}

impl PlatformRegistrationService {
    pub fn new(
        service_handler: Arc<ServiceRegistrationHandler>,
        module_handler: Arc<ModuleRegistrationHandler>,
        discovery_handler: Arc<ServiceDiscoveryHandler>,
        schema_handler: Arc<SchemaRetrievalHandler>,
    ) -> Self {
        Self {
            service_handler,
            module_handler,
            discovery_handler,
            schema_handler,
        }
    }

    /// Stream rejecting a request whose kind is unspecified: STARTED then
    /// FAILED, with no external side effects.
    fn rejection_stream(request: &RegisterRequest) -> RegisterStream {
        let (host, port) = request
            .connectivity
            .as_ref()
            .map(|c| (c.advertised_host.clone(), c.advertised_port))
            .unwrap_or_default();
        let service_id = crate::consul::generate_service_id(&request.name, &host, port);

        let started = crate::registration::create_event(
            PlatformEventType::Started,
            "Starting registration",
            Some(&service_id),
        );
        let failed = crate::registration::create_failure_event(
            Some(&service_id),
            "Invalid registration request",
            "Missing required fields",
        );

        Box::pin(tokio_stream::iter(vec![
            Ok(RegisterResponse {
                event: Some(started),
            }),
            Ok(RegisterResponse {
                event: Some(failed),
            }),
        ]))
    }
}

type RegisterStream = Pin<Box<dyn Stream<Item = Result<RegisterResponse, Status>> + Send>>;
type WatchServicesStream =
    Pin<Box<dyn Stream<Item = Result<WatchServicesResponse, Status>> + Send>>;
type WatchModulesStream = Pin<Box<dyn Stream<Item = Result<WatchModulesResponse, Status>> + Send>>;

#[tonic::async_trait]
impl PlatformRegistration for PlatformRegistrationService {
    type RegisterStream = RegisterStream;
    type WatchServicesStream = WatchServicesStream;
    type WatchModulesStream = WatchModulesStream;

    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Self::RegisterStream>, Status> {
        let request = request.into_inner();
        info!(
            "Received registration request for: {} (type={})",
            request.name,
            request.r#type().as_str_name()
        );

        let events = match request.r#type() {
            ServiceType::Service => self.service_handler.register(request),
            ServiceType::Module => self.module_handler.register(request),
            ServiceType::Unspecified => {
                return Ok(Response::new(Self::rejection_stream(&request)));
            }
        };

        let stream = ReceiverStream::new(events)
            .map(|event| Ok(RegisterResponse { event: Some(event) }));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn unregister(
        &self,
        request: Request<UnregisterRequest>,
    ) -> Result<Response<UnregisterResponse>, Status> {
        let request = request.into_inner();
        info!("Received unregistration request for: {}", request.name);

        let response = match request.r#type() {
            ServiceType::Module => self.module_handler.unregister(request).await,
            _ => self.service_handler.unregister(request).await,
        };
        Ok(Response::new(response))
    }

    async fn list_services(
        &self,
        _request: Request<ListServicesRequest>,
    ) -> Result<Response<ListServicesResponse>, Status> {
        debug!("Received request to list all services");
        Ok(Response::new(self.discovery_handler.list_services().await))
    }

    async fn list_modules(
        &self,
        _request: Request<ListModulesRequest>,
    ) -> Result<Response<ListModulesResponse>, Status> {
        debug!("Received request to list all modules");
        Ok(Response::new(self.discovery_handler.list_modules().await))
    }

    async fn get_service(
        &self,
        request: Request<GetServiceRequest>,
    ) -> Result<Response<GetServiceResponse>, Status> {
        let request = request.into_inner();
        let response = match request.lookup {
            Some(get_service_request::Lookup::ServiceName(name)) => {
                debug!("Looking up service by name: {}", name);
                self.discovery_handler.get_service_by_name(&name).await
            }
            Some(get_service_request::Lookup::ServiceId(id)) => {
                debug!("Looking up service by ID: {}", id);
                self.discovery_handler.get_service_by_id(&id).await
            }
            None => {
                return Err(Status::invalid_argument(
                    "Must provide service_name or service_id",
                ))
            }
        };
        response.map(Response::new).map_err(status_from_error)
    }

    async fn get_module(
        &self,
        request: Request<GetModuleRequest>,
    ) -> Result<Response<GetModuleResponse>, Status> {
        let request = request.into_inner();
        let response = match request.lookup {
            Some(get_module_request::Lookup::ModuleName(name)) => {
                debug!("Looking up module by name: {}", name);
                self.discovery_handler.get_module_by_name(&name).await
            }
            Some(get_module_request::Lookup::ServiceId(id)) => {
                debug!("Looking up module by ID: {}", id);
                self.discovery_handler.get_module_by_id(&id).await
            }
            None => {
                return Err(Status::invalid_argument(
                    "Must provide module_name or service_id",
                ))
            }
        };
        response.map(Response::new).map_err(status_from_error)
    }

    async fn resolve_service(
        &self,
        request: Request<ResolveServiceRequest>,
    ) -> Result<Response<ResolveServiceResponse>, Status> {
        let request = request.into_inner();
        info!(
            "Resolving service: {} (prefer_local={})",
            request.service_name, request.prefer_local
        );
        Ok(Response::new(
            self.discovery_handler.resolve_service(request).await,
        ))
    }

    async fn watch_services(
        &self,
        _request: Request<WatchServicesRequest>,
    ) -> Result<Response<Self::WatchServicesStream>, Status> {
        info!("Watching services for updates");
        let stream = ReceiverStream::new(self.discovery_handler.watch_services()).map(Ok);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn watch_modules(
        &self,
        _request: Request<WatchModulesRequest>,
    ) -> Result<Response<Self::WatchModulesStream>, Status> {
        info!("Watching modules for updates");
        let stream = ReceiverStream::new(self.discovery_handler.watch_modules()).map(Ok);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_module_schema(
        &self,
        request: Request<GetModuleSchemaRequest>,
    ) -> Result<Response<GetModuleSchemaResponse>, Status> {
        let request = request.into_inner();
        info!("Getting schema for: {}", request.module_name);
        self.schema_handler
            .get_module_schema(request)
            .await
            .map(Response::new)
            .map_err(status_from_error)
    }

    async fn get_module_schema_versions(
        &self,
        request: Request<GetModuleSchemaVersionsRequest>,
    ) -> Result<Response<GetModuleSchemaVersionsResponse>, Status> {
        let request = request.into_inner();
        info!("Listing schema versions for: {}", request.module_name);
        self.schema_handler
            .get_module_schema_versions(request)
            .await
            .map(Response::new)
            .map_err(status_from_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Connectivity;

    #[tokio::test]
    async fn test_unspecified_kind_is_rejected_without_side_effects() {
        let request = RegisterRequest {
            name: "mystery".to_string(),
            r#type: ServiceType::Unspecified as i32,
            connectivity: Some(Connectivity {
                advertised_host: "10.0.0.1".to_string(),
                advertised_port: 7000,
                internal_host: None,
                internal_port: None,
                tls_enabled: false,
            }),
            ..Default::default()
        };

        let mut stream = PlatformRegistrationService::rejection_stream(&request);

        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            events.push(item.unwrap().event.unwrap());
        }

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), PlatformEventType::Started);
        assert_eq!(events[1].event_type(), PlatformEventType::Failed);
        assert_eq!(
            events[1].error_detail.as_deref(),
            Some("Missing required fields")
        );
        assert_eq!(events[0].service_id.as_deref(), Some("mystery-10.0.0.1-7000"));
    }

    #[test]
    fn test_status_mapping() {
        let status = status_from_error(RegistryError::NotFound("Module not found: x".to_string()));
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status = status_from_error(RegistryError::Validation("bad".to_string()));
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = status_from_error(RegistryError::Database("down".to_string()));
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
