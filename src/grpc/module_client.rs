//! Callback client that asks a module for its registration metadata

use crate::consul::ConsulClient;
use crate::error::RegistryError;
use crate::grpc::channels::ChannelManager;
use crate::proto::module_registration_client::ModuleRegistrationClient;
use crate::proto::{GetServiceRegistrationRequest, ServiceRegistrationMetadata};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Capability interface for the one RPC the broker consumes from modules.
///
/// Wired concretely at construction time; the schema cascade and the module
/// pipeline both depend on this seam rather than on the transport.
#[async_trait]
pub trait ModuleRegistrationProbe: Send + Sync {
    /// Resolve `module_name` and invoke its `GetServiceRegistration` RPC
    async fn get_service_registration(
        &self,
        module_name: &str,
    ) -> Result<ServiceRegistrationMetadata, RegistryError>;
}

/// Discovery-backed implementation of [`ModuleRegistrationProbe`]
pub struct GrpcModuleClient {
    consul: Arc<ConsulClient>,
    channels: Arc<ChannelManager>,
}

impl GrpcModuleClient {
    pub fn new(consul: Arc<ConsulClient>, channels: Arc<ChannelManager>) -> Self {
        Self { consul, channels }
    }
}

#[async_trait]
impl ModuleRegistrationProbe for GrpcModuleClient {
    async fn get_service_registration(
        &self,
        module_name: &str,
    ) -> Result<ServiceRegistrationMetadata, RegistryError> {
        let entries = self
            .consul
            .health_service_nodes(module_name, true)
            .await
            .map_err(|e| {
                RegistryError::Callback(format!(
                    "Failed to discover instances of {}: {}",
                    module_name, e
                ))
            })?;

        let endpoints: Vec<(String, u16)> = entries
            .iter()
            .map(|entry| (entry.service.address.clone(), entry.service.port))
            .collect();

        debug!(
            "Resolved {} instance(s) of module {}",
            endpoints.len(),
            module_name
        );

        let channel = self.channels.get_or_create(module_name, &endpoints).await?;
        let mut client = ModuleRegistrationClient::new(channel);

        let metadata = client
            .get_service_registration(GetServiceRegistrationRequest {})
            .await
            .map_err(|status| {
                RegistryError::Callback(format!(
                    "GetServiceRegistration failed for {}: {}",
                    module_name, status
                ))
            })?
            .into_inner();

        info!(
            "Fetched registration metadata from module {} (version {})",
            module_name, metadata.version
        );
        Ok(metadata)
    }
}
