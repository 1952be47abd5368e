//! Platform registry main binary

use platform_registry::config::RegistryConfig;
use platform_registry::consul::{ConsulClient, ConsulHealthChecker, ConsulRegistrar};
use platform_registry::discovery::ServiceDiscoveryHandler;
use platform_registry::events::PlatformEventsProducer;
use platform_registry::grpc::{ChannelManager, GrpcModuleClient, PlatformRegistrationService};
use platform_registry::proto::platform_registration_server::PlatformRegistrationServer;
use platform_registry::registration::{ModuleRegistrationHandler, ServiceRegistrationHandler};
use platform_registry::repository::{ApicurioClient, ModuleRepository};
use platform_registry::schema::SchemaRetrievalHandler;
use platform_registry::startup::SelfRegistration;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting platform registry v{}",
        platform_registry::REGISTRY_VERSION
    );

    let config = load_config();
    info!("Configuration loaded successfully");

    // External substrates
    let consul = Arc::new(ConsulClient::new(&config.consul)?);
    if !consul.is_healthy().await {
        warn!("Consul agent not reachable at startup; registrations will fail until it is");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    let repository = Arc::new(ModuleRepository::new(pool));
    repository.bootstrap().await?;
    info!("Metadata store ready");

    let apicurio = Arc::new(ApicurioClient::new(&config.apicurio)?);
    if !apicurio.is_healthy().await {
        warn!("Apicurio registry not reachable at startup; schema sync will be skipped");
    }

    let events = Arc::new(PlatformEventsProducer::new(&config.kafka)?);

    // Internal components
    let registrar = Arc::new(ConsulRegistrar::new(consul.clone()));
    let health_checker = Arc::new(ConsulHealthChecker::new(consul.clone(), &config.health_gate));
    let channels = Arc::new(ChannelManager::new(&config.channels));
    let module_client = Arc::new(GrpcModuleClient::new(consul.clone(), channels.clone()));

    let service_handler = Arc::new(ServiceRegistrationHandler::new(
        registrar.clone(),
        health_checker.clone(),
        apicurio.clone(),
        events.clone(),
    ));
    let module_handler = Arc::new(ModuleRegistrationHandler::new(
        registrar,
        health_checker,
        repository.clone(),
        apicurio.clone(),
        module_client.clone(),
        events,
    ));
    let discovery_handler = Arc::new(ServiceDiscoveryHandler::new(consul.clone()));
    let schema_handler = Arc::new(SchemaRetrievalHandler::new(
        repository,
        apicurio,
        module_client,
    ));

    let self_registration = Arc::new(SelfRegistration::new(
        config.registration.clone(),
        service_handler.clone(),
        consul,
    ));
    self_registration.register_on_startup().await;

    let service = PlatformRegistrationService::new(
        service_handler,
        module_handler,
        discovery_handler,
        schema_handler,
    );

    let addr: std::net::SocketAddr = config.grpc_endpoint.parse()?;
    info!("Starting gRPC server on {}", addr);

    // Large config schemas stall badly behind the stock 64 KiB HTTP/2 window
    let window = config.channels.flow_control_window;
    let server = tonic::transport::Server::builder()
        .initial_stream_window_size(Some(window))
        .initial_connection_window_size(Some(window))
        .add_service(PlatformRegistrationServer::new(service))
        .serve_with_shutdown(addr, shutdown_signal());

    if let Err(e) = server.await {
        warn!("gRPC server error: {}", e);
    }

    info!("Shutting down platform registry");
    self_registration.deregister_on_shutdown().await;
    channels.shutdown().await;

    info!("Platform registry shutdown completed");
    Ok(())
}

/// Load configuration from environment or file
fn load_config() -> RegistryConfig {
    // Try to load from environment variables first
    if std::env::var("CONSUL_HOST").is_ok() || std::env::var("REGISTRY_GRPC_ENDPOINT").is_ok() {
        return RegistryConfig::from_env();
    }

    // Try to load from config file
    let config_path = std::env::var("REGISTRY_CONFIG_PATH")
        .unwrap_or_else(|_| "config/registry.toml".to_string());

    if let Ok(contents) = std::fs::read_to_string(&config_path) {
        match toml::from_str::<RegistryConfig>(&contents) {
            Ok(config) => return config,
            Err(e) => warn!("Failed to parse config file {}: {}", config_path, e),
        }
    }

    // Use default configuration, with any env overrides applied on top
    info!("Using default configuration");
    RegistryConfig::from_env()
}

/// Handle shutdown signals
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
