//! Platform Registry
//!
//! Registration and discovery broker for the data-processing platform.
//! Services and modules announce themselves through a single gRPC front door;
//! the broker registers them with Consul, gates on health, persists module
//! metadata and config schemas, archives schemas in Apicurio, and publishes
//! lifecycle events to Kafka for downstream indexing.

pub mod config;
pub mod consul;
pub mod discovery;
pub mod error;
pub mod events;
pub mod grpc;
pub mod proto;
pub mod registration;
pub mod repository;
pub mod schema;
pub mod startup;

pub use config::RegistryConfig;
pub use error::{RegistryError, Result};

/// Crate version reported during self-registration.
pub const REGISTRY_VERSION: &str = env!("CARGO_PKG_VERSION");
