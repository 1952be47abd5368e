//! Consul integration: registration, deregistration, health gating, and reads

pub mod client;
pub mod health;
pub mod registrar;

pub use client::{AgentService, ConsulClient, HealthCheck, ServiceEntry};
pub use health::ConsulHealthChecker;
pub use registrar::{generate_service_id, ConsulRegistrar};
