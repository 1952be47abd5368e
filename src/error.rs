//! Error types for the platform registry

use thiserror::Error;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Error type for registry operations
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Service discovery error: {0}")]
    ServiceDiscovery(String),

    #[error("Health check error: {0}")]
    HealthCheck(String),

    #[error("Module callback error: {0}")]
    Callback(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Apicurio(#[from] ApicurioError),

    #[error("Event publishing error: {0}")]
    EventBus(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RegistryError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        RegistryError::Timeout(err.to_string())
    }
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        RegistryError::Database(err.to_string())
    }
}

/// Failure talking to the Apicurio schema registry.
///
/// Every archive failure mode (transport, auth, not-found, conflict,
/// serialization) is surfaced through this one type so callers can match on
/// registry failures separately from unrelated errors.
#[derive(Error, Debug)]
#[error("Apicurio registry error: {message}")]
pub struct ApicurioError {
    pub message: String,
    pub service_name: Option<String>,
    pub artifact_id: Option<String>,
    #[source]
    pub cause: Option<anyhow::Error>,
}

impl ApicurioError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            service_name: None,
            artifact_id: None,
            cause: None,
        }
    }

    pub fn with_context(
        message: impl Into<String>,
        service_name: Option<String>,
        artifact_id: Option<String>,
        cause: impl Into<anyhow::Error>,
    ) -> Self {
        Self {
            message: message.into(),
            service_name,
            artifact_id,
            cause: Some(cause.into()),
        }
    }
}
