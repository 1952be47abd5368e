//! Registration pipelines for services and modules
//!
//! Each `Register` call runs as its own task writing ordered progress events
//! to a bounded channel. Forward stages push compensating undo actions onto a
//! LIFO stack; any failure or caller cancellation unwinds the stack
//! best-effort before the stream closes.

pub mod module;
pub mod service;

pub use module::ModuleRegistrationHandler;
pub use service::ServiceRegistrationHandler;

use crate::consul::ConsulRegistrar;
use crate::proto::{PlatformEventType, RegisterRequest, RegistrationEvent};
use crate::repository::ModuleRepository;
use prost_types::Timestamp;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub(crate) fn now_timestamp() -> Timestamp {
    let now = chrono::Utc::now();
    Timestamp {
        seconds: now.timestamp(),
        nanos: now.timestamp_subsec_nanos() as i32,
    }
}

pub(crate) fn create_event(
    event_type: PlatformEventType,
    message: &str,
    service_id: Option<&str>,
) -> RegistrationEvent {
    RegistrationEvent {
        event_type: event_type as i32,
        message: message.to_string(),
        service_id: service_id.map(str::to_string),
        error_detail: None,
        timestamp: Some(now_timestamp()),
    }
}

pub(crate) fn create_failure_event(
    service_id: Option<&str>,
    message: &str,
    error_detail: &str,
) -> RegistrationEvent {
    RegistrationEvent {
        event_type: PlatformEventType::Failed as i32,
        message: message.to_string(),
        service_id: service_id.map(str::to_string),
        error_detail: Some(error_detail.to_string()),
        timestamp: Some(now_timestamp()),
    }
}

/// Send an event to the stream; `false` means the caller went away.
pub(crate) async fn emit(tx: &mpsc::Sender<RegistrationEvent>, event: RegistrationEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Request validation shared by both pipelines: name present, kind known,
/// advertised endpoint usable.
pub(crate) fn validate_request(request: &RegisterRequest) -> bool {
    if request.name.is_empty() {
        return false;
    }
    let Some(connectivity) = request.connectivity.as_ref() else {
        return false;
    };
    !connectivity.advertised_host.is_empty() && connectivity.advertised_port > 0
}

/// Minimal OpenAPI 3.1 document used when a module reports no config schema
pub(crate) fn synthesize_default_schema(module_name: &str) -> String {
    format!(
        r#"{{
  "openapi": "3.1.0",
  "info": {{ "title": "{name} Configuration", "version": "1.0.0" }},
  "components": {{
    "schemas": {{
      "Config": {{
        "type": "object",
        "additionalProperties": {{ "type": "string" }},
        "description": "Key-value configuration for {name}"
      }}
    }}
  }}
}}"#,
        name = module_name
    )
}

/// Undo action recorded as a forward stage succeeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Compensation {
    DeregisterConsul { service_id: String },
    DeleteModuleRow { service_id: String },
}

/// LIFO stack of compensating actions.
///
/// Unwinding is best-effort: each action's failure is logged and the unwind
/// continues, never re-surfacing into the event stream.
#[derive(Debug, Default)]
pub(crate) struct CompensationStack {
    actions: Vec<Compensation>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Compensation) {
        self.actions.push(action);
    }

    pub async fn unwind(
        mut self,
        registrar: &ConsulRegistrar,
        repository: Option<&ModuleRepository>,
    ) {
        while let Some(action) = self.actions.pop() {
            match action {
                Compensation::DeregisterConsul { service_id } => {
                    if registrar.deregister(&service_id).await {
                        info!("Rolled back Consul registration for {}", service_id);
                    } else {
                        error!("Failed to rollback Consul registration for {}", service_id);
                    }
                }
                Compensation::DeleteModuleRow { service_id } => {
                    let Some(repository) = repository else {
                        warn!("No repository available to roll back module row {}", service_id);
                        continue;
                    };
                    match repository.delete_module(&service_id).await {
                        Ok(_) => info!("Rolled back module row for {}", service_id),
                        Err(e) => error!("Failed to rollback module row for {}: {}", service_id, e),
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub fn actions(&self) -> &[Compensation] {
        &self.actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Connectivity;

    fn valid_request() -> RegisterRequest {
        RegisterRequest {
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
        }
    }

    #[test]
    fn test_validation_accepts_complete_request() {
        assert!(validate_request(&valid_request()));
    }

    #[test]
    fn test_validation_rejects_missing_fields() {
        let mut no_name = valid_request();
        no_name.name = String::new();
        assert!(!validate_request(&no_name));

        let mut no_connectivity = valid_request();
        no_connectivity.connectivity = None;
        assert!(!validate_request(&no_connectivity));

        let mut no_host = valid_request();
        no_host.connectivity.as_mut().unwrap().advertised_host = String::new();
        assert!(!validate_request(&no_host));

        let mut bad_port = valid_request();
        bad_port.connectivity.as_mut().unwrap().advertised_port = 0;
        assert!(!validate_request(&bad_port));
    }

    #[test]
    fn test_synthesized_schema_shape() {
        let schema = synthesize_default_schema("pdf-extract");
        assert!(schema.contains("\"openapi\""));
        assert!(schema.contains("3.1.0"));
        assert!(schema.contains("pdf-extract Configuration"));

        let parsed: serde_json::Value = serde_json::from_str(&schema).unwrap();
        assert_eq!(
            parsed["components"]["schemas"]["Config"]["type"],
            "object"
        );
    }

    #[test]
    fn test_compensation_stack_is_lifo() {
        let mut stack = CompensationStack::new();
        stack.push(Compensation::DeregisterConsul {
            service_id: "a".to_string(),
        });
        stack.push(Compensation::DeleteModuleRow {
            service_id: "a".to_string(),
        });

        assert_eq!(
            stack.actions().last(),
            Some(&Compensation::DeleteModuleRow {
                service_id: "a".to_string()
            })
        );
    }

    #[test]
    fn test_failure_event_carries_detail() {
        let event = create_failure_event(Some("svc-1"), "Registration failed", "boom");
        assert_eq!(event.event_type, PlatformEventType::Failed as i32);
        assert_eq!(event.error_detail.as_deref(), Some("boom"));
        assert_eq!(event.service_id.as_deref(), Some("svc-1"));
    }
}
