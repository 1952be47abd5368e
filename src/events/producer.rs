//! Kafka producer for registration lifecycle events
//!
//! Four topics, one per `{Service,Module} x {Registered,Unregistered}`.
//! Values are length-delimited proto messages; keys are UUIDs derived from
//! the service id so all events for one instance land on one partition.
//! Publishing is fire-and-forget: failures are logged, never surfaced.

use crate::config::KafkaConfig;
use crate::error::RegistryError;
use crate::proto::{ModuleRegistered, ModuleUnregistered, ServiceRegistered, ServiceUnregistered};
use md5::{Digest, Md5};
use prost::Message;
use prost_types::Timestamp;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Derive the stable partition key for a service id.
///
/// A well-formed UUID is used verbatim; anything else becomes a version-3
/// name UUID over the id's raw UTF-8 bytes, so retries and unregisters key
/// identically and existing consumers keyed by other producers of these
/// topics see the same partitioning.
pub fn event_key(service_id: &str) -> Uuid {
    if service_id.is_empty() {
        return Uuid::new_v4();
    }
    match Uuid::parse_str(service_id) {
        Ok(uuid) => uuid,
        Err(_) => name_uuid_from_bytes(service_id.as_bytes()),
    }
}

/// Version-3 UUID of an MD5 digest over the raw bytes, with no namespace
/// prefix. This is the `java.util.UUID.nameUUIDFromBytes` construction, kept
/// bit-for-bit so keys agree across language ecosystems.
fn name_uuid_from_bytes(bytes: &[u8]) -> Uuid {
    let mut digest: [u8; 16] = Md5::digest(bytes).into();
    digest[6] = (digest[6] & 0x0f) | 0x30;
    digest[8] = (digest[8] & 0x3f) | 0x80;
    Uuid::from_bytes(digest)
}

fn now_timestamp() -> Timestamp {
    let now = chrono::Utc::now();
    Timestamp {
        seconds: now.timestamp(),
        nanos: now.timestamp_subsec_nanos() as i32,
    }
}

/// Publishes lifecycle events for downstream indexing
pub struct PlatformEventsProducer {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl PlatformEventsProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, RegistryError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| {
                RegistryError::EventBus(format!("Failed to create Kafka producer: {}", e))
            })?;

        Ok(Self {
            producer,
            config: config.clone(),
        })
    }

    pub fn emit_service_registered(
        &self,
        service_id: &str,
        service_name: &str,
        host: &str,
        port: i32,
        version: &str,
    ) {
        let event = ServiceRegistered {
            service_id: service_id.to_string(),
            service_name: service_name.to_string(),
            host: host.to_string(),
            port,
            version: version.to_string(),
            timestamp: Some(now_timestamp()),
        };
        self.send(
            self.config.service_registered_topic.clone(),
            service_id,
            event.encode_length_delimited_to_vec(),
        );
    }

    pub fn emit_service_unregistered(&self, service_id: &str, service_name: &str) {
        let event = ServiceUnregistered {
            service_id: service_id.to_string(),
            service_name: service_name.to_string(),
            timestamp: Some(now_timestamp()),
        };
        self.send(
            self.config.service_unregistered_topic.clone(),
            service_id,
            event.encode_length_delimited_to_vec(),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit_module_registered(
        &self,
        service_id: &str,
        module_name: &str,
        host: &str,
        port: i32,
        version: &str,
        schema_id: Option<String>,
        apicurio_artifact_id: Option<String>,
    ) {
        let event = ModuleRegistered {
            service_id: service_id.to_string(),
            module_name: module_name.to_string(),
            host: host.to_string(),
            port,
            version: version.to_string(),
            schema_id,
            apicurio_artifact_id,
            timestamp: Some(now_timestamp()),
        };
        self.send(
            self.config.module_registered_topic.clone(),
            service_id,
            event.encode_length_delimited_to_vec(),
        );
    }

    pub fn emit_module_unregistered(&self, service_id: &str, module_name: &str) {
        let event = ModuleUnregistered {
            service_id: service_id.to_string(),
            module_name: module_name.to_string(),
            timestamp: Some(now_timestamp()),
        };
        self.send(
            self.config.module_unregistered_topic.clone(),
            service_id,
            event.encode_length_delimited_to_vec(),
        );
    }

    /// Fire-and-forget send; delivery failures are logged only
    fn send(&self, topic: String, service_id: &str, payload: Vec<u8>) {
        let key = event_key(service_id).to_string();
        let producer = self.producer.clone();
        let service_id = service_id.to_string();

        tokio::spawn(async move {
            let record = FutureRecord::to(&topic).key(&key).payload(&payload);
            match producer.send(record, Duration::from_secs(5)).await {
                Ok(_) => debug!("Emitted event to {} for {}", topic, service_id),
                Err((e, _)) => warn!("Failed to emit event to {} for {}: {}", topic, service_id, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_key_is_stable_for_same_id() {
        let a = event_key("auth-svc-10.0.0.1-7000");
        let b = event_key("auth-svc-10.0.0.1-7000");
        assert_eq!(a, b);
    }

    #[test]
    fn test_event_key_differs_for_different_ids() {
        let a = event_key("auth-svc-10.0.0.1-7000");
        let b = event_key("auth-svc-10.0.0.2-7000");
        assert_ne!(a, b);
    }

    #[test]
    fn test_event_key_preserves_wellformed_uuid() {
        let raw = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";
        assert_eq!(event_key(raw).to_string(), raw);
    }

    #[test]
    fn test_event_key_matches_jvm_name_uuid() {
        // java.util.UUID.nameUUIDFromBytes("test".getBytes())
        assert_eq!(
            event_key("test").to_string(),
            "098f6bcd-4621-3373-8ade-4e832627b4f6"
        );
        assert_eq!(event_key("test").get_version_num(), 3);
    }

    #[test]
    fn test_registered_event_roundtrip() {
        let event = ServiceRegistered {
            service_id: "auth-svc-10.0.0.1-7000".to_string(),
            service_name: "auth-svc".to_string(),
            host: "10.0.0.1".to_string(),
            port: 7000,
            version: "1.0.0".to_string(),
            timestamp: Some(now_timestamp()),
        };

        let bytes = event.encode_length_delimited_to_vec();
        let decoded = ServiceRegistered::decode_length_delimited(bytes.as_slice()).unwrap();
        assert_eq!(decoded.service_id, event.service_id);
        assert_eq!(decoded.port, 7000);
    }
}
