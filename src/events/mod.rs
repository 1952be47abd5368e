//! Lifecycle event publishing to Kafka

pub mod producer;

pub use producer::{event_key, PlatformEventsProducer};
