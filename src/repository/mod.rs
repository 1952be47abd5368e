//! Persistence: the relational metadata store and the Apicurio schema archive

pub mod apicurio;
pub mod modules;

pub use apicurio::{ApicurioClient, ArtifactMetadata, SchemaRegistrationResult};
pub use modules::{generate_schema_id, ConfigSchemaRow, ModuleRepository, ModuleRow};
