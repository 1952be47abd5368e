//! Multi-tier retrieval of module config schemas
//!
//! Sources are consulted in order: the metadata store (system of record),
//! the Apicurio archive, a live callback to the module, and finally a
//! synthesized default. Only when every tier fails does the caller see
//! `NotFound`.

use crate::error::RegistryError;
use crate::grpc::ModuleRegistrationProbe;
use crate::proto::{
    GetModuleSchemaRequest, GetModuleSchemaResponse, GetModuleSchemaVersionsRequest,
    GetModuleSchemaVersionsResponse, ServiceRegistrationMetadata,
};
use crate::registration::synthesize_default_schema;
use crate::repository::{
    generate_schema_id, ApicurioClient, ArtifactMetadata, ConfigSchemaRow, ModuleRepository,
};
use prost_types::Timestamp;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn now_timestamp() -> Timestamp {
    let now = chrono::Utc::now();
    Timestamp {
        seconds: now.timestamp(),
        nanos: now.timestamp_subsec_nanos() as i32,
    }
}

/// Serves module config schemas through the retrieval cascade
pub struct SchemaRetrievalHandler {
    repository: Arc<ModuleRepository>,
    apicurio: Arc<ApicurioClient>,
    probe: Arc<dyn ModuleRegistrationProbe>,
}

impl SchemaRetrievalHandler {
    pub fn new(
        repository: Arc<ModuleRepository>,
        apicurio: Arc<ApicurioClient>,
        probe: Arc<dyn ModuleRegistrationProbe>,
    ) -> Self {
        Self {
            repository,
            apicurio,
            probe,
        }
    }

    /// Get a module's config schema, falling through the cascade until one
    /// tier produces a document.
    pub async fn get_module_schema(
        &self,
        request: GetModuleSchemaRequest,
    ) -> Result<GetModuleSchemaResponse, RegistryError> {
        let module_name = request.module_name.clone();
        let version = request.version.as_deref().filter(|v| !v.is_empty());

        info!(
            "Retrieving schema for module: {}, version: {}",
            module_name,
            version.unwrap_or("latest")
        );

        // Tier 1: the metadata store is the system of record
        let stored = match version {
            Some(version) => {
                let schema_id = generate_schema_id(&module_name, version);
                self.repository.find_schema_by_id(&schema_id).await?
            }
            None => self.repository.find_latest_schema_by_name(&module_name).await?,
        };
        if let Some(row) = stored {
            return Ok(response_from_row(&row));
        }

        debug!(
            "Schema not found in database for {}:{:?}, trying Apicurio",
            module_name, version
        );

        // Tier 2: the archive
        let archive_version = version.unwrap_or("latest");
        match self
            .apicurio
            .get_schema_by_name(&module_name, archive_version)
            .await
        {
            Ok(content) => {
                // Metadata failure is non-fatal: the content alone suffices
                let metadata = match self.apicurio.get_artifact_metadata(&module_name).await {
                    Ok(metadata) => Some(metadata),
                    Err(e) => {
                        debug!("Failed to get artifact metadata for {}: {}", module_name, e);
                        None
                    }
                };
                return Ok(response_from_archive(
                    &module_name,
                    &content,
                    archive_version,
                    metadata,
                ));
            }
            Err(e) => {
                warn!(
                    "Failed to get schema from Apicurio for {}:{}, falling back to module: {}",
                    module_name, archive_version, e
                );
            }
        }

        // Tier 3: ask the module directly; tier 4 is the synthesized default
        // inside the response builder. Callback failures surface as NotFound
        // with the store-specific cause kept in the logs only.
        match self.probe.get_service_registration(&module_name).await {
            Ok(metadata) => Ok(response_from_callback(&module_name, &metadata)),
            Err(e) => {
                warn!("Module fallback failed for {}: {}", module_name, e);
                Err(RegistryError::NotFound(format!(
                    "Module schema not found: {}. Module may not be running or registered.",
                    module_name
                )))
            }
        }
    }

    /// List the known schema versions for a module, newest first
    pub async fn get_module_schema_versions(
        &self,
        request: GetModuleSchemaVersionsRequest,
    ) -> Result<GetModuleSchemaVersionsResponse, RegistryError> {
        let versions = self
            .repository
            .list_schema_versions(&request.module_name)
            .await?;
        Ok(GetModuleSchemaVersionsResponse { versions })
    }
}

fn response_from_row(row: &ConfigSchemaRow) -> GetModuleSchemaResponse {
    let mut metadata = HashMap::new();
    if let Some(ref created_by) = row.created_by {
        metadata.insert("created_by".to_string(), created_by.clone());
    }
    metadata.insert("sync_status".to_string(), row.sync_status.clone());

    GetModuleSchemaResponse {
        module_name: row.service_name.clone(),
        schema_json: row.json_schema.to_string(),
        schema_version: row.schema_version.clone(),
        artifact_id: row.archive_artifact_id.clone(),
        metadata,
        updated_at: Some(Timestamp {
            seconds: row.created_at.timestamp(),
            nanos: row.created_at.timestamp_subsec_nanos() as i32,
        }),
    }
}

fn response_from_archive(
    module_name: &str,
    content: &str,
    version: &str,
    artifact_metadata: Option<ArtifactMetadata>,
) -> GetModuleSchemaResponse {
    let mut metadata = HashMap::new();
    let mut artifact_id = None;

    if let Some(artifact) = artifact_metadata {
        artifact_id = artifact.artifact_id;
        if let Some(owner) = artifact.owner {
            metadata.insert("owner".to_string(), owner);
        }
        if let Some(name) = artifact.name {
            metadata.insert("name".to_string(), name);
        }
        if let Some(description) = artifact.description {
            metadata.insert("description".to_string(), description);
        }
    }

    GetModuleSchemaResponse {
        module_name: module_name.to_string(),
        schema_json: content.to_string(),
        schema_version: version.to_string(),
        artifact_id,
        metadata,
        updated_at: Some(now_timestamp()),
    }
}

fn response_from_callback(
    module_name: &str,
    callback: &ServiceRegistrationMetadata,
) -> GetModuleSchemaResponse {
    let schema_json = match callback.json_config_schema.as_deref() {
        Some(schema) if !schema.trim().is_empty() => schema.to_string(),
        _ => synthesize_default_schema(module_name),
    };
    let schema_version = if callback.version.is_empty() {
        "unknown".to_string()
    } else {
        callback.version.clone()
    };

    let mut metadata = HashMap::new();
    metadata.insert("source".to_string(), "module-direct".to_string());
    if let Some(ref display_name) = callback.display_name {
        metadata.insert("display_name".to_string(), display_name.clone());
    }
    if let Some(ref description) = callback.description {
        metadata.insert("description".to_string(), description.clone());
    }
    if let Some(ref owner) = callback.owner {
        metadata.insert("owner".to_string(), owner.clone());
    }

    GetModuleSchemaResponse {
        module_name: module_name.to_string(),
        schema_json,
        schema_version,
        artifact_id: None,
        metadata,
        updated_at: Some(now_timestamp()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_response_from_row_carries_sync_metadata() {
        let row = ConfigSchemaRow {
            schema_id: "pdf-extract-2_1_0".to_string(),
            service_name: "pdf-extract".to_string(),
            schema_version: "2.1.0".to_string(),
            json_schema: serde_json::json!({"x": 1}),
            created_at: Utc::now(),
            created_by: Some("registrar".to_string()),
            archive_artifact_id: Some("pdf-extract-config-v2_1_0".to_string()),
            archive_global_id: Some(42),
            sync_status: "SYNCED".to_string(),
            last_sync_attempt: None,
            sync_error: None,
        };

        let response = response_from_row(&row);
        assert_eq!(response.module_name, "pdf-extract");
        assert_eq!(response.schema_version, "2.1.0");
        assert_eq!(response.metadata["sync_status"], "SYNCED");
        assert_eq!(response.metadata["created_by"], "registrar");
        assert_eq!(
            response.artifact_id.as_deref(),
            Some("pdf-extract-config-v2_1_0")
        );

        let parsed: serde_json::Value = serde_json::from_str(&response.schema_json).unwrap();
        assert_eq!(parsed["x"], 1);
    }

    #[test]
    fn test_response_from_archive_without_metadata() {
        let response = response_from_archive("ocr", "{\"a\":true}", "latest", None);
        assert_eq!(response.module_name, "ocr");
        assert_eq!(response.schema_version, "latest");
        assert!(response.artifact_id.is_none());
        assert!(response.metadata.is_empty());
    }

    #[test]
    fn test_response_from_callback_synthesizes_when_blank() {
        let callback = ServiceRegistrationMetadata {
            module_name: "ghost".to_string(),
            version: String::new(),
            json_config_schema: None,
            ..Default::default()
        };

        let response = response_from_callback("ghost", &callback);
        assert_eq!(response.schema_version, "unknown");
        assert_eq!(response.metadata["source"], "module-direct");
        assert!(response.schema_json.contains("ghost Configuration"));

        let parsed: serde_json::Value = serde_json::from_str(&response.schema_json).unwrap();
        assert_eq!(parsed["openapi"], "3.1.0");
    }
}
