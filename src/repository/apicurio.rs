//! Client for the Apicurio schema registry REST API (v3)

use crate::config::ApicurioConfig;
use crate::error::ApicurioError;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Result of creating or updating an artifact version
#[derive(Debug, Clone)]
pub struct SchemaRegistrationResult {
    pub artifact_id: String,
    pub global_id: i64,
    pub version: String,
}

/// Metadata of an archived artifact
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactMetadata {
    #[serde(rename = "artifactId", default)]
    pub artifact_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(rename = "modifiedOn", default)]
    pub modified_on: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateArtifactResponse {
    #[serde(default)]
    version: Option<VersionMetadata>,
}

#[derive(Debug, Deserialize)]
struct VersionMetadata {
    #[serde(rename = "globalId", default)]
    global_id: Option<i64>,
    #[serde(default)]
    version: Option<String>,
}

/// Derive the versioned artifact id for a schema.
///
/// `"{base}-config-v{version}"` with dots rewritten to underscores; a
/// null/blank version collapses to `v1`.
pub fn versioned_artifact_id(base: &str, version: Option<&str>) -> String {
    let safe_version = match version {
        Some(v) if !v.trim().is_empty() => format!("v{}", v.replace('.', "_")),
        _ => "v1".to_string(),
    };
    format!("{}-config-{}", base, safe_version)
}

/// Client for archiving and retrieving versioned config schemas
#[derive(Debug, Clone)]
pub struct ApicurioClient {
    http_client: HttpClient,
    base_url: String,
    group_id: String,
}

impl ApicurioClient {
    pub fn new(config: &ApicurioConfig) -> Result<Self, ApicurioError> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| {
                ApicurioError::with_context(
                    "Failed to build Apicurio HTTP client",
                    None,
                    None,
                    e,
                )
            })?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            group_id: config.group_id.clone(),
        })
    }

    fn artifacts_url(&self) -> String {
        format!(
            "{}/apis/registry/v3/groups/{}/artifacts",
            self.base_url, self.group_id
        )
    }

    fn artifact_url(&self, artifact_id: &str) -> String {
        format!("{}/{}", self.artifacts_url(), artifact_id)
    }

    /// Archive a schema under the derived artifact id for `service_name`
    pub async fn create_or_update(
        &self,
        service_name: &str,
        version: &str,
        json_schema: &str,
    ) -> Result<SchemaRegistrationResult, ApicurioError> {
        self.create_or_update_with_artifact_base(service_name, version, json_schema)
            .await
    }

    /// Archive a schema under an explicit artifact base (the HTTP-schema path
    /// uses `"{name}-http"` here)
    pub async fn create_or_update_with_artifact_base(
        &self,
        artifact_base: &str,
        version: &str,
        json_schema: &str,
    ) -> Result<SchemaRegistrationResult, ApicurioError> {
        let artifact_id = versioned_artifact_id(artifact_base, Some(version));
        self.create_or_update_with_artifact_id(&artifact_id, version, json_schema)
            .await
    }

    /// Archive a schema under a caller-owned artifact id
    pub async fn create_or_update_with_artifact_id(
        &self,
        artifact_id: &str,
        version: &str,
        json_schema: &str,
    ) -> Result<SchemaRegistrationResult, ApicurioError> {
        let body = json!({
            "artifactId": artifact_id,
            "artifactType": "JSON",
            "firstVersion": {
                "version": version,
                "content": {
                    "content": json_schema,
                    "contentType": "application/json",
                },
            },
        });

        let response = self
            .http_client
            .post(self.artifacts_url())
            .query(&[("ifExists", "CREATE_VERSION")])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ApicurioError::with_context(
                    format!("Failed to reach Apicurio while archiving {}", artifact_id),
                    None,
                    Some(artifact_id.to_string()),
                    e,
                )
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(ApicurioError {
                message: format!(
                    "Apicurio rejected artifact {}: HTTP {} - {}",
                    artifact_id, status, detail
                ),
                service_name: None,
                artifact_id: Some(artifact_id.to_string()),
                cause: None,
            });
        }

        let parsed: CreateArtifactResponse = response.json().await.map_err(|e| {
            ApicurioError::with_context(
                format!("Failed to parse Apicurio response for {}", artifact_id),
                None,
                Some(artifact_id.to_string()),
                e,
            )
        })?;

        let version_meta = parsed.version.unwrap_or(VersionMetadata {
            global_id: None,
            version: None,
        });

        info!("Archived schema artifact {} (version {})", artifact_id, version);

        Ok(SchemaRegistrationResult {
            artifact_id: artifact_id.to_string(),
            global_id: version_meta.global_id.unwrap_or_default(),
            version: version_meta.version.unwrap_or_else(|| version.to_string()),
        })
    }

    /// Retrieve schema content through the artifact-id derivation
    pub async fn get_schema_by_name(
        &self,
        service_name: &str,
        version: &str,
    ) -> Result<String, ApicurioError> {
        let artifact_id = versioned_artifact_id(service_name, Some(version));
        self.get_schema_by_artifact_id(&artifact_id, version)
            .await
            .map_err(|e| ApicurioError {
                service_name: Some(service_name.to_string()),
                ..e
            })
    }

    /// Retrieve schema content for an explicit artifact id.
    ///
    /// `"latest"` resolves through the registry's latest branch.
    pub async fn get_schema_by_artifact_id(
        &self,
        artifact_id: &str,
        version: &str,
    ) -> Result<String, ApicurioError> {
        let version_expr = if version == "latest" {
            "branch=latest".to_string()
        } else {
            version.to_string()
        };
        let url = format!(
            "{}/versions/{}/content",
            self.artifact_url(artifact_id),
            version_expr
        );

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            ApicurioError::with_context(
                format!("Failed to reach Apicurio while fetching {}", artifact_id),
                None,
                Some(artifact_id.to_string()),
                e,
            )
        })?;

        if !response.status().is_success() {
            return Err(ApicurioError {
                message: format!(
                    "Schema content not available for {}: HTTP {}",
                    artifact_id,
                    response.status()
                ),
                service_name: None,
                artifact_id: Some(artifact_id.to_string()),
                cause: None,
            });
        }

        response.text().await.map_err(|e| {
            ApicurioError::with_context(
                format!("Failed to read schema content for {}", artifact_id),
                None,
                Some(artifact_id.to_string()),
                e,
            )
        })
    }

    /// Fetch artifact metadata for a service's derived artifact.
    ///
    /// Callers treat a failure here as non-fatal and fall back to content-only
    /// responses.
    pub async fn get_artifact_metadata(
        &self,
        service_name: &str,
    ) -> Result<ArtifactMetadata, ApicurioError> {
        let artifact_id = versioned_artifact_id(service_name, None);
        let url = self.artifact_url(&artifact_id);

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            ApicurioError::with_context(
                format!("Failed to reach Apicurio for metadata of {}", artifact_id),
                Some(service_name.to_string()),
                Some(artifact_id.clone()),
                e,
            )
        })?;

        if !response.status().is_success() {
            return Err(ApicurioError {
                message: format!(
                    "Artifact metadata not available for {}: HTTP {}",
                    artifact_id,
                    response.status()
                ),
                service_name: Some(service_name.to_string()),
                artifact_id: Some(artifact_id),
                cause: None,
            });
        }

        response.json().await.map_err(|e| {
            ApicurioError::with_context(
                format!("Failed to parse artifact metadata for {}", artifact_id),
                Some(service_name.to_string()),
                Some(artifact_id.clone()),
                e,
            )
        })
    }

    /// Verify the registry is reachable
    pub async fn is_healthy(&self) -> bool {
        let url = format!("{}/apis/registry/v3/system/info", self.base_url);
        match self.http_client.get(&url).send().await {
            Ok(response) => {
                debug!("Apicurio health probe: HTTP {}", response.status());
                response.status().is_success()
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_artifact_id_format() {
        assert_eq!(
            versioned_artifact_id("test-service", Some("1.2.3")),
            "test-service-config-v1_2_3"
        );
    }

    #[test]
    fn test_versioned_artifact_id_defaults_blank_version() {
        assert_eq!(
            versioned_artifact_id("test-service", None),
            "test-service-config-v1"
        );
        assert_eq!(
            versioned_artifact_id("test-service", Some("")),
            "test-service-config-v1"
        );
    }

    #[test]
    fn test_versioned_artifact_id_converts_dots() {
        assert_eq!(
            versioned_artifact_id("test-service", Some("1.0.0-beta.1")),
            "test-service-config-v1_0_0-beta_1"
        );
    }

    #[test]
    fn test_http_schema_artifact_base() {
        // The HTTP-schema path archives under "{name}-http" as the base
        assert_eq!(
            versioned_artifact_id("auth-svc-http", Some("1.0.0")),
            "auth-svc-http-config-v1_0_0"
        );
    }
}
