//! Relational store for module rows and versioned config schemas
//!
//! The `modules` table is the system of record for registered processing
//! modules; `config_schemas` holds one row per `(service_name,
//! schema_version)` with the archive sync state.

use crate::consul::generate_service_id;
use crate::error::RegistryError;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::debug;

/// A registered module instance
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ModuleRow {
    pub service_id: String,
    pub service_name: String,
    pub host: String,
    pub port: i32,
    pub version: Option<String>,
    pub config_schema_id: Option<String>,
    pub metadata: JsonValue,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub status: String,
}

impl ModuleRow {
    /// A module is considered healthy when it heartbeated within the last 30s
    pub fn is_healthy(&self) -> bool {
        match self.last_heartbeat {
            Some(heartbeat) => heartbeat > Utc::now() - Duration::seconds(30),
            None => false,
        }
    }
}

/// A versioned config schema and its archive sync state
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConfigSchemaRow {
    pub schema_id: String,
    pub service_name: String,
    pub schema_version: String,
    pub json_schema: JsonValue,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub archive_artifact_id: Option<String>,
    pub archive_global_id: Option<i64>,
    pub sync_status: String,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
}

/// Derive the deterministic schema id from service name and version.
///
/// Dots in the version are rewritten to underscores so the id stays valid
/// across every store it flows into.
pub fn generate_schema_id(service_name: &str, schema_version: &str) -> String {
    format!("{}-{}", service_name, schema_version.replace('.', "_"))
}

/// Repository over the `modules` and `config_schemas` tables
#[derive(Debug, Clone)]
pub struct ModuleRepository {
    pool: PgPool,
}

impl ModuleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tables and indexes if they do not exist yet
    pub async fn bootstrap(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS modules (
                service_id VARCHAR(512) PRIMARY KEY,
                service_name VARCHAR(255) NOT NULL,
                host VARCHAR(255) NOT NULL,
                port INTEGER NOT NULL,
                version VARCHAR(100),
                config_schema_id VARCHAR(512),
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                registered_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                last_heartbeat TIMESTAMPTZ,
                status VARCHAR(50) NOT NULL DEFAULT 'ACTIVE'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config_schemas (
                schema_id VARCHAR(512) PRIMARY KEY,
                service_name VARCHAR(255) NOT NULL,
                schema_version VARCHAR(100) NOT NULL,
                json_schema JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                created_by VARCHAR(255),
                archive_artifact_id VARCHAR(512),
                archive_global_id BIGINT,
                sync_status VARCHAR(50) NOT NULL DEFAULT 'PENDING',
                last_sync_attempt TIMESTAMPTZ,
                sync_error TEXT,
                UNIQUE (service_name, schema_version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_modules_service_name ON modules(service_name)",
            "CREATE INDEX IF NOT EXISTS idx_modules_status ON modules(status)",
            "CREATE INDEX IF NOT EXISTS idx_config_schemas_service_name ON config_schemas(service_name)",
            "CREATE INDEX IF NOT EXISTS idx_config_schemas_sync_status ON config_schemas(sync_status)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Persist a module and its config schema in one transaction.
    ///
    /// Upserts keep retried registrations idempotent: one module row per
    /// service id, one schema row per `(service_name, schema_version)`.
    pub async fn register_module(
        &self,
        service_name: &str,
        host: &str,
        port: i32,
        version: &str,
        metadata: JsonValue,
        config_schema_json: &str,
    ) -> Result<ModuleRow, RegistryError> {
        let service_id = generate_service_id(service_name, host, port);
        let schema_id = generate_schema_id(service_name, version);
        let schema: JsonValue = serde_json::from_str(config_schema_json)
            .map_err(|e| RegistryError::Serialization(format!("Invalid config schema: {}", e)))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO config_schemas (schema_id, service_name, schema_version, json_schema, sync_status)
            VALUES ($1, $2, $3, $4, 'PENDING')
            ON CONFLICT (service_name, schema_version)
            DO UPDATE SET json_schema = EXCLUDED.json_schema
            "#,
        )
        .bind(&schema_id)
        .bind(service_name)
        .bind(version)
        .bind(&schema)
        .execute(&mut *tx)
        .await?;

        let module: ModuleRow = sqlx::query_as(
            r#"
            INSERT INTO modules (service_id, service_name, host, port, version, config_schema_id, metadata, last_heartbeat)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (service_id)
            DO UPDATE SET
                version = EXCLUDED.version,
                config_schema_id = EXCLUDED.config_schema_id,
                metadata = EXCLUDED.metadata,
                last_heartbeat = now(),
                status = 'ACTIVE'
            RETURNING *
            "#,
        )
        .bind(&service_id)
        .bind(service_name)
        .bind(host)
        .bind(port)
        .bind(version)
        .bind(&schema_id)
        .bind(&metadata)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!("Saved module {} with schema {}", service_id, schema_id);
        Ok(module)
    }

    pub async fn find_module_by_id(
        &self,
        service_id: &str,
    ) -> Result<Option<ModuleRow>, RegistryError> {
        let module = sqlx::query_as("SELECT * FROM modules WHERE service_id = $1")
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(module)
    }

    pub async fn find_module_by_name(
        &self,
        service_name: &str,
    ) -> Result<Option<ModuleRow>, RegistryError> {
        let module = sqlx::query_as(
            "SELECT * FROM modules WHERE service_name = $1 ORDER BY registered_at LIMIT 1",
        )
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(module)
    }

    /// Remove a module row; returns whether a row existed
    pub async fn delete_module(&self, service_id: &str) -> Result<bool, RegistryError> {
        let result = sqlx::query("DELETE FROM modules WHERE service_id = $1")
            .bind(service_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Refresh a module's heartbeat timestamp
    pub async fn touch_heartbeat(&self, service_id: &str) -> Result<bool, RegistryError> {
        let result = sqlx::query("UPDATE modules SET last_heartbeat = now() WHERE service_id = $1")
            .bind(service_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_schema_by_id(
        &self,
        schema_id: &str,
    ) -> Result<Option<ConfigSchemaRow>, RegistryError> {
        let schema = sqlx::query_as("SELECT * FROM config_schemas WHERE schema_id = $1")
            .bind(schema_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(schema)
    }

    /// Latest schema for a service: highest `created_at`, ties broken on
    /// `schema_version` descending.
    pub async fn find_latest_schema_by_name(
        &self,
        service_name: &str,
    ) -> Result<Option<ConfigSchemaRow>, RegistryError> {
        let schema = sqlx::query_as(
            r#"
            SELECT * FROM config_schemas
            WHERE service_name = $1
            ORDER BY created_at DESC, schema_version DESC
            LIMIT 1
            "#,
        )
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(schema)
    }

    /// All known schema versions for a service, newest first
    pub async fn list_schema_versions(
        &self,
        service_name: &str,
    ) -> Result<Vec<String>, RegistryError> {
        let versions: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT schema_version FROM config_schemas
            WHERE service_name = $1
            ORDER BY created_at DESC, schema_version DESC
            "#,
        )
        .bind(service_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(versions.into_iter().map(|(v,)| v).collect())
    }

    /// Record a successful archive sync
    pub async fn mark_schema_synced(
        &self,
        schema_id: &str,
        artifact_id: &str,
        global_id: i64,
    ) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            UPDATE config_schemas
            SET sync_status = 'SYNCED',
                archive_artifact_id = $2,
                archive_global_id = $3,
                last_sync_attempt = now(),
                sync_error = NULL
            WHERE schema_id = $1
            "#,
        )
        .bind(schema_id)
        .bind(artifact_id)
        .bind(global_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed archive sync
    pub async fn mark_schema_failed(
        &self,
        schema_id: &str,
        error: &str,
    ) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            UPDATE config_schemas
            SET sync_status = 'FAILED',
                last_sync_attempt = now(),
                sync_error = $2
            WHERE schema_id = $1
            "#,
        )
        .bind(schema_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
