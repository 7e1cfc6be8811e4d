use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::backup::Backup;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::sqlite::configure_connection;

use super::model::{Deployment, DeploymentStatus, DeploymentStrategy, ModelVersion};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open deployment store {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("store query failed: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("failed to encode stored document: {0}")]
    Serialize(#[from] serde_json::Error),
}

const DEPLOYMENT_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS deployments (
    id TEXT PRIMARY KEY,
    model_version_id TEXT NOT NULL,
    strategy TEXT NOT NULL,
    canary_config TEXT NOT NULL,
    status TEXT NOT NULL,
    traffic_percentage INTEGER NOT NULL DEFAULT 0,
    deployed_robot_ids TEXT NOT NULL DEFAULT '[]',
    failed_robot_ids TEXT NOT NULL DEFAULT '[]',
    stage_started_at TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    rollback_reason TEXT,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments(status);
CREATE INDEX IF NOT EXISTS idx_deployments_model_version ON deployments(model_version_id);

CREATE TABLE IF NOT EXISTS model_versions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    artifact_uri TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

/// Filter and pagination for deployment listings.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    pub model_version_id: Option<String>,
    pub status: Option<DeploymentStatus>,
    pub strategy: Option<DeploymentStrategy>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

impl DeploymentFilter {
    fn page(&self) -> usize {
        self.page.unwrap_or(1).max(1)
    }

    fn page_size(&self) -> usize {
        self.page_size.unwrap_or(20).clamp(1, 200)
    }
}

/// One page of a deployment listing.
#[derive(Debug, Clone)]
pub struct DeploymentPage {
    pub deployments: Vec<Deployment>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone)]
pub struct DeploymentStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for DeploymentStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl DeploymentStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteDeploymentStore> {
        let path = self.path.unwrap_or_else(|| PathBuf::from("deployments.sqlite"));
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if self.create_if_missing && !self.read_only {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteDeploymentStore { path, flags })
    }
}

/// SQLite-backed persistence for deployments and model-version records.
/// Opens a configured connection per call so the store stays cheap to
/// clone and safe to share across tasks.
#[derive(Debug, Clone)]
pub struct SqliteDeploymentStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteDeploymentStore {
    pub fn builder() -> DeploymentStoreBuilder {
        DeploymentStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        DeploymentStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(DEPLOYMENT_SCHEMA)?;
        Ok(())
    }

    pub fn insert_deployment(&self, deployment: &Deployment) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO deployments (
                id, model_version_id, strategy, canary_config, status,
                traffic_percentage, deployed_robot_ids, failed_robot_ids,
                stage_started_at, created_at, started_at, completed_at,
                rollback_reason, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                deployment.id.to_string(),
                deployment.model_version_id,
                deployment.strategy.as_str(),
                serde_json::to_string(&deployment.canary_config)?,
                deployment.status.as_str(),
                deployment.traffic_percentage,
                serde_json::to_string(&deployment.deployed_robot_ids)?,
                serde_json::to_string(&deployment.failed_robot_ids)?,
                deployment.stage_started_at,
                deployment.created_at,
                deployment.started_at,
                deployment.completed_at,
                deployment.rollback_reason,
                deployment.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn update_deployment(&self, deployment: &Deployment) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE deployments SET
                model_version_id = ?2, strategy = ?3, canary_config = ?4,
                status = ?5, traffic_percentage = ?6, deployed_robot_ids = ?7,
                failed_robot_ids = ?8, stage_started_at = ?9, created_at = ?10,
                started_at = ?11, completed_at = ?12, rollback_reason = ?13,
                error_message = ?14
             WHERE id = ?1",
            params![
                deployment.id.to_string(),
                deployment.model_version_id,
                deployment.strategy.as_str(),
                serde_json::to_string(&deployment.canary_config)?,
                deployment.status.as_str(),
                deployment.traffic_percentage,
                serde_json::to_string(&deployment.deployed_robot_ids)?,
                serde_json::to_string(&deployment.failed_robot_ids)?,
                deployment.stage_started_at,
                deployment.created_at,
                deployment.started_at,
                deployment.completed_at,
                deployment.rollback_reason,
                deployment.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn deployment(&self, id: Uuid) -> StoreResult<Option<Deployment>> {
        let conn = self.open()?;
        let deployment = conn
            .query_row(
                "SELECT * FROM deployments WHERE id = ?1",
                params![id.to_string()],
                deployment_from_row,
            )
            .optional()?;
        Ok(deployment)
    }

    pub fn list_deployments(&self, filter: &DeploymentFilter) -> StoreResult<DeploymentPage> {
        let conn = self.open()?;
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(model_version_id) = &filter.model_version_id {
            clauses.push("model_version_id = ?");
            values.push(model_version_id.clone());
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(status.as_str().to_string());
        }
        if let Some(strategy) = filter.strategy {
            clauses.push("strategy = ?");
            values.push(strategy.as_str().to_string());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let total: usize = conn.query_row(
            &format!("SELECT COUNT(*) FROM deployments{where_clause}"),
            rusqlite::params_from_iter(values.iter()),
            |row| row.get::<_, i64>(0),
        )? as usize;

        let page = filter.page();
        let page_size = filter.page_size();
        let offset = (page - 1) * page_size;

        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM deployments{where_clause} ORDER BY created_at DESC LIMIT {page_size} OFFSET {offset}"
        ))?;
        let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
        let mut deployments = Vec::new();
        while let Some(row) = rows.next()? {
            deployments.push(deployment_from_row(row)?);
        }

        Ok(DeploymentPage {
            deployments,
            total,
            page,
            page_size,
        })
    }

    /// Deployments in a state where fleet traffic is, or is being, shifted.
    pub fn active_deployments(&self) -> StoreResult<Vec<Deployment>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM deployments
             WHERE status IN ('starting', 'in_progress', 'promoting', 'rolling_back')
             ORDER BY created_at DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut deployments = Vec::new();
        while let Some(row) = rows.next()? {
            deployments.push(deployment_from_row(row)?);
        }
        Ok(deployments)
    }

    pub fn insert_model_version(&self, model_version: &ModelVersion) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO model_versions (id, name, version, artifact_uri, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                model_version.id,
                model_version.name,
                model_version.version,
                model_version.artifact_uri,
                model_version.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn model_version(&self, id: &str) -> StoreResult<Option<ModelVersion>> {
        let conn = self.open()?;
        let model_version = conn
            .query_row(
                "SELECT id, name, version, artifact_uri, created_at
                 FROM model_versions WHERE id = ?1",
                params![id],
                model_version_from_row,
            )
            .optional()?;
        Ok(model_version)
    }

    pub fn list_model_versions(&self) -> StoreResult<Vec<ModelVersion>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, version, artifact_uri, created_at
             FROM model_versions ORDER BY created_at DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next()? {
            versions.push(model_version_from_row(row)?);
        }
        Ok(versions)
    }

    /// Online backup of the store to `output`.
    pub fn export_backup(&self, output: impl AsRef<Path>) -> StoreResult<()> {
        let source = self.open()?;
        let mut destination = Connection::open(output.as_ref())?;
        let backup = Backup::new(&source, &mut destination)?;
        backup.run_to_completion(64, std::time::Duration::from_millis(50), None)?;
        Ok(())
    }
}

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    let id_raw: String = row.get("id")?;
    let strategy_raw: String = row.get("strategy")?;
    let status_raw: String = row.get("status")?;
    let config_raw: String = row.get("canary_config")?;
    let deployed_raw: String = row.get("deployed_robot_ids")?;
    let failed_raw: String = row.get("failed_robot_ids")?;

    Ok(Deployment {
        id: Uuid::parse_str(&id_raw).map_err(|err| text_conversion_error(0, err))?,
        model_version_id: row.get("model_version_id")?,
        strategy: strategy_raw
            .parse()
            .map_err(|err: String| text_conversion_error(2, err))?,
        canary_config: serde_json::from_str(&config_raw)
            .map_err(|err| text_conversion_error(3, err))?,
        status: status_raw
            .parse()
            .map_err(|err: String| text_conversion_error(4, err))?,
        traffic_percentage: row.get("traffic_percentage")?,
        deployed_robot_ids: serde_json::from_str(&deployed_raw)
            .map_err(|err| text_conversion_error(6, err))?,
        failed_robot_ids: serde_json::from_str(&failed_raw)
            .map_err(|err| text_conversion_error(7, err))?,
        stage_started_at: row.get("stage_started_at")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        rollback_reason: row.get("rollback_reason")?,
        error_message: row.get("error_message")?,
    })
}

fn model_version_from_row(row: &Row<'_>) -> rusqlite::Result<ModelVersion> {
    Ok(ModelVersion {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        artifact_uri: row.get(3)?,
        created_at: row.get::<_, DateTime<Utc>>(4)?,
    })
}

fn text_conversion_error(
    column: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err.into())
}
