use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info};

use super::{DefinitionStorage, DefinitionSummary};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::model::{FlatNode, KpiDefinition, KpiNodeType, LogicalOperationType, SdInstanceMode};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed definition storage
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// In-memory database, mainly for tests
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        // Every connection to :memory: is its own database; keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn nodes_of(&self, definition_id: u32) -> StorageResult<Vec<FlatNode>> {
        let rows: Vec<NodeRow> = sqlx::query_as(
            r#"
            SELECT kpi_definition_id, id, node_type, parent_node_id, logical_operation_type,
                   sd_parameter_id, sd_parameter_specification, boolean_reference_value,
                   numeric_reference_value, string_reference_value
            FROM kpi_nodes
            WHERE kpi_definition_id = ?
            ORDER BY position
            "#,
        )
        .bind(i64::from(definition_id))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_flat_node(definition_id))
            .collect()
    }

    async fn selected_uids_of(&self, definition_id: u32) -> StorageResult<Vec<String>> {
        let uids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT sd_instance_uid
            FROM kpi_definition_selected_instances
            WHERE kpi_definition_id = ?
            ORDER BY sd_instance_uid
            "#,
        )
        .bind(i64::from(definition_id))
        .fetch_all(&self.pool)
        .await?;

        Ok(uids.into_iter().map(|(uid,)| uid).collect())
    }
}

#[async_trait]
impl DefinitionStorage for SqliteStorage {
    async fn create_definition(&self, definition: &KpiDefinition) -> StorageResult<u32> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO kpi_definitions
                (user_identifier, sd_type_id, sd_type_specification, sd_instance_mode, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&definition.user_identifier)
        .bind(i64::from(definition.sd_type_id))
        .bind(&definition.sd_type_specification)
        .bind(definition.sd_instance_mode.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let row_id = result.last_insert_rowid();
        let id = u32::try_from(row_id).map_err(|_| StorageError::Query {
            message: format!("Definition id {} out of range", row_id),
        })?;

        insert_contents(&mut tx, id, definition).await?;
        tx.commit().await?;

        debug!(definition_id = id, nodes = definition.nodes.len(), "KPI definition stored");
        Ok(id)
    }

    async fn get_definition(&self, id: u32) -> StorageResult<Option<KpiDefinition>> {
        let row: Option<DefinitionRow> = sqlx::query_as(
            r#"
            SELECT id, user_identifier, sd_type_id, sd_type_specification, sd_instance_mode,
                   created_at, updated_at, 0 AS node_count
            FROM kpi_definitions
            WHERE id = ?
            "#,
        )
        .bind(i64::from(id))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let nodes = self.nodes_of(id).await?;
        let selected = self.selected_uids_of(id).await?;
        row.into_definition(nodes, selected).map(Some)
    }

    async fn update_definition(&self, id: u32, definition: &KpiDefinition) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE kpi_definitions
            SET user_identifier = ?, sd_type_id = ?, sd_type_specification = ?,
                sd_instance_mode = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&definition.user_identifier)
        .bind(i64::from(definition.sd_type_id))
        .bind(&definition.sd_type_specification)
        .bind(definition.sd_instance_mode.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(i64::from(id))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::DefinitionNotFound { definition_id: id });
        }

        delete_contents(&mut tx, id).await?;
        insert_contents(&mut tx, id, definition).await?;
        tx.commit().await?;

        debug!(definition_id = id, "KPI definition replaced");
        Ok(())
    }

    async fn delete_definition(&self, id: u32) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        delete_contents(&mut tx, id).await?;

        let result = sqlx::query("DELETE FROM kpi_definitions WHERE id = ?")
            .bind(i64::from(id))
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::DefinitionNotFound { definition_id: id });
        }

        tx.commit().await?;
        debug!(definition_id = id, "KPI definition deleted");
        Ok(())
    }

    async fn list_definitions(&self) -> StorageResult<Vec<DefinitionSummary>> {
        let rows: Vec<DefinitionRow> = sqlx::query_as(
            r#"
            SELECT d.id, d.user_identifier, d.sd_type_id, d.sd_type_specification,
                   d.sd_instance_mode, d.created_at, d.updated_at,
                   (SELECT COUNT(*) FROM kpi_nodes n WHERE n.kpi_definition_id = d.id) AS node_count
            FROM kpi_definitions d
            ORDER BY d.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DefinitionRow::into_summary).collect()
    }

    async fn load_definitions(&self) -> StorageResult<Vec<KpiDefinition>> {
        let rows: Vec<DefinitionRow> = sqlx::query_as(
            r#"
            SELECT id, user_identifier, sd_type_id, sd_type_specification, sd_instance_mode,
                   created_at, updated_at, 0 AS node_count
            FROM kpi_definitions
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let node_rows: Vec<NodeRow> = sqlx::query_as(
            r#"
            SELECT kpi_definition_id, id, node_type, parent_node_id, logical_operation_type,
                   sd_parameter_id, sd_parameter_specification, boolean_reference_value,
                   numeric_reference_value, string_reference_value
            FROM kpi_nodes
            ORDER BY kpi_definition_id, position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let selected_rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT kpi_definition_id, sd_instance_uid
            FROM kpi_definition_selected_instances
            ORDER BY kpi_definition_id, sd_instance_uid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut nodes: HashMap<i64, Vec<NodeRow>> = HashMap::new();
        for row in node_rows {
            nodes.entry(row.kpi_definition_id).or_default().push(row);
        }
        let mut selected: HashMap<i64, Vec<String>> = HashMap::new();
        for (definition_id, uid) in selected_rows {
            selected.entry(definition_id).or_default().push(uid);
        }

        let mut definitions = Vec::with_capacity(rows.len());
        for row in rows {
            let definition_id = row.definition_id()?;
            let flat = nodes
                .remove(&row.id)
                .unwrap_or_default()
                .into_iter()
                .map(|n| n.into_flat_node(definition_id))
                .collect::<StorageResult<Vec<_>>>()?;
            let uids = selected.remove(&row.id).unwrap_or_default();
            definitions.push(row.into_definition(flat, uids)?);
        }

        info!(definitions = definitions.len(), "KPI definitions loaded");
        Ok(definitions)
    }
}

async fn insert_contents(
    tx: &mut Transaction<'_, Sqlite>,
    id: u32,
    definition: &KpiDefinition,
) -> StorageResult<()> {
    for uid in &definition.selected_sd_instance_uids {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO kpi_definition_selected_instances (kpi_definition_id, sd_instance_uid)
            VALUES (?, ?)
            "#,
        )
        .bind(i64::from(id))
        .bind(uid)
        .execute(&mut **tx)
        .await?;
    }

    for (position, node) in definition.nodes.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO kpi_nodes
                (kpi_definition_id, id, node_type, parent_node_id, logical_operation_type,
                 sd_parameter_id, sd_parameter_specification, boolean_reference_value,
                 numeric_reference_value, string_reference_value, position)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(i64::from(id))
        .bind(i64::from(node.id))
        .bind(node.node_type.as_str())
        .bind(node.parent_node_id.map(i64::from))
        .bind(node.logical_operation_type.map(|op| op.as_str()))
        .bind(node.sd_parameter_id.map(i64::from))
        .bind(&node.sd_parameter_specification)
        .bind(node.boolean_reference_value)
        .bind(node.numeric_reference_value)
        .bind(&node.string_reference_value)
        .bind(position as i64)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

async fn delete_contents(tx: &mut Transaction<'_, Sqlite>, id: u32) -> StorageResult<()> {
    sqlx::query("DELETE FROM kpi_nodes WHERE kpi_definition_id = ?")
        .bind(i64::from(id))
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM kpi_definition_selected_instances WHERE kpi_definition_id = ?")
        .bind(i64::from(id))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct DefinitionRow {
    id: i64,
    user_identifier: String,
    sd_type_id: i64,
    sd_type_specification: String,
    sd_instance_mode: String,
    created_at: String,
    updated_at: String,
    node_count: i64,
}

impl DefinitionRow {
    fn definition_id(&self) -> StorageResult<u32> {
        u32::try_from(self.id).map_err(|_| StorageError::Query {
            message: format!("Definition id {} out of range", self.id),
        })
    }

    fn corrupt(&self, message: String) -> StorageError {
        StorageError::Corrupt {
            definition_id: u32::try_from(self.id).unwrap_or(u32::MAX),
            message,
        }
    }

    fn mode(&self) -> StorageResult<SdInstanceMode> {
        self.sd_instance_mode
            .parse()
            .map_err(|e: String| self.corrupt(e))
    }

    fn type_id(&self) -> StorageResult<u32> {
        u32::try_from(self.sd_type_id)
            .map_err(|_| self.corrupt(format!("SD type id {} out of range", self.sd_type_id)))
    }

    fn into_definition(
        self,
        nodes: Vec<FlatNode>,
        selected: Vec<String>,
    ) -> StorageResult<KpiDefinition> {
        Ok(KpiDefinition {
            id: Some(self.definition_id()?),
            sd_type_id: self.type_id()?,
            sd_instance_mode: self.mode()?,
            user_identifier: self.user_identifier,
            sd_type_specification: self.sd_type_specification,
            selected_sd_instance_uids: selected,
            nodes,
        })
    }

    fn into_summary(self) -> StorageResult<DefinitionSummary> {
        Ok(DefinitionSummary {
            id: self.definition_id()?,
            sd_type_id: self.type_id()?,
            sd_instance_mode: self.mode()?,
            node_count: u32::try_from(self.node_count).unwrap_or(u32::MAX),
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
            user_identifier: self.user_identifier,
            sd_type_specification: self.sd_type_specification,
        })
    }
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    kpi_definition_id: i64,
    id: i64,
    node_type: String,
    parent_node_id: Option<i64>,
    logical_operation_type: Option<String>,
    sd_parameter_id: Option<i64>,
    sd_parameter_specification: Option<String>,
    boolean_reference_value: Option<bool>,
    numeric_reference_value: Option<f64>,
    string_reference_value: Option<String>,
}

impl NodeRow {
    fn into_flat_node(self, definition_id: u32) -> StorageResult<FlatNode> {
        let corrupt = |message: String| StorageError::Corrupt {
            definition_id,
            message,
        };
        let id_of = |value: i64, what: &str| {
            u32::try_from(value).map_err(|_| corrupt(format!("{} {} out of range", what, value)))
        };

        let node_type: KpiNodeType = self.node_type.parse().map_err(corrupt)?;
        let logical_operation_type = self
            .logical_operation_type
            .as_deref()
            .map(LogicalOperationType::from_str)
            .transpose()
            .map_err(corrupt)?;

        Ok(FlatNode {
            id: id_of(self.id, "node id")?,
            node_type,
            parent_node_id: self
                .parent_node_id
                .map(|p| id_of(p, "parent node id"))
                .transpose()?,
            logical_operation_type,
            sd_parameter_id: self
                .sd_parameter_id
                .map(|p| id_of(p, "parameter id"))
                .transpose()?,
            sd_parameter_specification: self.sd_parameter_specification,
            boolean_reference_value: self.boolean_reference_value,
            numeric_reference_value: self.numeric_reference_value,
            string_reference_value: self.string_reference_value,
        })
    }
}
