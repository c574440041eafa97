//! Persistence of KPI definitions.
//!
//! Definitions are stored in their flat-node form. Callers hand in
//! definitions already prepared with
//! [`KpiDefinition::prepared_for_submission`]; the storage layer does not
//! re-validate trees.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::model::{KpiDefinition, SdInstanceMode};

/// Listing entry for a stored definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionSummary {
    /// Definition id.
    pub id: u32,
    /// Display name.
    pub user_identifier: String,
    /// Targeted device type.
    #[serde(rename = "sdTypeID")]
    pub sd_type_id: u32,
    /// Denotation of the targeted device type.
    #[serde(rename = "sdTypeSpecification")]
    pub sd_type_specification: String,
    /// Instance selection mode.
    #[serde(rename = "sdInstanceMode")]
    pub sd_instance_mode: SdInstanceMode,
    /// Number of stored nodes.
    pub node_count: u32,
    /// When the definition was created.
    pub created_at: DateTime<Utc>,
    /// When the definition was last replaced.
    pub updated_at: DateTime<Utc>,
}

/// Storage backend for KPI definitions.
#[async_trait]
pub trait DefinitionStorage: Send + Sync {
    /// Insert a definition and return its new id. Any `id` on the input is
    /// ignored.
    async fn create_definition(&self, definition: &KpiDefinition) -> StorageResult<u32>;

    /// Get a definition by id, with its id set.
    async fn get_definition(&self, id: u32) -> StorageResult<Option<KpiDefinition>>;

    /// Replace a definition's content and nodes.
    async fn update_definition(&self, id: u32, definition: &KpiDefinition) -> StorageResult<()>;

    /// Delete a definition with its nodes.
    async fn delete_definition(&self, id: u32) -> StorageResult<()>;

    /// Summaries of all definitions ordered by id.
    async fn list_definitions(&self) -> StorageResult<Vec<DefinitionSummary>>;

    /// All definitions with their nodes, ordered by id.
    async fn load_definitions(&self) -> StorageResult<Vec<KpiDefinition>>;
}
