//! Bulk-loaded device inventory and compiled KPI definitions.
//!
//! The [`Catalog`] is immutable once built. Every KPI definition is compiled
//! into its expression tree up front; a definition that fails to compile is
//! recorded as a [`LoadIssue`] and left out, the rest of the catalog loads
//! normally.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult, KpiError, KpiResult};
use crate::evaluation::applies;
use crate::model::{
    FulfillmentCheckResult, KpiDefinition, KpiTree, SdInstance, SdInstanceGroup, SdType,
};

/// The bulk-load data contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BulkLoad {
    /// Device types with their parameter declarations.
    pub sd_types: Vec<SdType>,
    /// Device instances.
    pub sd_instances: Vec<SdInstance>,
    /// Device instance groups.
    pub sd_instance_groups: Vec<SdInstanceGroup>,
    /// KPI definitions in persisted form.
    pub kpi_definitions: Vec<KpiDefinition>,
    /// Initial fulfillment results.
    pub kpi_fulfillment_check_results: Vec<FulfillmentCheckResult>,
}

impl BulkLoad {
    /// Parse a bulk load from JSON text.
    pub fn from_json(json: &str) -> AppResult<Self> {
        serde_json::from_str(json).map_err(|e| AppError::BulkLoad {
            message: format!("invalid bulk load document: {}", e),
        })
    }

    /// Read and parse a bulk load file.
    pub async fn from_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::BulkLoad {
                message: format!("cannot read {}: {}", path.display(), e),
            })?;
        let bulk = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            sd_types = bulk.sd_types.len(),
            sd_instances = bulk.sd_instances.len(),
            groups = bulk.sd_instance_groups.len(),
            definitions = bulk.kpi_definitions.len(),
            results = bulk.kpi_fulfillment_check_results.len(),
            "Bulk load read"
        );
        Ok(bulk)
    }

    /// Append stored definitions whose ids the bulk load does not already
    /// carry. Returns how many were added.
    pub fn merge_definitions(&mut self, stored: Vec<KpiDefinition>) -> usize {
        let known: HashSet<u32> = self.kpi_definitions.iter().filter_map(|d| d.id).collect();
        let before = self.kpi_definitions.len();
        for definition in stored {
            match definition.id {
                Some(id) if known.contains(&id) => {
                    warn!(
                        definition_id = id,
                        definition = %definition.user_identifier,
                        "Stored KPI definition shadowed by the bulk load, skipping it"
                    );
                }
                _ => self.kpi_definitions.push(definition),
            }
        }
        self.kpi_definitions.len() - before
    }
}

/// A KPI definition together with its compiled expression tree.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledDefinition {
    /// Definition identifier.
    pub id: u32,
    /// Persisted definition.
    pub definition: KpiDefinition,
    /// Expression tree built from `definition.nodes`.
    pub tree: KpiTree,
}

impl CompiledDefinition {
    /// Compile a persisted definition.
    ///
    /// The tree must be structurally valid and complete. When the targeted
    /// device type is known, every atom is also checked against it.
    pub fn compile(definition: KpiDefinition, sd_type: Option<&SdType>) -> KpiResult<Self> {
        let id = definition.id.ok_or_else(|| KpiError::MissingDefinitionId {
            user_identifier: definition.user_identifier.clone(),
        })?;
        let tree = definition.tree()?;
        tree.validate_for_submission()?;
        if let Some(sd_type) = sd_type {
            tree.check_parameters(sd_type)?;
        }
        Ok(Self {
            id,
            definition,
            tree,
        })
    }

    /// Display name of the definition.
    pub fn user_identifier(&self) -> &str {
        &self.definition.user_identifier
    }
}

/// A definition that was skipped while building the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadIssue {
    /// Definition id, when present.
    pub definition_id: Option<u32>,
    /// Definition display name.
    pub user_identifier: String,
    /// Why the definition was skipped.
    pub error: KpiError,
}

impl std::fmt::Display for LoadIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.definition_id {
            Some(id) => write!(f, "[{}] {}: {}", id, self.user_identifier, self.error),
            None => write!(f, "{}: {}", self.user_identifier, self.error),
        }
    }
}

/// Indexed, read-only view of a bulk load.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    sd_types: HashMap<u32, SdType>,
    instances: BTreeMap<u32, SdInstance>,
    groups: BTreeMap<u32, SdInstanceGroup>,
    definitions: BTreeMap<u32, CompiledDefinition>,
    groups_by_instance: HashMap<u32, Vec<u32>>,
    applicable_by_instance: HashMap<u32, Vec<u32>>,
    issues: Vec<LoadIssue>,
}

impl Catalog {
    /// Build the catalog from a bulk load.
    pub fn from_bulk(bulk: &BulkLoad) -> Self {
        let sd_types: HashMap<u32, SdType> =
            bulk.sd_types.iter().map(|t| (t.id, t.clone())).collect();
        let instances: BTreeMap<u32, SdInstance> = bulk
            .sd_instances
            .iter()
            .map(|i| (i.id, i.clone()))
            .collect();

        let mut definitions = BTreeMap::new();
        let mut issues = Vec::new();
        for definition in &bulk.kpi_definitions {
            let definition_id = definition.id;
            let user_identifier = definition.user_identifier.clone();
            let sd_type = sd_types.get(&definition.sd_type_id);
            if sd_type.is_none() {
                debug!(
                    definition = %user_identifier,
                    sd_type_id = definition.sd_type_id,
                    "Device type not in bulk load, skipping parameter check"
                );
            }
            match CompiledDefinition::compile(definition.clone(), sd_type) {
                Ok(compiled) => {
                    if definitions.insert(compiled.id, compiled).is_some() {
                        warn!(
                            definition_id = ?definition_id,
                            "Duplicate KPI definition id, keeping the last one"
                        );
                    }
                }
                Err(e) => {
                    error!(
                        definition_id = ?definition_id,
                        definition = %user_identifier,
                        error = %e,
                        "Skipping KPI definition"
                    );
                    issues.push(LoadIssue {
                        definition_id,
                        user_identifier,
                        error: e,
                    });
                }
            }
        }

        let mut groups: BTreeMap<u32, SdInstanceGroup> = BTreeMap::new();
        let mut groups_by_instance: HashMap<u32, Vec<u32>> = HashMap::new();
        for group in &bulk.sd_instance_groups {
            if let Some(previous) = groups.remove(&group.id) {
                warn!(group_id = group.id, "Duplicate group id, keeping the last one");
                for member in previous.sd_instance_ids {
                    if let Some(ids) = groups_by_instance.get_mut(&member) {
                        ids.retain(|id| *id != group.id);
                        if ids.is_empty() {
                            groups_by_instance.remove(&member);
                        }
                    }
                }
            }

            let mut members = group.sd_instance_ids.clone();
            members.sort_unstable();
            members.dedup();
            for member in &members {
                if !instances.contains_key(member) {
                    warn!(
                        group_id = group.id,
                        instance_id = member,
                        "Group references unknown instance"
                    );
                }
                groups_by_instance.entry(*member).or_default().push(group.id);
            }
            groups.insert(
                group.id,
                SdInstanceGroup {
                    sd_instance_ids: members,
                    ..group.clone()
                },
            );
        }

        let applicable_by_instance: HashMap<u32, Vec<u32>> = instances
            .values()
            .map(|instance| {
                let ids = definitions
                    .values()
                    .filter(|d| applies(&d.definition, instance))
                    .map(|d| d.id)
                    .collect();
                (instance.id, ids)
            })
            .collect();

        info!(
            instances = instances.len(),
            groups = groups.len(),
            definitions = definitions.len(),
            skipped = issues.len(),
            "Catalog built"
        );

        Self {
            sd_types,
            instances,
            groups,
            definitions,
            groups_by_instance,
            applicable_by_instance,
            issues,
        }
    }

    /// Device type by id.
    pub fn sd_type(&self, id: u32) -> Option<&SdType> {
        self.sd_types.get(&id)
    }

    /// Instance by id.
    pub fn instance(&self, id: u32) -> Option<&SdInstance> {
        self.instances.get(&id)
    }

    /// All instances ordered by id.
    pub fn instances(&self) -> impl Iterator<Item = &SdInstance> {
        self.instances.values()
    }

    /// Group by id.
    pub fn group(&self, id: u32) -> Option<&SdInstanceGroup> {
        self.groups.get(&id)
    }

    /// All groups ordered by id.
    pub fn groups(&self) -> impl Iterator<Item = &SdInstanceGroup> {
        self.groups.values()
    }

    /// Compiled definition by id.
    pub fn definition(&self, id: u32) -> Option<&CompiledDefinition> {
        self.definitions.get(&id)
    }

    /// All compiled definitions ordered by id.
    pub fn definitions(&self) -> impl Iterator<Item = &CompiledDefinition> {
        self.definitions.values()
    }

    /// Definitions skipped while loading.
    pub fn issues(&self) -> &[LoadIssue] {
        &self.issues
    }

    /// Ids of the groups containing `instance_id`.
    pub fn groups_containing(&self, instance_id: u32) -> &[u32] {
        self.groups_by_instance
            .get(&instance_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ids of the definitions applicable to `instance_id`, ascending.
    pub fn applicable_definitions(&self, instance_id: u32) -> &[u32] {
        self.applicable_by_instance
            .get(&instance_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether `definition_id` applies to `instance_id`.
    pub fn is_applicable(&self, definition_id: u32, instance_id: u32) -> bool {
        self.applicable_definitions(instance_id)
            .binary_search(&definition_id)
            .is_ok()
    }
}
