//! Domain model for device types, instances, groups and KPI definitions.
//!
//! Wire shapes follow the camelCase field names of the bulk-load contract
//! (`sdTypeID`, `selectedSDInstanceUIDs`, ...). Identifiers are `u32` and are
//! accepted both as JSON numbers and as numeric strings.

mod ids;
pub mod node;
pub mod tree;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use ids::{de_id, de_ids, de_opt_id};
pub use node::{Atom, AtomCondition, FlatNode, KpiNodeType, LogicalOperationType, NodeKind};
pub use tree::{KpiTree, NodeContent, TreeNode, MAX_TREE_DEPTH};

// ============================================================================
// Tri-state fulfillment
// ============================================================================

/// Tri-state KPI fulfillment.
///
/// `Unknown` is a first-class value: no result observed yet, an unconfirmed
/// instance, or an evaluation that could not be decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fulfillment {
    /// The KPI condition holds.
    Fulfilled,
    /// The KPI condition does not hold.
    Unfulfilled,
    /// Not decidable from the available data.
    #[default]
    Unknown,
}

impl Fulfillment {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Fulfillment::Fulfilled => "fulfilled",
            Fulfillment::Unfulfilled => "unfulfilled",
            Fulfillment::Unknown => "unknown",
        }
    }

    /// Sort rank surfacing failures first: Unfulfilled < Unknown < Fulfilled.
    pub fn rank(&self) -> u8 {
        match self {
            Fulfillment::Unfulfilled => 0,
            Fulfillment::Unknown => 1,
            Fulfillment::Fulfilled => 2,
        }
    }

    /// Wire representation (`null` for Unknown).
    pub fn as_option(&self) -> Option<bool> {
        match self {
            Fulfillment::Fulfilled => Some(true),
            Fulfillment::Unfulfilled => Some(false),
            Fulfillment::Unknown => None,
        }
    }

    /// Logical negation; Unknown stays Unknown.
    pub fn negate(self) -> Self {
        match self {
            Fulfillment::Fulfilled => Fulfillment::Unfulfilled,
            Fulfillment::Unfulfilled => Fulfillment::Fulfilled,
            Fulfillment::Unknown => Fulfillment::Unknown,
        }
    }
}

impl From<bool> for Fulfillment {
    fn from(value: bool) -> Self {
        if value {
            Fulfillment::Fulfilled
        } else {
            Fulfillment::Unfulfilled
        }
    }
}

impl From<Option<bool>> for Fulfillment {
    fn from(value: Option<bool>) -> Self {
        value.map(Fulfillment::from).unwrap_or(Fulfillment::Unknown)
    }
}

impl std::fmt::Display for Fulfillment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Device types and instances
// ============================================================================

/// Declared value type of a device-type parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParameterType {
    /// Free-form text.
    #[serde(alias = "string")]
    String,
    /// Floating point number.
    #[serde(alias = "number")]
    Number,
    /// True/false flag.
    #[serde(alias = "boolean")]
    Boolean,
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterType::String => write!(f, "STRING"),
            ParameterType::Number => write!(f, "NUMBER"),
            ParameterType::Boolean => write!(f, "BOOLEAN"),
        }
    }
}

/// A single parameter declared by a device type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdParameter {
    /// Parameter identifier.
    #[serde(deserialize_with = "de_id")]
    pub id: u32,
    /// Parameter name as reported by devices.
    pub denotation: String,
    /// Declared value type.
    #[serde(rename = "type")]
    pub parameter_type: ParameterType,
}

/// Device ("smart device", SD) type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdType {
    /// Type identifier.
    #[serde(deserialize_with = "de_id")]
    pub id: u32,
    /// Type name.
    pub denotation: String,
    /// Ordered parameter declarations.
    #[serde(default)]
    pub parameters: Vec<SdParameter>,
}

impl SdType {
    /// Look up a parameter declaration by id.
    pub fn parameter(&self, parameter_id: u32) -> Option<&SdParameter> {
        self.parameters.iter().find(|p| p.id == parameter_id)
    }
}

/// Reference to a device type by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdTypeRef {
    /// Referenced type id.
    #[serde(deserialize_with = "de_id")]
    pub id: u32,
}

/// Current value of one telemetry parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Boolean reading.
    Boolean(bool),
    /// Numeric reading.
    Number(f64),
    /// Textual reading.
    String(String),
}

impl ParameterValue {
    /// The type this value carries.
    pub fn parameter_type(&self) -> ParameterType {
        match self {
            ParameterValue::Boolean(_) => ParameterType::Boolean,
            ParameterValue::Number(_) => ParameterType::Number,
            ParameterValue::String(_) => ParameterType::String,
        }
    }
}

/// Latest known value of one parameter of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSnapshot {
    /// Parameter the value belongs to.
    #[serde(rename = "parameterID", deserialize_with = "de_id")]
    pub parameter_id: u32,
    /// Reported value; `None` when the device sent nothing usable.
    #[serde(default)]
    pub value: Option<ParameterValue>,
    /// When the value was received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Parameter values of one instance keyed by parameter id.
pub type SnapshotMap = HashMap<u32, ParameterValue>;

/// A registered device instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdInstance {
    /// Instance identifier.
    #[serde(deserialize_with = "de_id")]
    pub id: u32,
    /// Stable external identifier.
    pub uid: String,
    /// Display name.
    pub user_identifier: String,
    /// Whether a user confirmed the instance; unconfirmed instances report Unknown.
    #[serde(default)]
    pub confirmed_by_user: bool,
    /// Device type reference.
    #[serde(rename = "type")]
    pub sd_type: SdTypeRef,
    /// Latest parameter values.
    #[serde(default)]
    pub parameter_snapshots: Vec<ParameterSnapshot>,
}

impl SdInstance {
    /// Collect the present snapshot values keyed by parameter id.
    pub fn snapshot_map(&self) -> SnapshotMap {
        self.parameter_snapshots
            .iter()
            .filter_map(|s| s.value.clone().map(|v| (s.parameter_id, v)))
            .collect()
    }
}

/// A named set of device instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdInstanceGroup {
    /// Group identifier.
    #[serde(deserialize_with = "de_id")]
    pub id: u32,
    /// Display name.
    pub user_identifier: String,
    /// Member instance ids.
    #[serde(rename = "sdInstanceIDs", default, deserialize_with = "de_ids")]
    pub sd_instance_ids: Vec<u32>,
}

// ============================================================================
// KPI definitions and results
// ============================================================================

/// Which instances of the target type a KPI definition covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SdInstanceMode {
    /// Every instance of the type.
    #[default]
    #[serde(alias = "all")]
    All,
    /// Only instances listed in `selected_sd_instance_uids`.
    #[serde(alias = "selected")]
    Selected,
}

impl std::fmt::Display for SdInstanceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdInstanceMode::All => write!(f, "ALL"),
            SdInstanceMode::Selected => write!(f, "SELECTED"),
        }
    }
}

impl std::str::FromStr for SdInstanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(SdInstanceMode::All),
            "selected" => Ok(SdInstanceMode::Selected),
            _ => Err(format!("Unknown SD instance mode: {}", s)),
        }
    }
}

/// A KPI definition in its persisted (flat node) form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiDefinition {
    /// Identifier; absent for definitions not yet persisted.
    #[serde(default, deserialize_with = "de_opt_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    /// Display name.
    pub user_identifier: String,
    /// Targeted device type.
    #[serde(rename = "sdTypeID", deserialize_with = "de_id")]
    pub sd_type_id: u32,
    /// Denotation of the targeted device type.
    #[serde(rename = "sdTypeSpecification")]
    pub sd_type_specification: String,
    /// Instance selection mode.
    #[serde(rename = "sdInstanceMode", default)]
    pub sd_instance_mode: SdInstanceMode,
    /// Selected instance UIDs (meaningful for `Selected` only).
    #[serde(rename = "selectedSDInstanceUIDs", default)]
    pub selected_sd_instance_uids: Vec<String>,
    /// Flat parent-pointer node list.
    #[serde(default)]
    pub nodes: Vec<FlatNode>,
}

impl KpiDefinition {
    /// Build the expression tree from the flat node list.
    pub fn tree(&self) -> crate::error::KpiResult<KpiTree> {
        KpiTree::build(&self.nodes)
    }

    /// Copy of this definition ready to persist.
    ///
    /// The tree must build and be complete; nodes are renumbered 1.. in
    /// pre-order and the selected UIDs are deduplicated.
    pub fn prepared_for_submission(&self) -> crate::error::KpiResult<Self> {
        let nodes = self.tree()?.submission_nodes()?;
        let mut selected = self.selected_sd_instance_uids.clone();
        selected.sort();
        selected.dedup();
        Ok(Self {
            nodes,
            selected_sd_instance_uids: selected,
            ..self.clone()
        })
    }
}

/// Result of one server-side KPI check: `(kpiDefinitionID, sdInstanceID, fulfilled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentCheckResult {
    /// Checked KPI definition.
    #[serde(rename = "kpiDefinitionID", deserialize_with = "de_id")]
    pub kpi_definition_id: u32,
    /// Checked instance.
    #[serde(rename = "sdInstanceID", deserialize_with = "de_id")]
    pub sd_instance_id: u32,
    /// Outcome; `null` means Unknown.
    #[serde(default)]
    pub fulfilled: Option<bool>,
}

impl FulfillmentCheckResult {
    /// Create a result triple.
    pub fn new(kpi_definition_id: u32, sd_instance_id: u32, fulfilled: Option<bool>) -> Self {
        Self {
            kpi_definition_id,
            sd_instance_id,
            fulfilled,
        }
    }

    /// Outcome as tri-state.
    pub fn fulfillment(&self) -> Fulfillment {
        Fulfillment::from(self.fulfilled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fulfillment_rank_orders_failures_first() {
        assert!(Fulfillment::Unfulfilled.rank() < Fulfillment::Unknown.rank());
        assert!(Fulfillment::Unknown.rank() < Fulfillment::Fulfilled.rank());
    }

    #[test]
    fn test_fulfillment_from_option() {
        assert_eq!(Fulfillment::from(Some(true)), Fulfillment::Fulfilled);
        assert_eq!(Fulfillment::from(Some(false)), Fulfillment::Unfulfilled);
        assert_eq!(Fulfillment::from(None), Fulfillment::Unknown);
        assert_eq!(Fulfillment::Unknown.as_option(), None);
    }

    #[test]
    fn test_fulfillment_negate() {
        assert_eq!(Fulfillment::Fulfilled.negate(), Fulfillment::Unfulfilled);
        assert_eq!(Fulfillment::Unknown.negate(), Fulfillment::Unknown);
    }

    #[test]
    fn test_result_accepts_string_ids_and_null() {
        let result: FulfillmentCheckResult = serde_json::from_value(json!({
            "kpiDefinitionID": "4",
            "sdInstanceID": 9,
            "fulfilled": null
        }))
        .unwrap();
        assert_eq!(result, FulfillmentCheckResult::new(4, 9, None));
    }

    #[test]
    fn test_instance_deserialize() {
        let instance: SdInstance = serde_json::from_value(json!({
            "id": "1",
            "uid": "dev-a",
            "userIdentifier": "Boiler A",
            "confirmedByUser": true,
            "type": { "id": "2" },
            "parameterSnapshots": [
                { "parameterID": 5, "value": 21.5 },
                { "parameterID": 6, "value": "on" },
                { "parameterID": 7, "value": null }
            ]
        }))
        .unwrap();
        assert_eq!(instance.sd_type.id, 2);
        let snapshots = instance.snapshot_map();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots.get(&5), Some(&ParameterValue::Number(21.5)));
        assert_eq!(snapshots.get(&6), Some(&ParameterValue::String("on".to_string())));
    }

    #[test]
    fn test_definition_deserialize_without_id() {
        let definition: KpiDefinition = serde_json::from_value(json!({
            "userIdentifier": "Temperature OK",
            "sdTypeID": 2,
            "sdTypeSpecification": "boiler",
            "sdInstanceMode": "SELECTED",
            "selectedSDInstanceUIDs": ["dev-a"],
            "nodes": [
                { "id": "1", "nodeType": "NumericLTAtom", "sdParameterID": "5",
                  "sdParameterSpecification": "temperature", "numericReferenceValue": 80 }
            ]
        }))
        .unwrap();
        assert!(definition.id.is_none());
        assert_eq!(definition.sd_instance_mode, SdInstanceMode::Selected);
        assert_eq!(definition.nodes.len(), 1);
        assert!(definition.tree().is_ok());
    }

    #[test]
    fn test_prepared_for_submission_renumbers() {
        let definition: KpiDefinition = serde_json::from_value(json!({
            "userIdentifier": "Either",
            "sdTypeID": 2,
            "sdTypeSpecification": "boiler",
            "selectedSDInstanceUIDs": ["b", "a", "b"],
            "nodes": [
                { "id": 7, "nodeType": "BooleanEQAtom", "parentNodeID": 40, "sdParameterID": 6,
                  "sdParameterSpecification": "running", "booleanReferenceValue": true },
                { "id": 40, "nodeType": "LogicalOperation", "type": "OR" },
                { "id": 9, "nodeType": "NumericLTAtom", "parentNodeID": 40, "sdParameterID": 5,
                  "sdParameterSpecification": "temperature", "numericReferenceValue": 80 }
            ]
        }))
        .unwrap();
        let prepared = definition.prepared_for_submission().unwrap();
        let ids: Vec<(u32, Option<u32>)> = prepared
            .nodes
            .iter()
            .map(|n| (n.id, n.parent_node_id))
            .collect();
        assert_eq!(ids, vec![(1, None), (2, Some(1)), (3, Some(1))]);
        assert_eq!(prepared.nodes[1].sd_parameter_id, Some(6));
        assert_eq!(prepared.selected_sd_instance_uids, vec!["a", "b"]);
    }

    #[test]
    fn test_prepared_for_submission_rejects_empty_logical_node() {
        let definition = KpiDefinition {
            id: None,
            user_identifier: "Empty".to_string(),
            sd_type_id: 1,
            sd_type_specification: "t".to_string(),
            sd_instance_mode: SdInstanceMode::All,
            selected_sd_instance_uids: Vec::new(),
            nodes: vec![FlatNode::logical(1, None, LogicalOperationType::And)],
        };
        assert_eq!(
            definition.prepared_for_submission().unwrap_err(),
            crate::error::KpiError::IncompleteTree { node_ids: vec![1] }
        );
    }

    #[test]
    fn test_sd_instance_mode_from_str() {
        assert_eq!("all".parse::<SdInstanceMode>().unwrap(), SdInstanceMode::All);
        assert_eq!(
            "SELECTED".parse::<SdInstanceMode>().unwrap(),
            SdInstanceMode::Selected
        );
        assert!("some".parse::<SdInstanceMode>().is_err());
    }

    #[test]
    fn test_parameter_type_accepts_lowercase() {
        let t: ParameterType = serde_json::from_value(json!("number")).unwrap();
        assert_eq!(t, ParameterType::Number);
        assert_eq!(serde_json::to_value(ParameterType::Boolean).unwrap(), json!("BOOLEAN"));
    }
}
