//! KPI node types: the persisted flat record and its typed counterpart.

use std::convert::TryFrom;

use serde::{Deserialize, Serialize};

use super::ids::{de_id, de_opt_id};
use super::ParameterType;
use crate::error::KpiError;

/// Discriminator of a persisted KPI node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KpiNodeType {
    /// AND / OR / NOR over child nodes.
    LogicalOperation,
    /// Boolean equality atom.
    #[serde(rename = "BooleanEQAtom")]
    BooleanEqAtom,
    /// Numeric equality atom.
    #[serde(rename = "NumericEQAtom")]
    NumericEqAtom,
    /// Numeric greater-than atom.
    #[serde(rename = "NumericGTAtom")]
    NumericGtAtom,
    /// Numeric greater-or-equal atom.
    #[serde(rename = "NumericGEQAtom")]
    NumericGeqAtom,
    /// Numeric less-than atom.
    #[serde(rename = "NumericLTAtom")]
    NumericLtAtom,
    /// Numeric less-or-equal atom.
    #[serde(rename = "NumericLEQAtom")]
    NumericLeqAtom,
    /// String equality atom.
    #[serde(rename = "StringEQAtom")]
    StringEqAtom,
}

impl KpiNodeType {
    /// Wire name of the node type.
    pub fn as_str(&self) -> &'static str {
        match self {
            KpiNodeType::LogicalOperation => "LogicalOperation",
            KpiNodeType::BooleanEqAtom => "BooleanEQAtom",
            KpiNodeType::NumericEqAtom => "NumericEQAtom",
            KpiNodeType::NumericGtAtom => "NumericGTAtom",
            KpiNodeType::NumericGeqAtom => "NumericGEQAtom",
            KpiNodeType::NumericLtAtom => "NumericLTAtom",
            KpiNodeType::NumericLeqAtom => "NumericLEQAtom",
            KpiNodeType::StringEqAtom => "StringEQAtom",
        }
    }
}

impl std::fmt::Display for KpiNodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for KpiNodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LogicalOperation" => Ok(KpiNodeType::LogicalOperation),
            "BooleanEQAtom" => Ok(KpiNodeType::BooleanEqAtom),
            "NumericEQAtom" => Ok(KpiNodeType::NumericEqAtom),
            "NumericGTAtom" => Ok(KpiNodeType::NumericGtAtom),
            "NumericGEQAtom" => Ok(KpiNodeType::NumericGeqAtom),
            "NumericLTAtom" => Ok(KpiNodeType::NumericLtAtom),
            "NumericLEQAtom" => Ok(KpiNodeType::NumericLeqAtom),
            "StringEQAtom" => Ok(KpiNodeType::StringEqAtom),
            _ => Err(format!("Unknown KPI node type: {}", s)),
        }
    }
}

/// Logical operator of a logical operation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperationType {
    /// All children fulfilled.
    And,
    /// At least one child fulfilled.
    Or,
    /// No child fulfilled.
    Nor,
}

impl LogicalOperationType {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalOperationType::And => "AND",
            LogicalOperationType::Or => "OR",
            LogicalOperationType::Nor => "NOR",
        }
    }
}

impl std::fmt::Display for LogicalOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogicalOperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AND" => Ok(LogicalOperationType::And),
            "OR" => Ok(LogicalOperationType::Or),
            "NOR" => Ok(LogicalOperationType::Nor),
            _ => Err(format!("Unknown logical operation type: {}", s)),
        }
    }
}

/// Relation and typed reference value of an atom.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomCondition {
    /// `value == reference` for booleans.
    BooleanEq(bool),
    /// `value == reference` for numbers.
    NumericEq(f64),
    /// `value > reference`.
    NumericGt(f64),
    /// `value >= reference`.
    NumericGeq(f64),
    /// `value < reference`.
    NumericLt(f64),
    /// `value <= reference`.
    NumericLeq(f64),
    /// `value == reference` for strings.
    StringEq(String),
}

impl AtomCondition {
    /// Persisted node type of this condition.
    pub fn node_type(&self) -> KpiNodeType {
        match self {
            AtomCondition::BooleanEq(_) => KpiNodeType::BooleanEqAtom,
            AtomCondition::NumericEq(_) => KpiNodeType::NumericEqAtom,
            AtomCondition::NumericGt(_) => KpiNodeType::NumericGtAtom,
            AtomCondition::NumericGeq(_) => KpiNodeType::NumericGeqAtom,
            AtomCondition::NumericLt(_) => KpiNodeType::NumericLtAtom,
            AtomCondition::NumericLeq(_) => KpiNodeType::NumericLeqAtom,
            AtomCondition::StringEq(_) => KpiNodeType::StringEqAtom,
        }
    }

    /// Type of the reference value.
    pub fn reference_type(&self) -> ParameterType {
        match self {
            AtomCondition::BooleanEq(_) => ParameterType::Boolean,
            AtomCondition::StringEq(_) => ParameterType::String,
            AtomCondition::NumericEq(_)
            | AtomCondition::NumericGt(_)
            | AtomCondition::NumericGeq(_)
            | AtomCondition::NumericLt(_)
            | AtomCondition::NumericLeq(_) => ParameterType::Number,
        }
    }
}

/// Leaf comparison of one device-type parameter against a reference value.
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    /// Compared parameter.
    pub sd_parameter_id: u32,
    /// Denotation of the compared parameter.
    pub sd_parameter_specification: String,
    /// Relation and reference value.
    pub condition: AtomCondition,
}

impl Atom {
    /// Create an atom.
    pub fn new(
        sd_parameter_id: u32,
        sd_parameter_specification: impl Into<String>,
        condition: AtomCondition,
    ) -> Self {
        Self {
            sd_parameter_id,
            sd_parameter_specification: sd_parameter_specification.into(),
            condition,
        }
    }
}

/// Content of a node without its children.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Logical operation over children.
    LogicalOperation(LogicalOperationType),
    /// Atomic comparison.
    Atom(Atom),
    /// Incomplete node created while editing; never persisted.
    Placeholder,
}

impl NodeKind {
    /// Whether this kind can hold children.
    pub fn is_logical(&self) -> bool {
        matches!(self, NodeKind::LogicalOperation(_))
    }
}

/// A KPI node in the persisted parent-pointer format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatNode {
    /// Node identifier, unique within the definition.
    #[serde(deserialize_with = "de_id")]
    pub id: u32,
    /// Variant discriminator.
    pub node_type: KpiNodeType,
    /// Parent node; `None` for the root.
    #[serde(
        rename = "parentNodeID",
        default,
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_node_id: Option<u32>,
    /// Operator of a logical node.
    #[serde(
        rename = "type",
        alias = "logicalOperationType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub logical_operation_type: Option<LogicalOperationType>,
    /// Parameter compared by an atom.
    #[serde(
        rename = "sdParameterID",
        default,
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub sd_parameter_id: Option<u32>,
    /// Denotation of the compared parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sd_parameter_specification: Option<String>,
    /// Reference value of a boolean atom.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boolean_reference_value: Option<bool>,
    /// Reference value of a numeric atom.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_reference_value: Option<f64>,
    /// Reference value of a string atom.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_reference_value: Option<String>,
}

impl FlatNode {
    /// Create a logical operation record.
    pub fn logical(id: u32, parent_node_id: Option<u32>, operation: LogicalOperationType) -> Self {
        Self {
            id,
            node_type: KpiNodeType::LogicalOperation,
            parent_node_id,
            logical_operation_type: Some(operation),
            sd_parameter_id: None,
            sd_parameter_specification: None,
            boolean_reference_value: None,
            numeric_reference_value: None,
            string_reference_value: None,
        }
    }

    /// Create an atom record.
    pub fn atom(id: u32, parent_node_id: Option<u32>, atom: &Atom) -> Self {
        let mut node = Self {
            id,
            node_type: atom.condition.node_type(),
            parent_node_id,
            logical_operation_type: None,
            sd_parameter_id: Some(atom.sd_parameter_id),
            sd_parameter_specification: Some(atom.sd_parameter_specification.clone()),
            boolean_reference_value: None,
            numeric_reference_value: None,
            string_reference_value: None,
        };
        match &atom.condition {
            AtomCondition::BooleanEq(v) => node.boolean_reference_value = Some(*v),
            AtomCondition::StringEq(v) => node.string_reference_value = Some(v.clone()),
            AtomCondition::NumericEq(v)
            | AtomCondition::NumericGt(v)
            | AtomCondition::NumericGeq(v)
            | AtomCondition::NumericLt(v)
            | AtomCondition::NumericLeq(v) => node.numeric_reference_value = Some(*v),
        }
        node
    }

    /// Build the record for a typed node; placeholders have no persisted form.
    pub fn from_kind(id: u32, parent_node_id: Option<u32>, kind: &NodeKind) -> Option<Self> {
        match kind {
            NodeKind::LogicalOperation(op) => Some(Self::logical(id, parent_node_id, *op)),
            NodeKind::Atom(atom) => Some(Self::atom(id, parent_node_id, atom)),
            NodeKind::Placeholder => None,
        }
    }

    fn missing(&self, property: &str) -> KpiError {
        KpiError::InvalidAtom {
            node_id: self.id,
            message: format!("{} node is missing '{}'", self.node_type, property),
        }
    }
}

impl TryFrom<&FlatNode> for NodeKind {
    type Error = KpiError;

    fn try_from(node: &FlatNode) -> Result<Self, Self::Error> {
        let numeric = || {
            node.numeric_reference_value
                .ok_or_else(|| node.missing("numericReferenceValue"))
        };

        let condition = match node.node_type {
            KpiNodeType::LogicalOperation => {
                let op = node
                    .logical_operation_type
                    .ok_or_else(|| node.missing("type"))?;
                return Ok(NodeKind::LogicalOperation(op));
            }
            KpiNodeType::BooleanEqAtom => AtomCondition::BooleanEq(
                node.boolean_reference_value
                    .ok_or_else(|| node.missing("booleanReferenceValue"))?,
            ),
            KpiNodeType::StringEqAtom => AtomCondition::StringEq(
                node.string_reference_value
                    .clone()
                    .ok_or_else(|| node.missing("stringReferenceValue"))?,
            ),
            KpiNodeType::NumericEqAtom => AtomCondition::NumericEq(numeric()?),
            KpiNodeType::NumericGtAtom => AtomCondition::NumericGt(numeric()?),
            KpiNodeType::NumericGeqAtom => AtomCondition::NumericGeq(numeric()?),
            KpiNodeType::NumericLtAtom => AtomCondition::NumericLt(numeric()?),
            KpiNodeType::NumericLeqAtom => AtomCondition::NumericLeq(numeric()?),
        };

        let sd_parameter_id = node
            .sd_parameter_id
            .ok_or_else(|| node.missing("sdParameterID"))?;
        let sd_parameter_specification = node
            .sd_parameter_specification
            .clone()
            .ok_or_else(|| node.missing("sdParameterSpecification"))?;

        Ok(NodeKind::Atom(Atom {
            sd_parameter_id,
            sd_parameter_specification,
            condition,
        }))
    }
}
