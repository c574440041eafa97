//! Tri-state evaluation of a full KPI tree.

use crate::model::{Fulfillment, KpiTree, LogicalOperationType, NodeContent, SnapshotMap, TreeNode};

use super::atom::evaluate_atom;

/// Combine child results under a logical operator.
///
/// - AND: any Unfulfilled wins, else any Unknown, else Fulfilled.
/// - OR: any Fulfilled wins, else any Unknown, else Unfulfilled.
/// - NOR: the negation of OR; Fulfilled only when every child is Unfulfilled.
///
/// An empty child list is Unknown for every operator.
pub fn combine<I>(operation: LogicalOperationType, children: I) -> Fulfillment
where
    I: IntoIterator<Item = Fulfillment>,
{
    let mut any_fulfilled = false;
    let mut any_unfulfilled = false;
    let mut any_unknown = false;
    let mut count = 0usize;
    for child in children {
        count += 1;
        match child {
            Fulfillment::Fulfilled => any_fulfilled = true,
            Fulfillment::Unfulfilled => any_unfulfilled = true,
            Fulfillment::Unknown => any_unknown = true,
        }
    }
    if count == 0 {
        return Fulfillment::Unknown;
    }

    let or = if any_fulfilled {
        Fulfillment::Fulfilled
    } else if any_unknown {
        Fulfillment::Unknown
    } else {
        Fulfillment::Unfulfilled
    };

    match operation {
        LogicalOperationType::And => {
            if any_unfulfilled {
                Fulfillment::Unfulfilled
            } else if any_unknown {
                Fulfillment::Unknown
            } else {
                Fulfillment::Fulfilled
            }
        }
        LogicalOperationType::Or => or,
        LogicalOperationType::Nor => or.negate(),
    }
}

/// Evaluate one node and its subtree (post-order).
pub fn evaluate_node(node: &TreeNode, snapshots: &SnapshotMap) -> Fulfillment {
    match &node.content {
        NodeContent::Atom(atom) => evaluate_atom(atom, snapshots.get(&atom.sd_parameter_id)),
        NodeContent::LogicalOperation {
            operation,
            children,
        } => {
            // Placeholders carry no condition and are not part of the expression.
            let results: Vec<Fulfillment> = children
                .iter()
                .filter(|child| !child.is_placeholder())
                .map(|child| evaluate_node(child, snapshots))
                .collect();
            combine(*operation, results)
        }
        NodeContent::Placeholder => Fulfillment::Unknown,
    }
}

/// Evaluate a KPI tree for one instance's parameter values.
pub fn evaluate_tree(tree: &KpiTree, snapshots: &SnapshotMap) -> Fulfillment {
    evaluate_node(tree.root(), snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Atom, AtomCondition, FlatNode, NodeKind, ParameterValue};
    use Fulfillment::{Fulfilled, Unfulfilled, Unknown};
    use LogicalOperationType::{And, Nor, Or};

    #[test]
    fn test_and_table() {
        assert_eq!(combine(And, [Unfulfilled, Unknown]), Unfulfilled);
        assert_eq!(combine(And, [Fulfilled, Unknown]), Unknown);
        assert_eq!(combine(And, [Fulfilled, Fulfilled]), Fulfilled);
        assert_eq!(combine(And, [Fulfilled, Unfulfilled]), Unfulfilled);
    }

    #[test]
    fn test_or_table() {
        assert_eq!(combine(Or, [Fulfilled, Unknown]), Fulfilled);
        assert_eq!(combine(Or, [Unfulfilled, Unknown]), Unknown);
        assert_eq!(combine(Or, [Unfulfilled, Unfulfilled]), Unfulfilled);
    }

    #[test]
    fn test_nor_table() {
        assert_eq!(combine(Nor, [Unfulfilled, Unfulfilled]), Fulfilled);
        assert_eq!(combine(Nor, [Fulfilled, Unfulfilled]), Unfulfilled);
        assert_eq!(combine(Nor, [Unfulfilled, Unknown]), Unknown);
        assert_eq!(combine(Nor, [Fulfilled, Unknown]), Unfulfilled);
    }

    #[test]
    fn test_empty_children_are_unknown() {
        for op in [And, Or, Nor] {
            assert_eq!(combine(op, []), Unknown);
        }
    }

    fn snapshots(values: &[(u32, ParameterValue)]) -> SnapshotMap {
        values.iter().cloned().collect()
    }

    /// NOR(1) -> [ temperature > 90 (2), AND(3) -> [ running == false (4), mode == "off" (5) ] ]
    fn alarm_tree() -> KpiTree {
        KpiTree::build(&[
            FlatNode::logical(1, None, Nor),
            FlatNode::atom(2, Some(1), &Atom::new(10, "temperature", AtomCondition::NumericGt(90.0))),
            FlatNode::logical(3, Some(1), And),
            FlatNode::atom(4, Some(3), &Atom::new(11, "running", AtomCondition::BooleanEq(false))),
            FlatNode::atom(
                5,
                Some(3),
                &Atom::new(12, "mode", AtomCondition::StringEq("off".to_string())),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_nested_tree_evaluation() {
        let tree = alarm_tree();
        let healthy = snapshots(&[
            (10, ParameterValue::Number(60.0)),
            (11, ParameterValue::Boolean(true)),
            (12, ParameterValue::String("eco".to_string())),
        ]);
        assert_eq!(evaluate_tree(&tree, &healthy), Fulfilled);

        let overheated = snapshots(&[
            (10, ParameterValue::Number(95.0)),
            (11, ParameterValue::Boolean(true)),
        ]);
        assert_eq!(evaluate_tree(&tree, &overheated), Unfulfilled);
    }

    #[test]
    fn test_missing_telemetry_degrades_to_unknown() {
        let tree = alarm_tree();
        // AND(3) is Unknown because running is absent and mode matches; NOR sees
        // [Unfulfilled, Unknown].
        let partial = snapshots(&[
            (10, ParameterValue::Number(20.0)),
            (12, ParameterValue::String("off".to_string())),
        ]);
        assert_eq!(evaluate_tree(&tree, &partial), Unknown);
        assert_eq!(evaluate_tree(&tree, &SnapshotMap::new()), Unknown);
    }

    #[test]
    fn test_placeholders_are_ignored_by_parent() {
        let tree = KpiTree::placeholder_root()
            .fill_placeholder(1, NodeKind::LogicalOperation(And))
            .unwrap()
            .fill_placeholder(
                2,
                NodeKind::Atom(Atom::new(11, "running", AtomCondition::BooleanEq(true))),
            )
            .unwrap();
        let values = snapshots(&[(11, ParameterValue::Boolean(true))]);
        assert_eq!(evaluate_tree(&tree, &values), Fulfilled);
    }

    #[test]
    fn test_placeholder_root_is_unknown() {
        assert_eq!(
            evaluate_tree(&KpiTree::placeholder_root(), &SnapshotMap::new()),
            Unknown
        );
    }
}
