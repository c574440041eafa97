//! Addressable KPI expression tree.
//!
//! A [`KpiTree`] is built from the flat parent-pointer node list of a KPI
//! definition and flattened back without loss. Structural edits never mutate
//! in place; every edit returns a new tree.
//!
//! Placeholders mark nodes a user has created but not yet filled in. They are
//! dropped by [`KpiTree::flatten`], so a logical node whose only children are
//! placeholders becomes empty and blocks submission.

use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;

use super::node::{Atom, FlatNode, LogicalOperationType, NodeKind};
use super::SdType;
use crate::error::{KpiError, KpiResult, MalformedTreeReason};

/// Deepest tree accepted, counting the root as level 1.
///
/// Tree walks recurse once per level, so deeper input is rejected as
/// malformed instead of being built.
pub const MAX_TREE_DEPTH: usize = 128;

#[cfg(test)]
#[path = "tree_tests.rs"]
mod tree_tests;

/// Content of a tree node, including children for logical nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeContent {
    /// Logical operation over child nodes.
    LogicalOperation {
        /// Operator.
        operation: LogicalOperationType,
        /// Child nodes in definition order.
        children: Vec<TreeNode>,
    },
    /// Atomic comparison leaf.
    Atom(Atom),
    /// Incomplete node awaiting a type.
    Placeholder,
}

impl From<NodeKind> for NodeContent {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::LogicalOperation(operation) => NodeContent::LogicalOperation {
                operation,
                children: Vec::new(),
            },
            NodeKind::Atom(atom) => NodeContent::Atom(atom),
            NodeKind::Placeholder => NodeContent::Placeholder,
        }
    }
}

/// A node of the KPI expression tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    /// Node identifier, unique within the tree.
    pub id: u32,
    /// Node content.
    pub content: NodeContent,
}

impl TreeNode {
    /// Create a childless node.
    pub fn new(id: u32, kind: NodeKind) -> Self {
        Self {
            id,
            content: kind.into(),
        }
    }

    /// Create a logical node with children.
    pub fn logical(id: u32, operation: LogicalOperationType, children: Vec<TreeNode>) -> Self {
        Self {
            id,
            content: NodeContent::LogicalOperation {
                operation,
                children,
            },
        }
    }

    /// Create an atom leaf.
    pub fn atom(id: u32, atom: Atom) -> Self {
        Self {
            id,
            content: NodeContent::Atom(atom),
        }
    }

    /// Create a placeholder leaf.
    pub fn placeholder(id: u32) -> Self {
        Self {
            id,
            content: NodeContent::Placeholder,
        }
    }

    /// Child nodes (empty for leaves).
    pub fn children(&self) -> &[TreeNode] {
        match &self.content {
            NodeContent::LogicalOperation { children, .. } => children,
            _ => &[],
        }
    }

    /// Whether this node is a placeholder.
    pub fn is_placeholder(&self) -> bool {
        matches!(self.content, NodeContent::Placeholder)
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a TreeNode)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    fn find_mut(&mut self, id: u32) -> Option<&mut TreeNode> {
        if self.id == id {
            return Some(self);
        }
        match &mut self.content {
            NodeContent::LogicalOperation { children, .. } => {
                children.iter_mut().find_map(|child| child.find_mut(id))
            }
            _ => None,
        }
    }

    fn parent_of(&self, id: u32) -> Option<u32> {
        self.children().iter().find_map(|child| {
            if child.id == id {
                Some(self.id)
            } else {
                child.parent_of(id)
            }
        })
    }

    fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 1)];
        while let Some((node, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            stack.extend(node.children().iter().map(|child| (child, depth + 1)));
        }
        deepest
    }
}

/// KPI expression tree with a single root.
#[derive(Debug, Clone, PartialEq)]
pub struct KpiTree {
    root: TreeNode,
}

impl KpiTree {
    /// Create a tree from an assembled root, rejecting duplicate node ids and
    /// trees deeper than [`MAX_TREE_DEPTH`].
    pub fn new(root: TreeNode) -> KpiResult<Self> {
        if root.depth() > MAX_TREE_DEPTH {
            return Err(KpiError::malformed(MalformedTreeReason::TooDeep {
                limit: MAX_TREE_DEPTH,
            }));
        }

        let mut seen = HashSet::new();
        let mut duplicate = None;
        root.visit(&mut |node| {
            if !seen.insert(node.id) && duplicate.is_none() {
                duplicate = Some(node.id);
            }
        });
        match duplicate {
            Some(id) => Err(KpiError::malformed(MalformedTreeReason::DuplicateId(id))),
            None => Ok(Self { root }),
        }
    }

    /// Initial state of a definition being created: a lone placeholder root.
    pub fn placeholder_root() -> Self {
        Self {
            root: TreeNode::placeholder(1),
        }
    }

    /// Build a tree from a flat parent-pointer node list.
    ///
    /// # Errors
    /// Returns [`KpiError::MalformedTree`] when the list has no root or more
    /// than one, a dangling or non-logical parent, a duplicate id, or a cycle;
    /// [`KpiError::InvalidAtom`] when a record lacks its variant fields.
    pub fn build(nodes: &[FlatNode]) -> KpiResult<Self> {
        let mut kinds: HashMap<u32, NodeKind> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let kind = NodeKind::try_from(node)?;
            if kinds.insert(node.id, kind).is_some() {
                return Err(KpiError::malformed(MalformedTreeReason::DuplicateId(
                    node.id,
                )));
            }
        }

        let mut roots = Vec::new();
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for node in nodes {
            match node.parent_node_id {
                None => roots.push(node.id),
                Some(parent_id) => {
                    let parent = kinds.get(&parent_id).ok_or_else(|| {
                        KpiError::malformed(MalformedTreeReason::DanglingParent {
                            node_id: node.id,
                            parent_id,
                        })
                    })?;
                    if !parent.is_logical() {
                        return Err(KpiError::malformed(
                            MalformedTreeReason::AtomWithChildren(parent_id),
                        ));
                    }
                    children.entry(parent_id).or_default().push(node.id);
                }
            }
        }

        let root_id = match roots.len() {
            1 => roots[0],
            0 if nodes.is_empty() => {
                return Err(KpiError::malformed(MalformedTreeReason::NoRoot));
            }
            // Every node has a parent, so at least one cycle exists.
            0 => {
                let first = nodes.iter().map(|n| n.id).min().unwrap_or_default();
                return Err(KpiError::malformed(MalformedTreeReason::Cycle(first)));
            }
            _ => {
                roots.sort_unstable();
                return Err(KpiError::malformed(MalformedTreeReason::MultipleRoots(
                    roots,
                )));
            }
        };

        // Nodes unreachable from the single root can only sit on a cycle.
        let mut reached = HashSet::with_capacity(kinds.len());
        let mut stack = vec![(root_id, 1)];
        while let Some((id, depth)) = stack.pop() {
            if depth > MAX_TREE_DEPTH {
                return Err(KpiError::malformed(MalformedTreeReason::TooDeep {
                    limit: MAX_TREE_DEPTH,
                }));
            }
            if reached.insert(id) {
                if let Some(ids) = children.get(&id) {
                    stack.extend(ids.iter().map(|child_id| (*child_id, depth + 1)));
                }
            }
        }
        if reached.len() != kinds.len() {
            let first = kinds
                .keys()
                .filter(|id| !reached.contains(id))
                .min()
                .copied()
                .unwrap_or(root_id);
            return Err(KpiError::malformed(MalformedTreeReason::Cycle(first)));
        }

        let root = assemble(root_id, &mut kinds, &children)?;
        Ok(Self { root })
    }

    /// Root node.
    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    /// Flatten into the persisted parent-pointer format (pre-order).
    ///
    /// Placeholders have no persisted form and are skipped.
    pub fn flatten(&self) -> Vec<FlatNode> {
        let mut out = Vec::new();
        flatten_into(&self.root, None, &mut out);
        out
    }

    /// Find a node by id.
    pub fn find(&self, id: u32) -> Option<&TreeNode> {
        let mut found = None;
        self.root.visit(&mut |node| {
            if node.id == id && found.is_none() {
                found = Some(node);
            }
        });
        found
    }

    /// Id of the parent of `id`, `None` for the root or unknown ids.
    pub fn parent_of(&self, id: u32) -> Option<u32> {
        self.root.parent_of(id)
    }

    /// Number of nodes, placeholders included.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.root.visit(&mut |_| count += 1);
        count
    }

    /// Length of the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        self.root.depth()
    }

    /// Smallest id not used by any node.
    pub fn next_node_id(&self) -> u32 {
        let mut max = 0;
        self.root.visit(&mut |node| max = max.max(node.id));
        max + 1
    }

    /// All atoms with their node ids, in pre-order.
    pub fn atoms(&self) -> Vec<(u32, &Atom)> {
        let mut atoms = Vec::new();
        self.root.visit(&mut |node| {
            if let NodeContent::Atom(atom) = &node.content {
                atoms.push((node.id, atom));
            }
        });
        atoms
    }

    /// Replace the content of one node.
    ///
    /// Children survive only when both the old and the new content are
    /// logical operations; any other conversion discards the subtree.
    pub fn replace_node(&self, node_id: u32, replacement: NodeKind) -> KpiResult<Self> {
        let mut tree = self.clone();
        let node = tree
            .root
            .find_mut(node_id)
            .ok_or(KpiError::NodeNotFound { node_id })?;

        let previous = std::mem::replace(&mut node.content, NodeContent::Placeholder);
        node.content = match (previous, replacement) {
            (
                NodeContent::LogicalOperation { children, .. },
                NodeKind::LogicalOperation(operation),
            ) => NodeContent::LogicalOperation {
                operation,
                children,
            },
            (_, replacement) => replacement.into(),
        };
        Ok(tree)
    }

    /// Append `child` (with its subtree) under the logical node `parent_id`.
    pub fn add_child(&self, parent_id: u32, child: TreeNode) -> KpiResult<Self> {
        let mut clash = None;
        child.visit(&mut |node| {
            if clash.is_none() && self.find(node.id).is_some() {
                clash = Some(node.id);
            }
        });
        if let Some(id) = clash {
            return Err(KpiError::malformed(MalformedTreeReason::DuplicateId(id)));
        }

        let mut tree = self.clone();
        let parent = tree
            .root
            .find_mut(parent_id)
            .ok_or(KpiError::NodeNotFound { node_id: parent_id })?;
        match &mut parent.content {
            NodeContent::LogicalOperation { children, .. } => children.push(child),
            _ => return Err(KpiError::NotALogicalNode { node_id: parent_id }),
        }
        // The child may itself contain duplicate ids.
        KpiTree::new(tree.root)
    }

    /// Give a placeholder its content, the way the editor does.
    ///
    /// A new logical node starts with one placeholder child, and the filled
    /// placeholder gets a fresh placeholder sibling so the user can keep
    /// adding nodes at that level.
    pub fn fill_placeholder(&self, node_id: u32, kind: NodeKind) -> KpiResult<Self> {
        match self.find(node_id) {
            None => return Err(KpiError::NodeNotFound { node_id }),
            Some(node) if !node.is_placeholder() => {
                return Err(KpiError::NotAPlaceholder { node_id })
            }
            Some(_) => {}
        }

        let mut next_id = self.next_node_id();
        let mut tree = self.clone();
        let parent_id = tree.parent_of(node_id);

        if let Some(node) = tree.root.find_mut(node_id) {
            node.content = match kind {
                NodeKind::LogicalOperation(operation) => {
                    let child = TreeNode::placeholder(next_id);
                    next_id += 1;
                    NodeContent::LogicalOperation {
                        operation,
                        children: vec![child],
                    }
                }
                other => other.into(),
            };
        }

        if let Some(parent_id) = parent_id {
            if let Some(parent) = tree.root.find_mut(parent_id) {
                if let NodeContent::LogicalOperation { children, .. } = &mut parent.content {
                    children.push(TreeNode::placeholder(next_id));
                }
            }
        }
        // A new logical node adds a level below it.
        KpiTree::new(tree.root)
    }

    /// Ids of nodes that block submission: a placeholder root and logical
    /// nodes without any non-placeholder child.
    pub fn incomplete_nodes(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        if self.root.is_placeholder() {
            ids.push(self.root.id);
        }
        self.root.visit(&mut |node| {
            if let NodeContent::LogicalOperation { children, .. } = &node.content {
                if children.iter().all(TreeNode::is_placeholder) {
                    ids.push(node.id);
                }
            }
        });
        ids.sort_unstable();
        ids
    }

    /// Check that the tree can be submitted.
    pub fn validate_for_submission(&self) -> KpiResult<()> {
        let node_ids = self.incomplete_nodes();
        if node_ids.is_empty() {
            Ok(())
        } else {
            Err(KpiError::IncompleteTree { node_ids })
        }
    }

    /// Validate and flatten for persistence, numbering nodes 1.. in pre-order.
    pub fn submission_nodes(&self) -> KpiResult<Vec<FlatNode>> {
        self.validate_for_submission()?;

        let flat = self.flatten();
        let renumber: HashMap<u32, u32> = flat
            .iter()
            .enumerate()
            .map(|(index, node)| (node.id, index as u32 + 1))
            .collect();

        Ok(flat
            .into_iter()
            .map(|mut node| {
                node.id = renumber[&node.id];
                node.parent_node_id = node.parent_node_id.map(|p| renumber[&p]);
                node
            })
            .collect())
    }

    /// Check every atom against the parameters declared by `sd_type`.
    ///
    /// # Errors
    /// Returns [`KpiError::InvalidAtom`] for the first atom that references an
    /// undeclared parameter or whose reference value type differs from the
    /// declared parameter type.
    pub fn check_parameters(&self, sd_type: &SdType) -> KpiResult<()> {
        for (node_id, atom) in self.atoms() {
            let parameter = sd_type.parameter(atom.sd_parameter_id).ok_or_else(|| {
                KpiError::InvalidAtom {
                    node_id,
                    message: format!(
                        "parameter {} ('{}') is not declared by SD type '{}'",
                        atom.sd_parameter_id, atom.sd_parameter_specification, sd_type.denotation
                    ),
                }
            })?;
            let expected = atom.condition.reference_type();
            if parameter.parameter_type != expected {
                return Err(KpiError::InvalidAtom {
                    node_id,
                    message: format!(
                        "{} compares parameter '{}' of type {} with a {} reference value",
                        atom.condition.node_type(),
                        parameter.denotation,
                        parameter.parameter_type,
                        expected
                    ),
                });
            }
        }
        Ok(())
    }
}

fn assemble(
    id: u32,
    kinds: &mut HashMap<u32, NodeKind>,
    children: &HashMap<u32, Vec<u32>>,
) -> KpiResult<TreeNode> {
    let kind = kinds
        .remove(&id)
        .ok_or_else(|| KpiError::malformed(MalformedTreeReason::Cycle(id)))?;
    let content = match kind {
        NodeKind::LogicalOperation(operation) => {
            let child_ids = children.get(&id).map(Vec::as_slice).unwrap_or(&[]);
            let children = child_ids
                .iter()
                .map(|child_id| assemble(*child_id, kinds, children))
                .collect::<KpiResult<Vec<_>>>()?;
            NodeContent::LogicalOperation {
                operation,
                children,
            }
        }
        other => other.into(),
    };
    Ok(TreeNode { id, content })
}

fn flatten_into(node: &TreeNode, parent: Option<u32>, out: &mut Vec<FlatNode>) {
    match &node.content {
        NodeContent::LogicalOperation {
            operation,
            children,
        } => {
            out.push(FlatNode::logical(node.id, parent, *operation));
            for child in children {
                flatten_into(child, Some(node.id), out);
            }
        }
        NodeContent::Atom(atom) => out.push(FlatNode::atom(node.id, parent, atom)),
        NodeContent::Placeholder => {}
    }
}
