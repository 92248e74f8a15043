//! Collapse of constructor-delegation artifacts in invocation trees.
//!
//! Every class in a throwable's inheritance chain has an instrumented
//! constructor, so one logical construction shows up as N sibling CREATED
//! events sharing an identity hash. The reducer keeps the last (most
//! derived) event, strips the duplicates, and removes siblings that exist
//! only because of the delegation.

use crate::record::{ExceptionEvent, ExceptionEventKind, GlobalId};

/// Index of a node inside an [`InvocationTree`] arena.
pub type NodeId = usize;

/// One invocation frame captured on the collector side.
#[derive(Debug, Clone)]
pub struct InvocationNode {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Aggregate count of invocations in this subtree, self included.
    pub child_count: u64,
    pub sensor_type: GlobalId,
    pub duration_ms: Option<f64>,
    pub sql_statement: Option<String>,
    pub exception: Option<ExceptionEvent>,
}

impl InvocationNode {
    fn new(parent: Option<NodeId>, sensor_type: GlobalId) -> Self {
        Self {
            parent,
            children: Vec::new(),
            child_count: 1,
            sensor_type,
            duration_ms: None,
            sql_statement: None,
            exception: None,
        }
    }

    /// Whether this node carries anything besides the delegation artifact.
    fn has_other_telemetry(&self) -> bool {
        self.duration_ms.is_some() || self.sql_statement.is_some() || self.exception.is_some()
    }
}

/// Arena-backed invocation tree. Removal detaches a node from its parent's
/// child list; the arena slot itself is retired in place.
#[derive(Debug, Default)]
pub struct InvocationTree {
    nodes: Vec<Option<InvocationNode>>,
    root: Option<NodeId>,
}

impl InvocationTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, sensor_type: GlobalId) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Some(InvocationNode::new(None, sensor_type)));
        self.root = Some(id);
        id
    }

    /// Appends a child under `parent`, bumping the aggregate count of every
    /// ancestor up to the root.
    pub fn add_child(&mut self, parent: NodeId, sensor_type: GlobalId) -> NodeId {
        let id = self.nodes.len();
        self.nodes
            .push(Some(InvocationNode::new(Some(parent), sensor_type)));
        if let Some(node) = self.node_mut(parent) {
            node.children.push(id);
        }
        self.adjust_ancestor_counts(parent, 1);
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&InvocationNode> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut InvocationNode> {
        self.nodes.get_mut(id).and_then(|n| n.as_mut())
    }

    pub fn set_duration(&mut self, id: NodeId, duration_ms: f64) {
        if let Some(node) = self.node_mut(id) {
            node.duration_ms = Some(duration_ms);
        }
    }

    pub fn set_sql(&mut self, id: NodeId, statement: impl Into<String>) {
        if let Some(node) = self.node_mut(id) {
            node.sql_statement = Some(statement.into());
        }
    }

    pub fn attach_exception(&mut self, id: NodeId, event: ExceptionEvent) {
        if let Some(node) = self.node_mut(id) {
            node.exception = Some(event);
        }
    }

    pub fn child_count(&self, id: NodeId) -> u64 {
        self.node(id).map(|n| n.child_count).unwrap_or(0)
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id).map(|n| n.children.clone()).unwrap_or_default()
    }

    /// Detaches `id` from its parent and retires its arena slot. Counts of
    /// every ancestor shrink by the removed subtree's aggregate count.
    fn remove(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(id).and_then(Option::take) else {
            return;
        };
        if let Some(parent) = node.parent {
            if let Some(p) = self.node_mut(parent) {
                p.children.retain(|&c| c != id);
            }
            self.adjust_ancestor_counts(parent, -(node.child_count as i64));
        }
    }

    fn adjust_ancestor_counts(&mut self, from: NodeId, delta: i64) {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let Some(node) = self.node_mut(id) else {
                break;
            };
            node.child_count = (node.child_count as i64 + delta).max(0) as u64;
            cursor = node.parent;
        }
    }
}

/// Collapses duplicate creation events under one parent node.
pub struct ConstructorDelegationReducer;

impl ConstructorDelegationReducer {
    /// Reduces delegation artifacts for `identity_hash` among the direct
    /// children of `parent`.
    ///
    /// The last child carrying a creation-semantics event of that identity
    /// is canonical; earlier matches lose their exception payload, and the
    /// siblings directly preceding the canonical node are removed entirely
    /// while they share its sensor type and carry no other telemetry.
    /// Returns the canonical event for downstream forwarding.
    pub fn reduce(
        tree: &mut InvocationTree,
        parent: NodeId,
        identity_hash: u64,
    ) -> Option<ExceptionEvent> {
        let children = tree.children(parent);

        let mut canonical: Option<usize> = None;
        for (pos, &child) in children.iter().enumerate() {
            if Self::carries_creation(tree, child, identity_hash) {
                if let Some(previous) = canonical.replace(pos) {
                    if let Some(node) = tree.node_mut(children[previous]) {
                        node.exception = None;
                    }
                }
            }
        }

        let canonical_pos = canonical?;
        let canonical_id = children[canonical_pos];
        let canonical_sensor_type = tree.node(canonical_id)?.sensor_type;
        let event = tree.node(canonical_id)?.exception.clone();

        // Pure delegation noise sits immediately before the canonical node.
        for &sibling in children[..canonical_pos].iter().rev() {
            let removable = tree
                .node(sibling)
                .map(|n| n.sensor_type == canonical_sensor_type && !n.has_other_telemetry())
                .unwrap_or(false);
            if !removable {
                break;
            }
            tree.remove(sibling);
        }

        event
    }

    fn carries_creation(tree: &InvocationTree, node: NodeId, identity_hash: u64) -> bool {
        tree.node(node)
            .and_then(|n| n.exception.as_ref())
            .map(|e| {
                e.identity_hash == identity_hash
                    && matches!(
                        e.kind,
                        ExceptionEventKind::Created | ExceptionEventKind::UnregisteredPassed
                    )
            })
            .unwrap_or(false)
    }
}
