//! Overlay tree scan
//!
//! Rebuilds the node hierarchy from the marker sequence in one pass with a
//! stack of open frames. Tombstones are scanned too: a removed begin marker
//! opens a pruned frame and every node inside it is unreachable, even when
//! its own markers are live.
//!
//! Concurrent placements around the same boundary can leave two pairs
//! interleaved (`b1 b2 e1 e2`). An end marker closes its own frame only, so
//! the second node stays open and keeps the first as its parent.

use super::placement::node_id_of_end;
use crate::merge_tree::{Replica, Segment};
use crate::ops::MarkerBehavior;
use crate::properties::{PropertySet, NODE_TYPE};
use std::collections::HashMap;
use std::fmt;

/// Whether the node's insert has been sequenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Local insert still awaiting acknowledgement
    Intent,
    Acknowledged,
}

/// One node of the overlay tree
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayNode {
    pub id: String,
    pub node_type: Option<String>,
    /// Display label, from the `label` user property
    pub label: Option<String>,
    pub state: NodeState,
    pub properties: PropertySet,
    parent: Option<usize>,
    children: Vec<usize>,
    depth: usize,
}

impl OverlayNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Distance from the top level (roots are at depth 0)
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Marker structure the scan could not match up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyWarning {
    /// End marker with no open begin marker for its node
    UnmatchedEnd { node_id: String },
    /// Begin marker never closed before the sequence ended
    UnclosedBegin { node_id: String },
    /// Range end marker whose id does not name a node
    MalformedEnd { marker_id: String },
}

impl fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyWarning::UnmatchedEnd { node_id } => {
                write!(f, "end marker of {} has no open begin", node_id)
            }
            ConsistencyWarning::UnclosedBegin { node_id } => {
                write!(f, "begin marker of {} is never closed", node_id)
            }
            ConsistencyWarning::MalformedEnd { marker_id } => {
                write!(f, "end marker {} does not name a node", marker_id)
            }
        }
    }
}

enum Frame<'a> {
    Live { id: &'a str, index: usize },
    Pruned { id: &'a str },
}

impl<'a> Frame<'a> {
    fn id(&self) -> &'a str {
        match self {
            Frame::Live { id, .. } | Frame::Pruned { id } => id,
        }
    }
}

/// Snapshot of the overlay hierarchy
///
/// # Example
///
/// ```rust
/// use mergetree_core::overlay::{insert_overlay_node, NodeState, OverlayNodePosition, OverlayTree};
/// use mergetree_core::{PropertySet, Replica};
///
/// let mut replica = Replica::new("A");
/// let mut props = PropertySet::new();
/// props.insert("label", "Docs");
/// let id = insert_overlay_node(&mut replica, "folder", OverlayNodePosition::Root, props, None).unwrap();
///
/// let tree = OverlayTree::build(&replica);
/// let node = tree.get(&id).unwrap();
/// assert_eq!(node.label.as_deref(), Some("Docs"));
/// assert_eq!(node.state, NodeState::Intent);
/// assert!(node.is_root() && node.is_leaf());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayTree {
    /// Nodes in document (pre-)order
    nodes: Vec<OverlayNode>,
    roots: Vec<usize>,
    index: HashMap<String, usize>,
    warnings: Vec<ConsistencyWarning>,
    pruned: usize,
}

impl OverlayTree {
    /// Scan a replica using its configured overlay label
    pub fn build(replica: &Replica) -> Self {
        Self::scan(replica.segments(), &replica.config().overlay_label)
    }

    /// Scan a segment sequence, recognising markers labelled `label`
    pub fn scan<'a>(segments: impl IntoIterator<Item = &'a Segment>, label: &str) -> Self {
        let mut tree = Self::default();
        let mut stack: Vec<Frame<'a>> = Vec::new();
        let mut pruned_depth = 0;

        for segment in segments {
            let Some(marker) = segment.as_marker() else {
                continue;
            };
            if !marker.has_label(label) {
                continue;
            }

            match marker.behavior {
                MarkerBehavior::RangeBegin => {
                    if segment.is_removed() || pruned_depth > 0 {
                        if !segment.is_removed() {
                            tree.pruned += 1;
                        }
                        stack.push(Frame::Pruned { id: &marker.id });
                        pruned_depth += 1;
                        continue;
                    }

                    let parent = match stack.last() {
                        Some(Frame::Live { index, .. }) => Some(*index),
                        _ => None,
                    };
                    let index = tree.push_node(segment, parent);
                    stack.push(Frame::Live {
                        id: &marker.id,
                        index,
                    });
                }
                MarkerBehavior::RangeEnd => {
                    let Some(node_id) = node_id_of_end(&marker.id) else {
                        if !segment.is_removed() {
                            tree.warn(ConsistencyWarning::MalformedEnd {
                                marker_id: marker.id.clone(),
                            });
                        }
                        continue;
                    };
                    let Some(at) = stack.iter().rposition(|frame| frame.id() == node_id) else {
                        if !segment.is_removed() {
                            tree.warn(ConsistencyWarning::UnmatchedEnd {
                                node_id: node_id.to_string(),
                            });
                        }
                        continue;
                    };

                    // Frames opened after this one stay open: concurrent
                    // placements can interleave two pairs
                    if let Frame::Pruned { .. } = stack.remove(at) {
                        pruned_depth -= 1;
                    }
                }
                MarkerBehavior::Simple => {}
            }
        }

        for frame in stack {
            if let Frame::Live { id, .. } = frame {
                tree.warn(ConsistencyWarning::UnclosedBegin {
                    node_id: id.to_string(),
                });
            }
        }
        tree
    }

    fn push_node(&mut self, segment: &Segment, parent: Option<usize>) -> usize {
        let (id, properties) = match segment.as_marker() {
            Some(marker) => (marker.id.clone(), marker.properties.clone()),
            None => (String::new(), PropertySet::new()),
        };
        let index = self.nodes.len();
        let depth = parent.map_or(0, |p| self.nodes[p].depth + 1);
        let node = OverlayNode {
            node_type: properties.get(NODE_TYPE),
            label: properties
                .user_value("label")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            state: if segment.is_pending() {
                NodeState::Intent
            } else {
                NodeState::Acknowledged
            },
            id: id.clone(),
            properties,
            parent,
            children: Vec::new(),
            depth,
        };

        match parent {
            Some(p) => self.nodes[p].children.push(index),
            None => self.roots.push(index),
        }
        self.nodes.push(node);
        self.index.insert(id, index);
        index
    }

    fn warn(&mut self, warning: ConsistencyWarning) {
        tracing::warn!(%warning, "Overlay scan inconsistency");
        self.warnings.push(warning);
    }

    /// Number of reachable nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&OverlayNode> {
        self.nodes.get(*self.index.get(id)?)
    }

    /// Top-level nodes in document order
    pub fn roots(&self) -> impl Iterator<Item = &OverlayNode> + '_ {
        self.roots.iter().map(|&i| &self.nodes[i])
    }

    /// Children of `id` in document order; empty if `id` is not in the tree
    pub fn children(&self, id: &str) -> impl Iterator<Item = &OverlayNode> + '_ {
        self.get(id)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|&i| &self.nodes[i])
    }

    pub fn parent(&self, id: &str) -> Option<&OverlayNode> {
        self.nodes.get(self.get(id)?.parent?)
    }

    /// All reachable nodes, parents before children
    pub fn nodes(&self) -> impl Iterator<Item = &OverlayNode> + '_ {
        self.nodes.iter()
    }

    /// Structural problems found by the scan
    pub fn warnings(&self) -> &[ConsistencyWarning] {
        &self.warnings
    }

    /// Live nodes left out because an ancestor was removed
    pub fn pruned_count(&self) -> usize {
        self.pruned
    }

    /// Indented `type:id` lines, one per node
    pub fn outline(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|node| {
                format!(
                    "{}{}:{}",
                    "  ".repeat(node.depth),
                    node.node_type.as_deref().unwrap_or("?"),
                    node.id
                )
            })
            .collect()
    }
}

/// Overlay tree that rescans only when the replica changed
#[derive(Debug, Clone, Default)]
pub struct OverlayView {
    tree: OverlayTree,
    version: Option<u64>,
}

impl OverlayView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rescan if the replica changed since the last refresh; returns true if it did
    pub fn refresh(&mut self, replica: &Replica) -> bool {
        if self.version == Some(replica.version()) {
            return false;
        }
        self.tree = OverlayTree::build(replica);
        self.version = Some(replica.version());
        true
    }

    pub fn tree(&self) -> &OverlayTree {
        &self.tree
    }
}
