//! Overlay trees on top of the marker sequence
//!
//! A node is a pair of range markers labelled with the replica's overlay
//! label (`"onode"` by default): a begin marker `{client}_Node{n}` carrying the
//! node's properties, and an end marker `end-{id}`. Whatever sits between the
//! pair belongs to the node, so nesting of marker pairs is the tree.
//!
//! - [`builder`] inserts and removes nodes as atomic group ops
//! - [`placement`] maps placement modes to marker anchors
//! - [`tree`] rebuilds the hierarchy from the sequence

pub mod builder;
pub mod placement;
pub mod tree;

pub use builder::{insert_overlay_node, remove_overlay_node};
pub use placement::{end_id, node_id_of_end, Anchor, GroupOrder, OverlayNodePosition, Placement};
pub use tree::{ConsistencyWarning, NodeState, OverlayNode, OverlayTree, OverlayView};
