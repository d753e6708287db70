//! Overlay node transactions
//!
//! A node is a begin/end marker pair inserted by one group op, so every
//! replica sees either both markers or neither.

use super::placement::{end_id, GroupOrder, OverlayNodePosition};
use crate::error::{Result, ValidationError};
use crate::merge_tree::{LocalHandle, Replica};
use crate::ops::{InsertOp, MarkerBehavior, MarkerPosition, Operation, ReferencePosition, RemoveOp};
use crate::properties::{PropertySet, MARKER_ID, NODE_TYPE, RANGE_LABELS};
use crate::resolver::{resolve, Fallback};

/// Insert an overlay node and return its id
///
/// The id is available immediately; the node shows up as an intent in the
/// overlay tree until the ordering service acknowledges it. Every position
/// but [`OverlayNodePosition::Root`] needs `reference_node`, whose markers
/// must still be live.
///
/// # Example
///
/// ```rust
/// use mergetree_core::overlay::{insert_overlay_node, OverlayNodePosition, OverlayTree};
/// use mergetree_core::{PropertySet, Replica};
///
/// let mut replica = Replica::new("A");
/// let root = insert_overlay_node(&mut replica, "folder", OverlayNodePosition::Root, PropertySet::new(), None).unwrap();
/// let child = insert_overlay_node(&mut replica, "file", OverlayNodePosition::Append, PropertySet::new(), Some(&root)).unwrap();
///
/// let tree = OverlayTree::build(&replica);
/// assert_eq!(tree.parent(&child).map(|n| n.id.as_str()), Some(root.as_str()));
/// ```
pub fn insert_overlay_node(
    replica: &mut Replica,
    node_type: &str,
    position: OverlayNodePosition,
    begin_properties: PropertySet,
    reference_node: Option<&str>,
) -> Result<String> {
    let placement = position.placement();
    if position.requires_reference() {
        let node = reference_node.ok_or(ValidationError::MissingReferenceNode(position.name()))?;
        ensure_live(replica, node)?;
        ensure_live(replica, &end_id(node))?;
    }
    let begin_at = placement.begin.resolve(reference_node, position)?;
    let end_at = placement.end.resolve(reference_node, position)?;

    let id = replica.next_node_id();
    let labels = vec![replica.config().overlay_label.clone()];

    let mut begin_props = begin_properties;
    begin_props
        .set(MARKER_ID, &id)
        .set(RANGE_LABELS, &labels)
        .set(NODE_TYPE, &node_type.to_string());
    let mut end_props = PropertySet::new();
    end_props.set(MARKER_ID, &end_id(&id)).set(RANGE_LABELS, &labels);

    let begin: Operation = InsertOp::marker(begin_at, MarkerBehavior::RangeBegin, begin_props).into();
    let end: Operation = InsertOp::marker(end_at, MarkerBehavior::RangeEnd, end_props).into();
    let ops = match placement.order {
        GroupOrder::BeginFirst => vec![begin, end],
        GroupOrder::EndFirst => vec![end, begin],
    };

    replica.apply_local(Operation::group(ops))?;
    tracing::debug!(
        client = %replica.client_id(),
        node = %id,
        %position,
        reference = ?reference_node,
        "Inserted overlay node"
    );
    Ok(id)
}

/// Remove an overlay node by tombstoning both of its markers
///
/// Descendants keep their markers but are no longer reachable from the tree.
pub fn remove_overlay_node(replica: &mut Replica, node_id: &str) -> Result<LocalHandle> {
    ensure_live(replica, node_id)?;
    let ops = vec![
        RemoveOp::marker(node_id).into(),
        RemoveOp::marker(end_id(node_id)).into(),
    ];
    replica.apply_local(Operation::group(ops))
}

fn ensure_live(replica: &Replica, marker_id: &str) -> Result<()> {
    let anchor = ReferencePosition::Marker(MarkerPosition::before(marker_id));
    resolve(replica, &anchor, Fallback::None).map(|_| ())
}
