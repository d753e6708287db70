//! Placement table for overlay nodes
//!
//! Each placement mode maps to where the new begin and end markers are
//! anchored relative to the reference node's markers, and to the order the
//! two inserts appear in the group.

use crate::error::ValidationError;
use crate::ops::{MarkerPosition, ReferencePosition};
use std::fmt;

/// Where a new overlay node goes relative to a reference node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayNodePosition {
    /// Parent of the reference node
    Above,
    /// Sibling before the reference node
    Left,
    /// Sibling after the reference node
    Right,
    /// Last child of the reference node
    Append,
    /// First child of the reference node
    Prepend,
    /// New top-level node at the start of the sequence
    Root,
}

/// Anchor of one new marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    BeforeBegin,
    AfterBegin,
    BeforeEnd,
    AfterEnd,
    /// Absolute offset 0
    Start,
}

/// Which marker insert comes first in the group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOrder {
    BeginFirst,
    EndFirst,
}

/// Row of the placement table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub begin: Anchor,
    pub end: Anchor,
    pub order: GroupOrder,
}

const fn row(begin: Anchor, end: Anchor, order: GroupOrder) -> Placement {
    Placement { begin, end, order }
}

impl OverlayNodePosition {
    pub const ALL: [OverlayNodePosition; 6] = [
        OverlayNodePosition::Above,
        OverlayNodePosition::Left,
        OverlayNodePosition::Right,
        OverlayNodePosition::Append,
        OverlayNodePosition::Prepend,
        OverlayNodePosition::Root,
    ];

    /// Anchors and group order for this mode
    pub const fn placement(self) -> Placement {
        use Anchor::*;
        use GroupOrder::*;
        match self {
            OverlayNodePosition::Append => row(BeforeEnd, BeforeEnd, BeginFirst),
            OverlayNodePosition::Prepend => row(AfterBegin, AfterBegin, EndFirst),
            OverlayNodePosition::Above => row(BeforeBegin, AfterEnd, BeginFirst),
            OverlayNodePosition::Left => row(BeforeBegin, BeforeBegin, BeginFirst),
            OverlayNodePosition::Right => row(AfterEnd, AfterEnd, EndFirst),
            OverlayNodePosition::Root => row(Start, Start, EndFirst),
        }
    }

    /// Every mode but `Root` is relative to an existing node
    pub const fn requires_reference(self) -> bool {
        !matches!(self, OverlayNodePosition::Root)
    }

    pub const fn name(self) -> &'static str {
        match self {
            OverlayNodePosition::Above => "above",
            OverlayNodePosition::Left => "left",
            OverlayNodePosition::Right => "right",
            OverlayNodePosition::Append => "append",
            OverlayNodePosition::Prepend => "prepend",
            OverlayNodePosition::Root => "root",
        }
    }
}

impl fmt::Display for OverlayNodePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Id of the end marker paired with a node's begin marker
pub fn end_id(node_id: &str) -> String {
    format!("end-{}", node_id)
}

/// Node id encoded in an end marker id
pub fn node_id_of_end(end_marker_id: &str) -> Option<&str> {
    end_marker_id.strip_prefix("end-")
}

impl Anchor {
    /// Reference position for this anchor given the reference node id
    pub fn resolve(
        self,
        reference_node: Option<&str>,
        position: OverlayNodePosition,
    ) -> Result<ReferencePosition, ValidationError> {
        if let Anchor::Start = self {
            return Ok(ReferencePosition::Absolute(0));
        }
        let node = reference_node.ok_or(ValidationError::MissingReferenceNode(position.name()))?;
        let marker = match self {
            Anchor::BeforeBegin => MarkerPosition::before(node),
            Anchor::AfterBegin => MarkerPosition::after(node),
            Anchor::BeforeEnd => MarkerPosition::before(end_id(node)),
            Anchor::AfterEnd => MarkerPosition::after(end_id(node)),
            Anchor::Start => return Ok(ReferencePosition::Absolute(0)),
        };
        Ok(ReferencePosition::Marker(marker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_rows() {
        let append = OverlayNodePosition::Append.placement();
        assert_eq!(append.begin, Anchor::BeforeEnd);
        assert_eq!(append.order, GroupOrder::BeginFirst);

        let right = OverlayNodePosition::Right.placement();
        assert_eq!((right.begin, right.end), (Anchor::AfterEnd, Anchor::AfterEnd));
        assert_eq!(right.order, GroupOrder::EndFirst);

        let above = OverlayNodePosition::Above.placement();
        assert_eq!((above.begin, above.end), (Anchor::BeforeBegin, Anchor::AfterEnd));
    }

    #[test]
    fn test_only_root_needs_no_reference() {
        let free: Vec<_> = OverlayNodePosition::ALL
            .iter()
            .filter(|p| !p.requires_reference())
            .collect();
        assert_eq!(free, vec![&OverlayNodePosition::Root]);
    }

    #[test]
    fn test_anchor_resolution() {
        let position = Anchor::AfterEnd
            .resolve(Some("A_Node0"), OverlayNodePosition::Right)
            .unwrap();
        assert_eq!(
            position,
            ReferencePosition::Marker(MarkerPosition::after("end-A_Node0"))
        );

        assert_eq!(
            Anchor::Start.resolve(None, OverlayNodePosition::Root),
            Ok(ReferencePosition::Absolute(0))
        );
        assert_eq!(
            Anchor::BeforeBegin.resolve(None, OverlayNodePosition::Left),
            Err(ValidationError::MissingReferenceNode("left"))
        );
    }

    #[test]
    fn test_end_ids() {
        assert_eq!(end_id("B_Node3"), "end-B_Node3");
        assert_eq!(node_id_of_end("end-B_Node3"), Some("B_Node3"));
        assert_eq!(node_id_of_end("B_Node3"), None);
    }
}
