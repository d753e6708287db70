//! Operation wire format
//!
//! Operations travel between replicas as JSON:
//!
//! ```text
//! { "type": "insert" | "remove" | "group",
//!   "referencePosition": { "id": "...", "before": true }?,
//!   "absolutePosition": 3?, "end": 5?,
//!   "marker": { "behavior": "rangeBegin" }?, "text": "..."?,
//!   "properties": { ... }?, "ops": [ ... ]? }
//! ```
//!
//! The structs mirror that shape field for field; the typed accessors
//! ([`InsertOp::reference`], [`InsertOp::content`], [`RemoveOp::target`])
//! reject malformed combinations with a [`ValidationError`].

use crate::error::ValidationError;
use crate::properties::{PropertySet, MARKER_ID};
use crate::{ClientId, MarkerId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// How a marker participates in ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MarkerBehavior {
    /// Opens a range closed by the marker `end-<id>`
    RangeBegin,
    /// Closes the range opened by the marker it names
    RangeEnd,
    /// Stand-alone anchor
    Simple,
}

/// Marker part of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerDescriptor {
    pub behavior: MarkerBehavior,
}

/// Anchor relative to a marker: directly before it, or directly after it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkerPosition {
    pub id: MarkerId,
    #[serde(default)]
    pub before: bool,
}

impl MarkerPosition {
    /// Anchor directly before marker `id`
    pub fn before(id: impl Into<MarkerId>) -> Self {
        Self {
            id: id.into(),
            before: true,
        }
    }

    /// Anchor directly after marker `id`
    pub fn after(id: impl Into<MarkerId>) -> Self {
        Self {
            id: id.into(),
            before: false,
        }
    }
}

/// Logical anchor of an insert, resolved to a live offset at apply time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReferencePosition {
    Marker(MarkerPosition),
    Absolute(usize),
}

impl fmt::Display for ReferencePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferencePosition::Marker(pos) if pos.before => write!(f, "before marker {}", pos.id),
            ReferencePosition::Marker(pos) => write!(f, "after marker {}", pos.id),
            ReferencePosition::Absolute(offset) => write!(f, "offset {}", offset),
        }
    }
}

/// Content carried by an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Content<'a> {
    Text(&'a str),
    Marker(MarkerBehavior),
}

/// Insert a text run or a marker
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_position: Option<MarkerPosition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_position: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<MarkerDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "PropertySet::is_empty")]
    pub properties: PropertySet,
}

impl InsertOp {
    /// Text insert at an absolute offset
    pub fn text(position: usize, text: impl Into<String>) -> Self {
        Self {
            absolute_position: Some(position),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Marker insert at the given anchor
    pub fn marker(
        at: ReferencePosition,
        behavior: MarkerBehavior,
        properties: PropertySet,
    ) -> Self {
        let (reference_position, absolute_position) = match at {
            ReferencePosition::Marker(pos) => (Some(pos), None),
            ReferencePosition::Absolute(offset) => (None, Some(offset)),
        };
        Self {
            reference_position,
            absolute_position,
            marker: Some(MarkerDescriptor { behavior }),
            text: None,
            properties,
        }
    }

    /// Where this insert is anchored
    pub fn reference(&self) -> Result<ReferencePosition, ValidationError> {
        match (&self.reference_position, self.absolute_position) {
            (Some(pos), None) => Ok(ReferencePosition::Marker(pos.clone())),
            (None, Some(offset)) => Ok(ReferencePosition::Absolute(offset)),
            (Some(_), Some(_)) => Err(ValidationError::ConflictingAnchors),
            (None, None) => Err(ValidationError::MissingAnchor),
        }
    }

    /// What this insert adds
    pub fn content(&self) -> Result<Content<'_>, ValidationError> {
        match (&self.text, &self.marker) {
            (Some(text), None) => Ok(Content::Text(text)),
            (None, Some(marker)) => Ok(Content::Marker(marker.behavior)),
            _ => Err(ValidationError::InvalidContent),
        }
    }

    /// Id of the inserted marker, if this is a marker insert
    pub fn marker_id(&self) -> Option<MarkerId> {
        self.marker.as_ref()?;
        self.properties.get(MARKER_ID)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.reference()?;
        if let Content::Marker(_) = self.content()? {
            if self.marker_id().is_none() {
                return Err(ValidationError::MissingMarkerId);
            }
        }
        Ok(())
    }
}

/// What a remove targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveTarget<'a> {
    /// A single marker by id
    Marker(&'a str),
    /// Visible offsets `start..end`
    Range { start: usize, end: usize },
}

/// Remove a marker or a range of offsets
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveOp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_position: Option<MarkerPosition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_position: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
}

impl RemoveOp {
    /// Remove the marker with the given id
    pub fn marker(id: impl Into<MarkerId>) -> Self {
        Self {
            reference_position: Some(MarkerPosition::before(id)),
            ..Self::default()
        }
    }

    /// Remove visible offsets `start..end`
    pub fn range(start: usize, end: usize) -> Self {
        Self {
            reference_position: None,
            absolute_position: Some(start),
            end: Some(end),
        }
    }

    /// What this remove targets
    pub fn target(&self) -> Result<RemoveTarget<'_>, ValidationError> {
        match (&self.reference_position, self.absolute_position) {
            (Some(pos), None) => Ok(RemoveTarget::Marker(&pos.id)),
            (None, Some(start)) => {
                let end = match self.end {
                    Some(end) => end,
                    None => start
                        .checked_add(1)
                        .ok_or(ValidationError::PositionOutOfBounds {
                            position: start,
                            length: usize::MAX,
                        })?,
                };
                if end <= start {
                    return Err(ValidationError::EmptyRange { start, end });
                }
                Ok(RemoveTarget::Range { start, end })
            }
            (Some(_), Some(_)) => Err(ValidationError::ConflictingAnchors),
            (None, None) => Err(ValidationError::MissingAnchor),
        }
    }
}

/// Ordered list of inserts/removes applied as one unit
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupOp {
    pub ops: Vec<Operation>,
}

/// A merge-tree operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operation {
    Insert(InsertOp),
    Remove(RemoveOp),
    Group(GroupOp),
}

impl Operation {
    /// Wrap operations into a group
    pub fn group(ops: Vec<Operation>) -> Self {
        Operation::Group(GroupOp { ops })
    }

    /// The primitive operations in application order
    pub fn primitives(&self) -> &[Operation] {
        match self {
            Operation::Group(group) => &group.ops,
            other => std::slice::from_ref(other),
        }
    }

    /// Check the wire shape of the operation
    ///
    /// This does not look at any replica state; anchors are checked at apply
    /// time.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Operation::Group(group) = self {
            if group.ops.is_empty() {
                return Err(ValidationError::EmptyGroup);
            }
        }

        let mut marker_ids = HashSet::new();
        for op in self.primitives() {
            match op {
                Operation::Insert(insert) => {
                    insert.validate()?;
                    if let Some(id) = insert.marker_id() {
                        if !marker_ids.insert(id.clone()) {
                            return Err(ValidationError::DuplicateMarkerId(id));
                        }
                    }
                }
                Operation::Remove(remove) => {
                    remove.target()?;
                }
                Operation::Group(_) => return Err(ValidationError::NestedGroup),
            }
        }
        Ok(())
    }
}

impl From<InsertOp> for Operation {
    fn from(op: InsertOp) -> Self {
        Operation::Insert(op)
    }
}

impl From<RemoveOp> for Operation {
    fn from(op: RemoveOp) -> Self {
        Operation::Remove(op)
    }
}

/// Locally issued operation waiting to be sequenced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundOperation {
    pub client_id: ClientId,
    /// Per-client counter, echoed back in the acknowledgement
    pub client_seq: u64,
    /// Last sequence number the client had applied when issuing
    pub ref_seq: u64,
    pub op: Operation,
}

/// Operation stamped by the ordering service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedOperation {
    pub seq: u64,
    pub ref_seq: u64,
    /// Lowest `ref_seq` any connected client may still issue from
    pub min_seq: u64,
    pub client_id: ClientId,
    pub client_seq: u64,
    pub op: Operation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::RANGE_LABELS;
    use serde_json::json;

    fn begin_marker(id: &str, at: ReferencePosition) -> InsertOp {
        let mut props = PropertySet::new();
        props.set(MARKER_ID, &id.to_string());
        InsertOp::marker(at, MarkerBehavior::RangeBegin, props)
    }

    #[test]
    fn test_insert_wire_shape() {
        let op = Operation::from(begin_marker(
            "n1",
            ReferencePosition::Marker(MarkerPosition::before("end-root")),
        ));

        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], json!("insert"));
        assert_eq!(
            value["referencePosition"],
            json!({ "id": "end-root", "before": true })
        );
        assert_eq!(value["marker"], json!({ "behavior": "rangeBegin" }));
        assert!(value.get("absolutePosition").is_none());
        assert!(value.get("text").is_none());
    }

    #[test]
    fn test_group_from_json() {
        let value = json!({
            "type": "group",
            "ops": [
                { "type": "insert", "absolutePosition": 0, "text": "hi" },
                { "type": "remove", "referencePosition": { "id": "m" } }
            ]
        });

        let op: Operation = serde_json::from_value(value).unwrap();
        assert_eq!(op.primitives().len(), 2);
        assert!(op.validate().is_ok());
        match &op.primitives()[1] {
            Operation::Remove(remove) => assert_eq!(remove.target(), Ok(RemoveTarget::Marker("m"))),
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_missing_and_conflicting_anchor() {
        let mut op = InsertOp::text(0, "x");
        op.absolute_position = None;
        assert_eq!(
            Operation::from(op.clone()).validate(),
            Err(ValidationError::MissingAnchor)
        );

        op.absolute_position = Some(1);
        op.reference_position = Some(MarkerPosition::after("m"));
        assert_eq!(
            Operation::from(op).validate(),
            Err(ValidationError::ConflictingAnchors)
        );
    }

    #[test]
    fn test_marker_requires_id() {
        let mut props = PropertySet::new();
        props.set(RANGE_LABELS, &vec!["onode".to_string()]);
        let op = InsertOp::marker(ReferencePosition::Absolute(0), MarkerBehavior::Simple, props);

        assert_eq!(
            Operation::from(op).validate(),
            Err(ValidationError::MissingMarkerId)
        );
    }

    #[test]
    fn test_text_and_marker_is_invalid() {
        let mut op = begin_marker("m", ReferencePosition::Absolute(0));
        op.text = Some("x".to_string());
        assert_eq!(
            Operation::from(op).validate(),
            Err(ValidationError::InvalidContent)
        );
    }

    #[test]
    fn test_group_rules() {
        assert_eq!(
            Operation::group(vec![]).validate(),
            Err(ValidationError::EmptyGroup)
        );

        let nested = Operation::group(vec![Operation::group(vec![InsertOp::text(0, "a").into()])]);
        assert_eq!(nested.validate(), Err(ValidationError::NestedGroup));

        let duplicate = Operation::group(vec![
            begin_marker("m", ReferencePosition::Absolute(0)).into(),
            begin_marker("m", ReferencePosition::Absolute(0)).into(),
        ]);
        assert_eq!(
            duplicate.validate(),
            Err(ValidationError::DuplicateMarkerId("m".to_string()))
        );
    }

    #[test]
    fn test_remove_range() {
        assert_eq!(
            RemoveOp::range(2, 5).target(),
            Ok(RemoveTarget::Range { start: 2, end: 5 })
        );
        assert_eq!(
            RemoveOp::range(5, 5).target(),
            Err(ValidationError::EmptyRange { start: 5, end: 5 })
        );
        assert_eq!(
            RemoveOp {
                absolute_position: Some(4),
                ..RemoveOp::default()
            }
            .target(),
            Ok(RemoveTarget::Range { start: 4, end: 5 })
        );
    }

    #[test]
    fn test_remove_single_unit_at_max_offset() {
        let op = RemoveOp {
            absolute_position: Some(usize::MAX),
            ..RemoveOp::default()
        };
        assert_eq!(
            op.target(),
            Err(ValidationError::PositionOutOfBounds {
                position: usize::MAX,
                length: usize::MAX,
            })
        );
        assert!(Operation::from(op).validate().is_err());
    }

    #[test]
    fn test_reference_display() {
        assert_eq!(
            ReferencePosition::Marker(MarkerPosition::after("x")).to_string(),
            "after marker x"
        );
        assert_eq!(ReferencePosition::Absolute(3).to_string(), "offset 3");
    }
}
