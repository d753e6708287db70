//! Segment: a text run or a marker with merge-tree metadata
//!
//! Text runs from one insert are stored in a single segment and split only
//! when a later op lands inside them. Removed segments stay in place as
//! tombstones until the collaboration window has moved past their removal.

use super::stamp::{Perspective, Seq, Stamp};
use crate::ops::{Content, InsertOp, MarkerBehavior};
use crate::properties::{PropertySet, MARKER_ID, RANGE_LABELS};
use crate::{ClientId, MarkerId};
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

/// A length-1 sentinel with a stable id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    pub id: MarkerId,
    pub behavior: MarkerBehavior,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub range_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "PropertySet::is_empty")]
    pub properties: PropertySet,
}

impl Marker {
    /// Check if the marker carries the given range label
    pub fn has_label(&self, label: &str) -> bool {
        self.range_labels.iter().any(|l| l == label)
    }
}

/// Payload of a segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SegmentContent {
    Text(String),
    Marker(Marker),
}

/// Tombstone record of a segment
///
/// `seq` is the first removal of the segment. Every client that removed it
/// (concurrently or not) is listed so each op's perspective sees its own
/// removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Removal {
    pub seq: Seq,
    pub clients: Vec<ClientId>,

    /// Client sequence number of the pending local op that also removed this
    #[serde(skip)]
    pub(crate) local_seq: Option<u64>,
}

impl Removal {
    pub(crate) fn new(seq: Seq, client_id: &str) -> Self {
        Self {
            seq,
            clients: vec![client_id.to_string()],
            local_seq: seq.pending(),
        }
    }

    fn observed_by(&self, view: &Perspective) -> bool {
        self.seq.acked().is_some_and(|seq| seq <= view.ref_seq)
            || self.clients.iter().any(|c| *c == view.client_id)
    }
}

/// One element of the sequence
///
/// # Example
///
/// ```rust
/// use mergetree_core::merge_tree::{Segment, Seq, Stamp};
///
/// let segment = Segment::text("héllo", Stamp::new(Seq::Acked(1), "A"));
/// assert_eq!(segment.len(), 5); // grapheme clusters
/// assert!(!segment.is_removed());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub(crate) content: SegmentContent,
    pub(crate) stamp: Stamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) removal: Option<Removal>,

    /// Cached length in grapheme clusters
    #[serde(skip)]
    len: usize,
}

impl Segment {
    /// Create a text segment
    pub fn text(text: impl Into<String>, stamp: Stamp) -> Self {
        Self::with_content(SegmentContent::Text(text.into()), stamp)
    }

    /// Create a marker segment
    pub fn marker(marker: Marker, stamp: Stamp) -> Self {
        Self::with_content(SegmentContent::Marker(marker), stamp)
    }

    fn with_content(content: SegmentContent, stamp: Stamp) -> Self {
        let mut segment = Self {
            content,
            stamp,
            removal: None,
            len: 0,
        };
        segment.measure();
        segment
    }

    /// Build the segment an insert adds, or `None` for an empty text run
    pub(crate) fn from_insert(op: &InsertOp, stamp: Stamp) -> Option<Self> {
        match op.content().ok()? {
            Content::Text(text) if text.is_empty() => None,
            Content::Text(text) => Some(Self::text(text, stamp)),
            Content::Marker(behavior) => {
                let marker = Marker {
                    id: op.properties.get(MARKER_ID)?,
                    behavior,
                    range_labels: op.properties.get(RANGE_LABELS).unwrap_or_default(),
                    properties: op.properties.clone(),
                };
                Some(Self::marker(marker, stamp))
            }
        }
    }

    /// Recompute the cached length (after deserializing)
    pub(crate) fn measure(&mut self) {
        self.len = match &self.content {
            SegmentContent::Text(text) => text.graphemes(true).count(),
            SegmentContent::Marker(_) => 1,
        };
    }

    /// Length in grapheme clusters; markers count as one
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false for stored segments
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn content(&self) -> &SegmentContent {
        &self.content
    }

    pub fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    pub fn removal(&self) -> Option<&Removal> {
        self.removal.as_ref()
    }

    /// Text of a text segment
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            SegmentContent::Text(text) => Some(text),
            SegmentContent::Marker(_) => None,
        }
    }

    /// Marker of a marker segment
    pub fn as_marker(&self) -> Option<&Marker> {
        match &self.content {
            SegmentContent::Marker(marker) => Some(marker),
            SegmentContent::Text(_) => None,
        }
    }

    /// Tombstoned, by anyone
    pub fn is_removed(&self) -> bool {
        self.removal.is_some()
    }

    /// Inserted by a local op that is not yet acknowledged
    pub fn is_pending(&self) -> bool {
        !self.stamp.seq.is_acked()
    }

    /// Range markers are kept forever so orphaned overlay nodes stay pruned
    pub(crate) fn is_collectable(&self) -> bool {
        match &self.content {
            SegmentContent::Text(_) => true,
            SegmentContent::Marker(marker) => marker.behavior == MarkerBehavior::Simple,
        }
    }

    /// Visible in the local view (everything applied, pending included)
    pub(crate) fn local_len(&self) -> usize {
        if self.is_removed() {
            0
        } else {
            self.len
        }
    }

    /// Check if an op issued from `view` saw this segment
    pub(crate) fn visible_in(&self, view: &Perspective) -> bool {
        let inserted = view.observed(self.stamp.seq, &self.stamp.client_id);
        let removed = self.removal.as_ref().is_some_and(|r| r.observed_by(view));
        inserted && !removed
    }

    pub(crate) fn len_in(&self, view: &Perspective) -> usize {
        if self.visible_in(view) {
            self.len
        } else {
            0
        }
    }

    /// Highest acknowledged event (insert or first removal) on this segment
    pub(crate) fn max_acked_seq(&self) -> u64 {
        let inserted = self.stamp.seq.acked().unwrap_or(0);
        let removed = self
            .removal
            .as_ref()
            .and_then(|r| r.seq.acked())
            .unwrap_or(0);
        inserted.max(removed)
    }

    /// Split a text segment at a grapheme offset, returning the right half
    ///
    /// Returns `None` for markers and for offsets that would leave an empty half.
    pub(crate) fn split_off(&mut self, offset: usize) -> Option<Segment> {
        if offset == 0 || offset >= self.len {
            return None;
        }
        let SegmentContent::Text(text) = &mut self.content else {
            return None;
        };
        let (byte, _) = text.grapheme_indices(true).nth(offset)?;
        let right = text.split_off(byte);

        let right = Segment {
            content: SegmentContent::Text(right),
            stamp: self.stamp.clone(),
            removal: self.removal.clone(),
            len: self.len - offset,
        };
        self.len = offset;
        Some(right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ReferencePosition;

    fn acked(seq: u64, client: &str) -> Stamp {
        Stamp::new(Seq::Acked(seq), client)
    }

    #[test]
    fn test_grapheme_length() {
        let segment = Segment::text("👨‍👩‍👧‍👦ab", acked(1, "A"));
        assert_eq!(segment.len(), 3);
    }

    #[test]
    fn test_split_off() {
        let mut segment = Segment::text("héllo", acked(1, "A"));
        let right = segment.split_off(2).unwrap();

        assert_eq!(segment.as_text(), Some("hé"));
        assert_eq!(right.as_text(), Some("llo"));
        assert_eq!(segment.len(), 2);
        assert_eq!(right.len(), 3);
        assert_eq!(right.stamp(), segment.stamp());
    }

    #[test]
    fn test_split_off_bounds() {
        let mut segment = Segment::text("abc", acked(1, "A"));
        assert!(segment.split_off(0).is_none());
        assert!(segment.split_off(3).is_none());
        assert_eq!(segment.as_text(), Some("abc"));
    }

    #[test]
    fn test_visibility() {
        let mut segment = Segment::text("abc", acked(5, "B"));

        assert!(!segment.visible_in(&Perspective::new(4, "A")));
        assert!(segment.visible_in(&Perspective::new(4, "B")));
        assert!(segment.visible_in(&Perspective::new(5, "A")));

        segment.removal = Some(Removal::new(Seq::Acked(7), "C"));
        assert!(segment.visible_in(&Perspective::new(6, "A")));
        assert!(!segment.visible_in(&Perspective::new(6, "C")));
        assert!(!segment.visible_in(&Perspective::new(7, "A")));
        assert_eq!(segment.local_len(), 0);
        assert_eq!(segment.max_acked_seq(), 7);
    }

    #[test]
    fn test_concurrent_remover_sees_own_removal() {
        let mut segment = Segment::text("abc", acked(1, "A"));
        let mut removal = Removal::new(Seq::Acked(7), "C");
        removal.clients.push("D".to_string());
        segment.removal = Some(removal);

        assert!(!segment.visible_in(&Perspective::new(6, "D")));
        assert!(segment.visible_in(&Perspective::new(6, "E")));
    }

    #[test]
    fn test_from_insert_marker() {
        let mut props = PropertySet::new();
        props.set(MARKER_ID, &"m1".to_string());
        props.set(RANGE_LABELS, &vec!["onode".to_string()]);
        let op = InsertOp::marker(ReferencePosition::Absolute(0), MarkerBehavior::RangeBegin, props);

        let segment = Segment::from_insert(&op, acked(1, "A")).unwrap();
        let marker = segment.as_marker().unwrap();
        assert_eq!(marker.id, "m1");
        assert!(marker.has_label("onode"));
        assert_eq!(segment.len(), 1);
        assert!(!segment.is_collectable());
    }

    #[test]
    fn test_from_insert_empty_text() {
        let op = InsertOp::text(0, "");
        assert!(Segment::from_insert(&op, acked(1, "A")).is_none());
    }
}
