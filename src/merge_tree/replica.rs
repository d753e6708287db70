//! Replica: one participant's copy of the sequence
//!
//! Local ops apply immediately and are queued for the ordering service.
//! Sequenced ops are applied in sequence order. Before a remote op applies,
//! every pending local op is rolled back; afterwards the pending ops are
//! replayed from their anchor-relative description with their original
//! perspective. Acknowledgements stamp the oldest pending op in place.

use super::inbound::InboundBuffer;
use super::segment::{Removal, Segment, SegmentContent};
use super::stamp::{OpCounter, Perspective, Seq, Stamp};
use super::tree::{SegKey, SegmentTree, View};
use crate::config::ReplicaConfig;
use crate::error::{MergeTreeError, Result, ValidationError};
use crate::ops::{
    Content, InsertOp, Operation, OutboundOperation, ReferencePosition, RemoveOp, RemoveTarget,
    SequencedOperation,
};
use crate::{ClientId, MarkerId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use unicode_segmentation::UnicodeSegmentation;

/// Handle of a local op, valid until its acknowledgement arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalHandle {
    pub client_seq: u64,
}

/// What caused a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A local op was applied optimistically
    Local,
    /// A sequenced op from another client was applied
    Remote,
    /// One of our pending ops came back from the ordering service
    Acknowledged,
}

/// Change notification delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub kind: ChangeKind,
    /// Last sequence number applied when the change happened
    pub seq: u64,
    /// Client that issued the op
    pub client_id: ClientId,
}

/// Where a marker currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerLocation {
    /// Visible units before the marker in the local view
    pub offset: usize,
    pub removed: bool,
    pub pending: bool,
}

type Listener = Box<dyn FnMut(&StoreChange)>;

#[derive(Debug, Clone)]
struct PendingOp {
    client_seq: u64,
    ref_seq: u64,
    op: Operation,
    inserted: Vec<SegKey>,
    removed: Vec<SegKey>,
    dropped: bool,
}

impl PendingOp {
    fn new(client_seq: u64, ref_seq: u64, op: Operation) -> Self {
        Self {
            client_seq,
            ref_seq,
            op,
            inserted: Vec::new(),
            removed: Vec::new(),
            dropped: false,
        }
    }
}

struct ApplyCtx {
    seq: Seq,
    perspective: Perspective,
}

impl ApplyCtx {
    fn stamp(&self) -> Stamp {
        Stamp::new(self.seq, self.perspective.client_id.clone())
    }
}

enum RemoveOutcome {
    Tombstoned,
    JoinedRemovers,
}

/// A replica of the merge-tree sequence
///
/// # Example
///
/// ```rust
/// use mergetree_core::{InsertOp, Operation, RemoveOp, Replica};
///
/// let mut replica = Replica::new("A");
/// replica.apply_local(InsertOp::text(0, "hello world").into()).unwrap();
/// replica.apply_local(RemoveOp::range(5, 11).into()).unwrap();
///
/// assert_eq!(replica.text(), "hello");
/// assert_eq!(replica.pending_count(), 2);
/// assert_eq!(replica.take_outbound().len(), 2);
/// ```
pub struct Replica {
    client_id: ClientId,
    config: ReplicaConfig,
    tree: SegmentTree,
    markers: HashMap<MarkerId, SegKey>,

    current_seq: u64,
    min_seq: u64,
    client_seq: OpCounter,
    node_counter: u64,

    pending: VecDeque<PendingOp>,
    outbox: Vec<OutboundOperation>,
    inbound: InboundBuffer,

    /// Acknowledged removals awaiting collection, lowest sequence number first
    tombstones: BinaryHeap<Reverse<(u64, SegKey)>>,

    version: u64,
    listeners: Vec<Listener>,
}

impl Replica {
    /// Create an empty replica with the default configuration
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self::with_config(client_id, ReplicaConfig::default())
    }

    /// Create an empty replica
    pub fn with_config(client_id: impl Into<ClientId>, config: ReplicaConfig) -> Self {
        Self {
            client_id: client_id.into(),
            tree: SegmentTree::new(config.block_capacity),
            config,
            markers: HashMap::new(),
            current_seq: 0,
            min_seq: 0,
            client_seq: OpCounter::new(),
            node_counter: 0,
            pending: VecDeque::new(),
            outbox: Vec::new(),
            inbound: InboundBuffer::default(),
            tombstones: BinaryHeap::new(),
            version: 0,
            listeners: Vec::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Last sequence number applied
    pub fn current_seq(&self) -> u64 {
        self.current_seq
    }

    /// Collaboration window low-water mark
    pub fn min_seq(&self) -> u64 {
        self.min_seq
    }

    /// Local ops not yet acknowledged
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if the op behind `handle` is still awaiting acknowledgement
    pub fn is_pending(&self, handle: LocalHandle) -> bool {
        self.pending.iter().any(|op| op.client_seq == handle.client_seq)
    }

    /// Sequenced messages held back waiting for a gap to fill
    pub fn buffered_count(&self) -> usize {
        self.inbound.len()
    }

    /// Oldest perspective this replica may still issue or replay an op from
    ///
    /// The ordering service must not advance the minimum sequence number past
    /// this value.
    pub fn reference_floor(&self) -> u64 {
        self.pending
            .front()
            .map_or(self.current_seq, |op| op.ref_seq)
    }

    /// Bumped on every applied change; cheap staleness check for derived views
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Visible length in grapheme clusters, markers included
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible text, markers excluded
    pub fn text(&self) -> String {
        self.segments()
            .filter(|segment| !segment.is_removed())
            .filter_map(Segment::as_text)
            .collect()
    }

    /// All stored segments in order, tombstones included
    pub fn segments(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.tree.iter().map(|(_, segment)| segment)
    }

    /// Number of stored segments, tombstones included
    pub fn segment_count(&self) -> usize {
        self.tree.segment_count()
    }

    /// Segment of the marker with this id (possibly a tombstone)
    pub fn marker(&self, id: &str) -> Option<&Segment> {
        self.tree.get(*self.markers.get(id)?)
    }

    /// Current offset and state of a marker
    pub fn locate_marker(&self, id: &str) -> Option<MarkerLocation> {
        let key = *self.markers.get(id)?;
        let segment = self.tree.get(key)?;
        Some(MarkerLocation {
            offset: self.tree.offset_of(key, View::Local),
            removed: segment.is_removed(),
            pending: segment.is_pending(),
        })
    }

    /// Allocate an overlay node id unique to this client
    pub fn next_node_id(&mut self) -> String {
        loop {
            let id = format!("{}_Node{}", self.client_id, self.node_counter);
            self.node_counter += 1;
            if !self.markers.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a change listener
    ///
    /// Listeners run synchronously after every local, remote or acknowledged
    /// op. A listener may be told about a change it already observed.
    pub fn subscribe(&mut self, listener: impl FnMut(&StoreChange) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Drain the ops waiting to be sent to the ordering service
    pub fn take_outbound(&mut self) -> Vec<OutboundOperation> {
        std::mem::take(&mut self.outbox)
    }

    /// Apply a local op optimistically and queue it for sequencing
    ///
    /// Fails without side effects if the op is malformed, references an
    /// unknown marker, anchors on a removed marker, reuses a marker id or
    /// points past the end of the sequence.
    pub fn apply_local(&mut self, op: Operation) -> Result<LocalHandle> {
        op.validate()?;
        let perspective = Perspective::new(self.current_seq, self.client_id.clone());
        self.check_references(&op, &perspective)?;

        let client_seq = self.client_seq.tick();
        self.pending
            .push_back(PendingOp::new(client_seq, self.current_seq, op.clone()));
        let ctx = ApplyCtx {
            seq: Seq::Pending(client_seq),
            perspective,
        };
        self.apply_primitives(&op, &ctx);

        self.outbox.push(OutboundOperation {
            client_id: self.client_id.clone(),
            client_seq,
            ref_seq: self.current_seq,
            op,
        });
        tracing::trace!(client = %self.client_id, client_seq, "Applied local op");

        let client_id = self.client_id.clone();
        self.notify(ChangeKind::Local, self.current_seq, &client_id);
        Ok(LocalHandle { client_seq })
    }

    /// Hand a sequenced message to the replica
    ///
    /// Messages are applied in contiguous sequence order; early arrivals wait
    /// in the reorder buffer and duplicates are discarded.
    pub fn apply_remote(&mut self, msg: SequencedOperation) {
        if let Err(violation) = self.inbound.push(msg) {
            tracing::debug!(client = %self.client_id, ?violation, "Discarding sequenced message");
            return;
        }
        if self.inbound.len() > self.config.max_buffered_ops {
            tracing::warn!(
                client = %self.client_id,
                buffered = self.inbound.len(),
                missing = ?self.inbound.gap(),
                "Inbound backlog exceeds limit"
            );
        }
        while let Some(msg) = self.inbound.pop_ready() {
            self.process(msg);
        }
    }

    /// Physically drop tombstones removed at or below the minimum sequence number
    ///
    /// Range marker tombstones are kept. Returns the number of segments dropped.
    pub fn collect_tombstones(&mut self) -> usize {
        let bound = self
            .pending
            .front()
            .map_or(self.min_seq, |op| op.ref_seq.min(self.min_seq));

        let mut collected = 0;
        while let Some(&Reverse((seq, key))) = self.tombstones.peek() {
            if seq > bound {
                break;
            }
            self.tombstones.pop();

            let collectable = self.tree.get(key).is_some_and(|segment| {
                segment.is_collectable()
                    && segment
                        .removal
                        .as_ref()
                        .and_then(|removal| removal.seq.acked())
                        .is_some_and(|removed| removed <= bound)
            });
            if !collectable {
                continue;
            }
            if let Some(segment) = self.tree.remove(key) {
                if let Some(marker) = segment.as_marker() {
                    self.markers.remove(&marker.id);
                }
                collected += 1;
            }
        }

        if collected > 0 {
            tracing::debug!(client = %self.client_id, collected, min_seq = bound, "Collected tombstones");
            if self.tree.is_sparse() {
                self.tree.rebuild();
            }
        }
        collected
    }

    fn process(&mut self, msg: SequencedOperation) {
        let kind = if msg.client_id == self.client_id && self.acknowledge(&msg) {
            ChangeKind::Acknowledged
        } else {
            self.apply_sequenced(&msg);
            ChangeKind::Remote
        };
        self.current_seq = msg.seq;
        tracing::trace!(client = %self.client_id, seq = msg.seq, from = %msg.client_id, "Applied sequenced op");

        if msg.min_seq > self.min_seq {
            self.min_seq = msg.min_seq;
            if self.config.collect_tombstones {
                self.collect_tombstones();
            }
        }
        self.notify(kind, msg.seq, &msg.client_id);
    }

    fn acknowledge(&mut self, msg: &SequencedOperation) -> bool {
        match self.pending.front() {
            Some(op) if op.client_seq == msg.client_seq => {}
            Some(op) => {
                tracing::warn!(
                    client = %self.client_id,
                    expected = op.client_seq,
                    received = msg.client_seq,
                    "Acknowledgement out of order; applying as remote op"
                );
                return false;
            }
            None => {
                tracing::debug!(
                    client = %self.client_id,
                    seq = msg.seq,
                    "Own op without pending entry; applying as remote op"
                );
                return false;
            }
        }
        let Some(op) = self.pending.pop_front() else {
            return false;
        };

        let client_seq = op.client_seq;
        for &key in &op.inserted {
            self.tree.update(key, |segment| {
                if segment.stamp.seq == Seq::Pending(client_seq) {
                    segment.stamp.seq = Seq::Acked(msg.seq);
                }
            });
        }
        for &key in &op.removed {
            let tombstoned = self.tree.update(key, |segment| {
                let removal = segment.removal.as_mut()?;
                if removal.local_seq != Some(client_seq) {
                    return None;
                }
                removal.local_seq = None;
                if removal.seq == Seq::Pending(client_seq) {
                    removal.seq = Seq::Acked(msg.seq);
                    return Some(());
                }
                None
            });
            if tombstoned.flatten().is_some() {
                self.tombstones.push(Reverse((msg.seq, key)));
            }
        }
        if op.dropped {
            tracing::debug!(client = %self.client_id, client_seq, "Dropped op acknowledged");
        }
        true
    }

    fn apply_sequenced(&mut self, msg: &SequencedOperation) {
        let has_pending = !self.pending.is_empty();
        if has_pending {
            self.rollback_pending();
        }

        let perspective = Perspective::new(msg.ref_seq, msg.client_id.clone());
        let checked = msg
            .op
            .validate()
            .map_err(MergeTreeError::from)
            .and_then(|()| self.check_references(&msg.op, &perspective));
        match checked {
            Ok(()) => {
                let ctx = ApplyCtx {
                    seq: Seq::Acked(msg.seq),
                    perspective,
                };
                self.apply_primitives(&msg.op, &ctx);
            }
            Err(error) => {
                tracing::warn!(
                    client = %self.client_id,
                    seq = msg.seq,
                    from = %msg.client_id,
                    %error,
                    "Dropping sequenced op"
                );
            }
        }

        if has_pending {
            self.replay_pending();
        }
    }

    fn rollback_pending(&mut self) {
        for index in (0..self.pending.len()).rev() {
            let op = &mut self.pending[index];
            let client_seq = op.client_seq;
            let inserted = std::mem::take(&mut op.inserted);
            let removed = std::mem::take(&mut op.removed);

            for key in removed {
                self.tree.update(key, |segment| {
                    revert_removal(segment, client_seq, &self.client_id)
                });
            }
            for key in inserted {
                if let Some(segment) = self.tree.remove(key) {
                    if let Some(marker) = segment.as_marker() {
                        self.markers.remove(&marker.id);
                    }
                }
            }
        }
    }

    fn replay_pending(&mut self) {
        let ops = std::mem::take(&mut self.pending);
        for mut op in ops {
            let perspective = Perspective::new(op.ref_seq, self.client_id.clone());
            if !op.dropped {
                if let Err(error) = self.check_references(&op.op, &perspective) {
                    tracing::warn!(
                        client = %self.client_id,
                        client_seq = op.client_seq,
                        %error,
                        "Dropping pending op invalidated by a concurrent change"
                    );
                    op.dropped = true;
                }
            }

            let replay = (!op.dropped).then(|| op.op.clone());
            let ctx = ApplyCtx {
                seq: Seq::Pending(op.client_seq),
                perspective,
            };
            self.pending.push_back(op);
            if let Some(replay) = replay {
                self.apply_primitives(&replay, &ctx);
            }
        }
    }

    /// Check every anchor of an op against the current state before mutating
    fn check_references(&self, op: &Operation, perspective: &Perspective) -> Result<()> {
        let mut introduced: HashSet<MarkerId> = HashSet::new();
        let mut length = self.tree.visible_len(View::At(perspective));

        for primitive in op.primitives() {
            match primitive {
                Operation::Insert(insert) => {
                    match insert.reference()? {
                        ReferencePosition::Marker(anchor) => {
                            if !introduced.contains(&anchor.id) {
                                self.check_anchor(&anchor.id)?;
                            }
                        }
                        ReferencePosition::Absolute(position) => {
                            if position > length {
                                return Err(
                                    ValidationError::PositionOutOfBounds { position, length }.into()
                                );
                            }
                        }
                    }
                    if let Some(id) = insert.marker_id() {
                        if self.markers.contains_key(&id) || introduced.contains(&id) {
                            return Err(ValidationError::DuplicateMarkerId(id).into());
                        }
                        introduced.insert(id);
                    }
                    length += match insert.content()? {
                        Content::Text(text) => text.graphemes(true).count(),
                        Content::Marker(_) => 1,
                    };
                }
                Operation::Remove(remove) => match remove.target()? {
                    RemoveTarget::Marker(id) => {
                        if introduced.contains(id) {
                            length = length.saturating_sub(1);
                            continue;
                        }
                        let segment = self
                            .markers
                            .get(id)
                            .and_then(|key| self.tree.get(*key))
                            .ok_or_else(|| ValidationError::UnknownMarker(id.to_string()))?;
                        if segment.visible_in(perspective) {
                            length = length.saturating_sub(1);
                        }
                    }
                    RemoveTarget::Range { start, end } => {
                        if end > length {
                            return Err(ValidationError::PositionOutOfBounds {
                                position: end,
                                length,
                            }
                            .into());
                        }
                        length -= end - start;
                    }
                },
                Operation::Group(_) => return Err(ValidationError::NestedGroup.into()),
            }
        }
        Ok(())
    }

    fn check_anchor(&self, id: &str) -> Result<()> {
        match self.markers.get(id).and_then(|key| self.tree.get(*key)) {
            None => Err(ValidationError::UnknownMarker(id.to_string()).into()),
            Some(segment) if segment.is_removed() => {
                Err(MergeTreeError::reference_not_found(format!("marker {}", id)))
            }
            Some(_) => Ok(()),
        }
    }

    fn apply_primitives(&mut self, op: &Operation, ctx: &ApplyCtx) {
        for primitive in op.primitives() {
            match primitive {
                Operation::Insert(insert) => self.apply_insert(insert, ctx),
                Operation::Remove(remove) => self.apply_remove(remove, ctx),
                Operation::Group(_) => {}
            }
        }
    }

    fn apply_insert(&mut self, insert: &InsertOp, ctx: &ApplyCtx) {
        let Some(segment) = Segment::from_insert(insert, ctx.stamp()) else {
            return;
        };
        let key = match insert.reference() {
            Ok(ReferencePosition::Marker(anchor)) => {
                let Some(&marker) = self.markers.get(&anchor.id) else {
                    return;
                };
                if anchor.before {
                    self.tree.insert_before(marker, segment)
                } else {
                    let prev = self.skip_unseen(Some(marker), &ctx.perspective);
                    self.tree.insert_after(prev, segment)
                }
            }
            Ok(ReferencePosition::Absolute(position)) => {
                self.insert_at(position, segment, &ctx.perspective)
            }
            Err(_) => return,
        };

        if let Some(id) = insert.marker_id() {
            self.markers.insert(id, key);
        }
        self.record(ctx, |op| op.inserted.push(key));
    }

    /// Insert at the boundary after visible unit `position - 1`
    fn insert_at(&mut self, position: usize, segment: Segment, perspective: &Perspective) -> SegKey {
        let prev = if position == 0 {
            None
        } else {
            match self.tree.seek(position - 1, View::At(perspective)) {
                Some((key, offset)) => {
                    let len = self.tree.get(key).map_or(0, Segment::len);
                    if offset + 1 < len {
                        if let Some(right) = self.split_segment(key, offset + 1) {
                            return self.tree.insert_before(right, segment);
                        }
                    }
                    Some(key)
                }
                None => self.tree.last(),
            }
        };
        let prev = self.skip_unseen(prev, perspective);
        self.tree.insert_after(prev, segment)
    }

    /// Advance past segments the perspective did not see
    ///
    /// Concurrent inserts at the same boundary that sequenced earlier are
    /// skipped, which keeps them in ascending `(seq, client)` order. Range
    /// marker tombstones the op knew about are never collected and act as
    /// fixed boundaries.
    fn skip_unseen(&self, prev: Option<SegKey>, perspective: &Perspective) -> Option<SegKey> {
        let mut prev = prev;
        let mut cursor = match prev {
            Some(key) => self.tree.next(key),
            None => self.tree.first(),
        };
        while let Some(key) = cursor {
            let stop = self.tree.get(key).is_some_and(|segment| {
                segment.visible_in(perspective)
                    || (!segment.is_collectable()
                        && perspective.observed(segment.stamp.seq, &segment.stamp.client_id))
            });
            if stop {
                break;
            }
            prev = Some(key);
            cursor = self.tree.next(key);
        }
        prev
    }

    fn apply_remove(&mut self, remove: &RemoveOp, ctx: &ApplyCtx) {
        match remove.target() {
            Ok(RemoveTarget::Marker(id)) => {
                if let Some(&key) = self.markers.get(id) {
                    self.mark_removed(key, ctx);
                }
            }
            Ok(RemoveTarget::Range { start, end }) => self.remove_range(start, end, ctx),
            Err(_) => {}
        }
    }

    fn remove_range(&mut self, start: usize, end: usize, ctx: &ApplyCtx) {
        let perspective = &ctx.perspective;
        let Some((mut key, offset)) = self.tree.seek(start, View::At(perspective)) else {
            return;
        };
        if offset > 0 {
            match self.split_segment(key, offset) {
                Some(right) => key = right,
                None => return,
            }
        }

        let mut remaining = end - start;
        let mut cursor = Some(key);
        while remaining > 0 {
            let Some(key) = cursor else {
                break;
            };
            let len = self.tree.get(key).map_or(0, |s| s.len_in(perspective));
            if len > 0 {
                if len > remaining {
                    self.split_segment(key, remaining);
                }
                self.mark_removed(key, ctx);
                remaining -= len.min(remaining);
            }
            cursor = self.tree.next(key);
        }
    }

    fn mark_removed(&mut self, key: SegKey, ctx: &ApplyCtx) {
        let client_id = ctx.perspective.client_id.as_str();
        let outcome = self.tree.update(key, |segment| match segment.removal.as_mut() {
            Some(removal) => {
                if removal.clients.iter().any(|c| c == client_id) {
                    return None;
                }
                removal.clients.push(client_id.to_string());
                if let Some(client_seq) = ctx.seq.pending() {
                    removal.local_seq = Some(client_seq);
                }
                Some(RemoveOutcome::JoinedRemovers)
            }
            None => {
                segment.removal = Some(Removal::new(ctx.seq, client_id));
                Some(RemoveOutcome::Tombstoned)
            }
        });

        match outcome.flatten() {
            None => {}
            Some(outcome) => {
                if let (RemoveOutcome::Tombstoned, Some(seq)) = (outcome, ctx.seq.acked()) {
                    self.tombstones.push(Reverse((seq, key)));
                }
                self.record(ctx, |op| op.removed.push(key));
            }
        }
    }

    /// Split a text segment, keeping pending bookkeeping in sync
    fn split_segment(&mut self, key: SegKey, offset: usize) -> Option<SegKey> {
        let right = self.tree.split(key, offset)?;
        let segment = self.tree.get(right)?;
        let inserted_by = segment.stamp.seq.pending();
        let removed_by = segment.removal.as_ref().and_then(|r| r.local_seq);
        let removed_at = segment.removal.as_ref().and_then(|r| r.seq.acked());

        for op in self.pending.iter_mut() {
            if Some(op.client_seq) == inserted_by {
                op.inserted.push(right);
            }
            if Some(op.client_seq) == removed_by {
                op.removed.push(right);
            }
        }
        if let Some(seq) = removed_at {
            self.tombstones.push(Reverse((seq, right)));
        }
        Some(right)
    }

    /// Attribute a segment change to the pending op being applied
    fn record(&mut self, ctx: &ApplyCtx, f: impl FnOnce(&mut PendingOp)) {
        if ctx.seq.pending().is_none() {
            return;
        }
        if let Some(op) = self.pending.back_mut() {
            f(op);
        }
    }

    fn notify(&mut self, kind: ChangeKind, seq: u64, client_id: &str) {
        self.version += 1;
        if self.listeners.is_empty() {
            return;
        }
        let change = StoreChange {
            kind,
            seq,
            client_id: client_id.to_string(),
        };
        for listener in &mut self.listeners {
            listener(&change);
        }
    }

    /// Acknowledged state: pending inserts dropped, pending removals reverted
    pub(crate) fn acked_segments(&self) -> Vec<Segment> {
        self.segments()
            .filter(|segment| !segment.is_pending())
            .map(|segment| {
                let mut segment = segment.clone();
                if let Some(client_seq) = segment.removal.as_ref().and_then(|r| r.local_seq) {
                    revert_removal(&mut segment, client_seq, &self.client_id);
                }
                segment
            })
            .collect()
    }

    /// Rebuild a replica from acknowledged segments
    pub(crate) fn from_acked_segments(
        client_id: impl Into<ClientId>,
        config: ReplicaConfig,
        seq: u64,
        min_seq: u64,
        segments: Vec<Segment>,
    ) -> Self {
        let mut replica = Self::with_config(client_id, config);
        replica.current_seq = seq;
        replica.min_seq = min_seq;
        replica.inbound = InboundBuffer::starting_after(seq);

        for mut segment in segments {
            segment.measure();
            let marker_id = match &segment.content {
                SegmentContent::Marker(marker) => Some(marker.id.clone()),
                SegmentContent::Text(_) => None,
            };
            let removed_at = segment.removal.as_ref().and_then(|r| r.seq.acked());

            let key = replica.tree.push_back(segment);
            if let Some(id) = marker_id {
                replica.markers.insert(id, key);
            }
            if let Some(seq) = removed_at {
                replica.tombstones.push(Reverse((seq, key)));
            }
        }
        replica.tree.rebuild();
        replica
    }
}

fn revert_removal(segment: &mut Segment, client_seq: u64, client_id: &str) {
    let Some(removal) = segment.removal.as_mut() else {
        return;
    };
    if removal.local_seq != Some(client_seq) {
        return;
    }
    if removal.seq == Seq::Pending(client_seq) {
        segment.removal = None;
        return;
    }
    removal.local_seq = None;
    removal.clients.retain(|c| c != client_id);
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("client_id", &self.client_id)
            .field("current_seq", &self.current_seq)
            .field("min_seq", &self.min_seq)
            .field("len", &self.len())
            .field("segments", &self.segment_count())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{MarkerBehavior, MarkerPosition};
    use crate::properties::{PropertySet, MARKER_ID};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn sequence(out: &OutboundOperation, seq: u64, min_seq: u64) -> SequencedOperation {
        SequencedOperation {
            seq,
            ref_seq: out.ref_seq,
            min_seq,
            client_id: out.client_id.clone(),
            client_seq: out.client_seq,
            op: out.op.clone(),
        }
    }

    fn marker_op(id: &str, at: ReferencePosition) -> Operation {
        let mut props = PropertySet::new();
        props.set(MARKER_ID, &id.to_string());
        InsertOp::marker(at, MarkerBehavior::Simple, props).into()
    }

    /// Sequence every outbound op of the given replicas (in order) and deliver to all
    fn sync(replicas: &mut [&mut Replica], next_seq: &mut u64) {
        let mut msgs = Vec::new();
        for replica in replicas.iter_mut() {
            for out in replica.take_outbound() {
                *next_seq += 1;
                msgs.push(sequence(&out, *next_seq, 0));
            }
        }
        for replica in replicas.iter_mut() {
            for msg in &msgs {
                replica.apply_remote(msg.clone());
            }
        }
    }

    #[test]
    fn test_local_insert_and_ack() {
        let mut a = Replica::new("A");
        let handle = a.apply_local(InsertOp::text(0, "hello").into()).unwrap();

        assert_eq!(a.text(), "hello");
        assert!(a.is_pending(handle));
        assert!(a.segments().all(Segment::is_pending));

        let out = a.take_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ref_seq, 0);
        a.apply_remote(sequence(&out[0], 1, 0));

        assert!(!a.is_pending(handle));
        assert_eq!(a.current_seq(), 1);
        assert!(a.segments().all(|s| s.stamp().seq == Seq::Acked(1)));
    }

    #[test]
    fn test_concurrent_inserts_order_by_seq() {
        let mut a = Replica::new("A");
        let mut b = Replica::new("B");
        a.apply_local(InsertOp::text(0, "a").into()).unwrap();
        b.apply_local(InsertOp::text(0, "b").into()).unwrap();

        let mut seq = 0;
        sync(&mut [&mut a, &mut b], &mut seq);

        assert_eq!(a.text(), "ab");
        assert_eq!(b.text(), "ab");
    }

    #[test]
    fn test_pending_op_replayed_over_remote() {
        let mut a = Replica::new("A");
        let mut b = Replica::new("B");
        let mut seq = 0;

        a.apply_local(InsertOp::text(0, "held").into()).unwrap();
        sync(&mut [&mut a, &mut b], &mut seq);

        // A appends locally while B prepends concurrently
        a.apply_local(InsertOp::text(4, "!").into()).unwrap();
        b.apply_local(InsertOp::text(0, "up").into()).unwrap();

        let b_out = b.take_outbound();
        seq += 1;
        let msg = sequence(&b_out[0], seq, 0);
        a.apply_remote(msg.clone());
        b.apply_remote(msg);

        assert_eq!(a.text(), "upheld!");
        assert_eq!(a.pending_count(), 1);

        sync(&mut [&mut a, &mut b], &mut seq);
        assert_eq!(a.text(), "upheld!");
        assert_eq!(b.text(), "upheld!");
        assert_eq!(a.pending_count(), 0);
    }

    #[test]
    fn test_split_pending_segment_acks_both_halves() {
        let mut a = Replica::new("A");
        a.apply_local(InsertOp::text(0, "hello").into()).unwrap();
        a.apply_local(InsertOp::text(2, "XY").into()).unwrap();
        assert_eq!(a.text(), "heXYllo");

        let out = a.take_outbound();
        a.apply_remote(sequence(&out[0], 1, 0));
        a.apply_remote(sequence(&out[1], 2, 0));

        assert_eq!(a.pending_count(), 0);
        assert!(a.segments().all(|s| !s.is_pending()));
        assert_eq!(a.text(), "heXYllo");
    }

    #[test]
    fn test_concurrent_remove_is_idempotent() {
        let mut a = Replica::new("A");
        let mut b = Replica::new("B");
        let mut seq = 0;

        a.apply_local(InsertOp::text(0, "abcdef").into()).unwrap();
        sync(&mut [&mut a, &mut b], &mut seq);

        a.apply_local(RemoveOp::range(1, 4).into()).unwrap();
        b.apply_local(RemoveOp::range(2, 5).into()).unwrap();
        sync(&mut [&mut a, &mut b], &mut seq);

        assert_eq!(a.text(), "af");
        assert_eq!(b.text(), "af");
    }

    #[test]
    fn test_local_anchor_errors() {
        let mut a = Replica::new("A");
        a.apply_local(marker_op("m", ReferencePosition::Absolute(0)))
            .unwrap();

        let unknown = a.apply_local(InsertOp {
            reference_position: Some(MarkerPosition::after("nope")),
            text: Some("x".to_string()),
            ..InsertOp::default()
        }
        .into());
        assert_eq!(
            unknown,
            Err(ValidationError::UnknownMarker("nope".to_string()).into())
        );

        a.apply_local(RemoveOp::marker("m").into()).unwrap();
        let removed = a.apply_local(InsertOp {
            reference_position: Some(MarkerPosition::before("m")),
            text: Some("x".to_string()),
            ..InsertOp::default()
        }
        .into());
        assert!(removed.unwrap_err().is_reference_not_found());

        let duplicate = a.apply_local(marker_op("m", ReferencePosition::Absolute(0)));
        assert_eq!(
            duplicate,
            Err(ValidationError::DuplicateMarkerId("m".to_string()).into())
        );

        let out_of_range = a.apply_local(InsertOp::text(5, "x").into());
        assert!(out_of_range.unwrap_err().is_validation());
        assert_eq!(a.pending_count(), 2, "Failed ops are never queued");
    }

    #[test]
    fn test_remote_op_on_removed_anchor_is_dropped() {
        let mut a = Replica::new("A");
        let mut b = Replica::new("B");
        let mut seq = 0;

        a.apply_local(marker_op("m", ReferencePosition::Absolute(0)))
            .unwrap();
        sync(&mut [&mut a, &mut b], &mut seq);

        // B removes the marker while A anchors text on it
        b.apply_local(RemoveOp::marker("m").into()).unwrap();
        a.apply_local(InsertOp {
            reference_position: Some(MarkerPosition::after("m")),
            text: Some("late".to_string()),
            ..InsertOp::default()
        }
        .into())
        .unwrap();
        assert_eq!(a.text(), "late");

        sync(&mut [&mut b, &mut a], &mut seq);
        assert_eq!(a.text(), "");
        assert_eq!(b.text(), "");
        assert_eq!(a.pending_count(), 0);
    }

    #[test]
    fn test_remove_at_max_offset_is_rejected() {
        let op: Operation = RemoveOp {
            absolute_position: Some(usize::MAX),
            ..RemoveOp::default()
        }
        .into();

        let mut a = Replica::new("A");
        a.apply_local(InsertOp::text(0, "abc").into()).unwrap();
        let local = a.apply_local(op.clone());
        assert!(local.unwrap_err().is_validation());
        assert_eq!(a.pending_count(), 1);

        let out = a.take_outbound();
        a.apply_remote(sequence(&out[0], 1, 0));
        a.apply_remote(SequencedOperation {
            seq: 2,
            ref_seq: 1,
            min_seq: 0,
            client_id: "B".to_string(),
            client_seq: 1,
            op,
        });
        assert_eq!(a.current_seq(), 2);
        assert_eq!(a.text(), "abc");
    }

    #[test]
    fn test_remote_group_with_one_bad_anchor_is_dropped_whole() {
        let mut a = Replica::new("A");
        a.apply_local(InsertOp::text(0, "base").into()).unwrap();
        let out = a.take_outbound();
        a.apply_remote(sequence(&out[0], 1, 0));

        let group = Operation::group(vec![
            marker_op("fresh", ReferencePosition::Absolute(0)),
            InsertOp {
                reference_position: Some(MarkerPosition::after("missing")),
                text: Some("tail".to_string()),
                ..InsertOp::default()
            }
            .into(),
        ]);
        a.apply_remote(SequencedOperation {
            seq: 2,
            ref_seq: 1,
            min_seq: 0,
            client_id: "B".to_string(),
            client_seq: 1,
            op: group,
        });

        assert_eq!(a.current_seq(), 2);
        assert_eq!(a.text(), "base");
        assert!(a.marker("fresh").is_none());
        assert_eq!(a.len(), 4);
    }

    #[test]
    fn test_duplicate_and_out_of_order_delivery() {
        let mut a = Replica::new("A");
        let mut b = Replica::new("B");
        a.apply_local(InsertOp::text(0, "x").into()).unwrap();
        a.apply_local(InsertOp::text(1, "y").into()).unwrap();
        let out = a.take_outbound();
        let first = sequence(&out[0], 1, 0);
        let second = sequence(&out[1], 2, 0);

        b.apply_remote(second.clone());
        assert_eq!(b.text(), "");
        assert_eq!(b.buffered_count(), 1);

        b.apply_remote(first.clone());
        b.apply_remote(first);
        b.apply_remote(second);
        assert_eq!(b.text(), "xy");
        assert_eq!(b.current_seq(), 2);
        assert_eq!(b.buffered_count(), 0);
    }

    #[test]
    fn test_tombstones_collected_below_min_seq() {
        let mut a = Replica::new("A");
        a.apply_local(InsertOp::text(0, "abc").into()).unwrap();
        a.apply_local(RemoveOp::range(0, 2).into()).unwrap();
        let out = a.take_outbound();
        a.apply_remote(sequence(&out[0], 1, 0));
        a.apply_remote(sequence(&out[1], 2, 1));
        assert_eq!(a.segment_count(), 2);

        let next = a.apply_local(InsertOp::text(1, "d").into()).unwrap();
        let out = a.take_outbound();
        a.apply_remote(sequence(&out[0], 3, 2));

        assert!(!a.is_pending(next));
        assert_eq!(a.text(), "cd");
        assert_eq!(a.segment_count(), 2, "Removed run should be collected");
    }

    #[test]
    fn test_range_marker_tombstones_are_kept() {
        let mut a = Replica::new("A");
        let mut props = PropertySet::new();
        props.set(MARKER_ID, &"begin".to_string());
        a.apply_local(
            InsertOp::marker(ReferencePosition::Absolute(0), MarkerBehavior::RangeBegin, props)
                .into(),
        )
        .unwrap();
        a.apply_local(RemoveOp::marker("begin").into()).unwrap();
        let out = a.take_outbound();
        a.apply_remote(sequence(&out[0], 1, 0));
        a.apply_remote(sequence(&out[1], 2, 2));

        assert_eq!(a.collect_tombstones(), 0);
        assert!(a.marker("begin").is_some_and(Segment::is_removed));
    }

    #[test]
    fn test_subscribe_reports_change_kinds() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);

        let mut a = Replica::new("A");
        a.subscribe(move |change| sink.borrow_mut().push(change.kind));

        a.apply_local(InsertOp::text(0, "x").into()).unwrap();
        let out = a.take_outbound();
        a.apply_remote(sequence(&out[0], 1, 0));

        let mut b = Replica::new("B");
        b.apply_local(InsertOp::text(0, "y").into()).unwrap();
        let out = b.take_outbound();
        a.apply_remote(sequence(&out[0], 2, 0));

        assert_eq!(
            *seen.borrow(),
            vec![ChangeKind::Local, ChangeKind::Acknowledged, ChangeKind::Remote]
        );
        assert_eq!(a.version(), 3);
    }

    #[test]
    fn test_locate_marker_and_node_ids() {
        let mut a = Replica::new("A");
        a.apply_local(InsertOp::text(0, "abc").into()).unwrap();
        a.apply_local(marker_op("A_Node0", ReferencePosition::Absolute(2)))
            .unwrap();

        let location = a.locate_marker("A_Node0").unwrap();
        assert_eq!(location.offset, 2);
        assert!(location.pending);
        assert!(!location.removed);

        assert_eq!(a.next_node_id(), "A_Node1", "Taken ids are skipped");
        assert_eq!(a.next_node_id(), "A_Node2");
    }

    #[test]
    fn test_acked_segments_exclude_pending() {
        let mut a = Replica::new("A");
        let mut b = Replica::new("B");
        let mut seq = 0;
        a.apply_local(InsertOp::text(0, "base").into()).unwrap();
        sync(&mut [&mut a, &mut b], &mut seq);

        a.apply_local(InsertOp::text(4, "+").into()).unwrap();
        a.apply_local(RemoveOp::range(0, 1).into()).unwrap();
        assert_eq!(a.text(), "ase+");

        let acked: String = a
            .acked_segments()
            .iter()
            .filter(|s| !s.is_removed())
            .filter_map(Segment::as_text)
            .collect();
        assert_eq!(acked, "base");
    }
}
