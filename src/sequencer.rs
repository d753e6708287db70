//! In-process ordering service
//!
//! Assigns consecutive sequence numbers to submitted ops and tracks the
//! collaboration window. Real deployments put a server here; the contract is
//! the same: total order, per-client FIFO, and a minimum sequence number that
//! never passes any connected client's reference floor.

use crate::ops::{OutboundOperation, SequencedOperation};
use crate::ClientId;
use std::collections::BTreeMap;

/// Total-order broadcaster
///
/// # Example
///
/// ```rust
/// use mergetree_core::{InsertOp, Replica, Sequencer};
///
/// let mut sequencer = Sequencer::new();
/// let mut replica = Replica::new("A");
/// sequencer.join("A");
///
/// replica.apply_local(InsertOp::text(0, "x").into()).unwrap();
/// let msg = sequencer.submit(replica.take_outbound().remove(0));
/// assert_eq!(msg.seq, 1);
/// assert_eq!(sequencer.log().len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    seq: u64,
    min_seq: u64,
    /// Reference floor reported by each connected client
    clients: BTreeMap<ClientId, u64>,
    log: Vec<SequencedOperation>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last sequence number handed out
    pub fn current_seq(&self) -> u64 {
        self.seq
    }

    /// Current collaboration window low-water mark
    pub fn min_seq(&self) -> u64 {
        self.min_seq
    }

    /// Connect a client; it starts out having observed everything sequenced so far
    pub fn join(&mut self, client_id: impl Into<ClientId>) {
        self.clients.insert(client_id.into(), self.seq);
    }

    /// Disconnect a client; it no longer holds back the window
    pub fn leave(&mut self, client_id: &str) {
        self.clients.remove(client_id);
        self.recompute_min_seq();
    }

    /// Record the oldest perspective a client may still issue ops from
    pub fn update_ref_seq(&mut self, client_id: &str, ref_seq: u64) {
        if let Some(floor) = self.clients.get_mut(client_id) {
            *floor = ref_seq.max(*floor);
        }
        self.recompute_min_seq();
    }

    /// Stamp an op with the next sequence number
    pub fn submit(&mut self, op: OutboundOperation) -> SequencedOperation {
        if op.ref_seq < self.min_seq {
            tracing::warn!(
                client = %op.client_id,
                ref_seq = op.ref_seq,
                min_seq = self.min_seq,
                "Op references state below the collaboration window"
            );
        }
        if !self.clients.contains_key(&op.client_id) {
            tracing::debug!(client = %op.client_id, "Submit from unknown client; joining it");
            self.clients.insert(op.client_id.clone(), op.ref_seq);
        }

        self.seq += 1;
        let msg = SequencedOperation {
            seq: self.seq,
            ref_seq: op.ref_seq,
            min_seq: self.min_seq,
            client_id: op.client_id,
            client_seq: op.client_seq,
            op: op.op,
        };
        self.log.push(msg.clone());
        msg
    }

    /// Every message sequenced so far
    pub fn log(&self) -> &[SequencedOperation] {
        &self.log
    }

    /// Messages with `seq > after`, for catching up a reconnecting replica
    pub fn since(&self, after: u64) -> &[SequencedOperation] {
        let start = self.log.partition_point(|msg| msg.seq <= after);
        &self.log[start..]
    }

    fn recompute_min_seq(&mut self) {
        let floor = self.clients.values().copied().min().unwrap_or(self.seq);
        self.min_seq = self.min_seq.max(floor.min(self.seq));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{InsertOp, Operation};

    fn outbound(client: &str, client_seq: u64, ref_seq: u64) -> OutboundOperation {
        OutboundOperation {
            client_id: client.to_string(),
            client_seq,
            ref_seq,
            op: Operation::Insert(InsertOp::text(0, "x")),
        }
    }

    #[test]
    fn test_consecutive_sequence_numbers() {
        let mut sequencer = Sequencer::new();
        sequencer.join("A");

        let first = sequencer.submit(outbound("A", 1, 0));
        let second = sequencer.submit(outbound("A", 2, 0));
        assert_eq!((first.seq, second.seq), (1, 2));
        assert_eq!(second.client_seq, 2);
    }

    #[test]
    fn test_min_seq_tracks_slowest_client() {
        let mut sequencer = Sequencer::new();
        sequencer.join("A");
        sequencer.join("B");
        for i in 1..=3 {
            sequencer.submit(outbound("A", i, 0));
        }

        sequencer.update_ref_seq("A", 3);
        assert_eq!(sequencer.min_seq(), 0, "B still at 0");

        sequencer.update_ref_seq("B", 2);
        assert_eq!(sequencer.min_seq(), 2);

        sequencer.leave("B");
        assert_eq!(sequencer.min_seq(), 3);

        let msg = sequencer.submit(outbound("A", 4, 3));
        assert_eq!(msg.min_seq, 3);
    }

    #[test]
    fn test_min_seq_never_decreases() {
        let mut sequencer = Sequencer::new();
        sequencer.join("A");
        sequencer.submit(outbound("A", 1, 0));
        sequencer.update_ref_seq("A", 1);
        assert_eq!(sequencer.min_seq(), 1);

        sequencer.join("late");
        sequencer.update_ref_seq("A", 1);
        assert_eq!(sequencer.min_seq(), 1);
    }

    #[test]
    fn test_since() {
        let mut sequencer = Sequencer::new();
        sequencer.join("A");
        for i in 1..=5 {
            sequencer.submit(outbound("A", i, 0));
        }
        let tail: Vec<_> = sequencer.since(3).iter().map(|m| m.seq).collect();
        assert_eq!(tail, vec![4, 5]);
        assert!(sequencer.since(5).is_empty());
    }
}
