//! Inbound reorder buffer
//!
//! The ordering service guarantees a total order but the transport may still
//! hand messages over out of order or more than once. Messages are held here
//! until every lower sequence number has been released.

use crate::ops::SequencedOperation;
use std::collections::BTreeMap;

/// Delivery anomalies; logged by the replica, never returned to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrderingViolation {
    /// `seq` was already applied
    Duplicate { seq: u64 },
    /// `seq` is already waiting in the buffer
    AlreadyBuffered { seq: u64 },
}

#[derive(Debug, Clone, Default)]
pub(crate) struct InboundBuffer {
    last_released: u64,
    waiting: BTreeMap<u64, SequencedOperation>,
}

impl InboundBuffer {
    /// Buffer that releases messages after `last_released`
    pub(crate) fn starting_after(last_released: u64) -> Self {
        Self {
            last_released,
            waiting: BTreeMap::new(),
        }
    }

    pub(crate) fn push(&mut self, msg: SequencedOperation) -> Result<(), OrderingViolation> {
        if msg.seq <= self.last_released {
            return Err(OrderingViolation::Duplicate { seq: msg.seq });
        }
        if self.waiting.contains_key(&msg.seq) {
            return Err(OrderingViolation::AlreadyBuffered { seq: msg.seq });
        }
        self.waiting.insert(msg.seq, msg);
        Ok(())
    }

    /// Next message in sequence, if it has arrived
    pub(crate) fn pop_ready(&mut self) -> Option<SequencedOperation> {
        let entry = self.waiting.first_entry()?;
        if *entry.key() != self.last_released + 1 {
            return None;
        }
        let msg = entry.remove();
        self.last_released = msg.seq;
        Some(msg)
    }

    /// Messages held back waiting for a gap to fill
    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }

    /// First missing sequence number, if anything is held back
    pub(crate) fn gap(&self) -> Option<u64> {
        if self.waiting.is_empty() {
            None
        } else {
            Some(self.last_released + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{InsertOp, Operation};

    fn msg(seq: u64) -> SequencedOperation {
        SequencedOperation {
            seq,
            ref_seq: 0,
            min_seq: 0,
            client_id: "B".to_string(),
            client_seq: seq,
            op: Operation::Insert(InsertOp::text(0, "x")),
        }
    }

    #[test]
    fn test_in_order_release() {
        let mut buffer = InboundBuffer::default();
        buffer.push(msg(1)).unwrap();
        assert_eq!(buffer.pop_ready().map(|m| m.seq), Some(1));
        assert!(buffer.pop_ready().is_none());
    }

    #[test]
    fn test_gap_holds_back() {
        let mut buffer = InboundBuffer::default();
        buffer.push(msg(3)).unwrap();
        buffer.push(msg(2)).unwrap();
        assert!(buffer.pop_ready().is_none());
        assert_eq!(buffer.gap(), Some(1));

        buffer.push(msg(1)).unwrap();
        let released: Vec<_> = std::iter::from_fn(|| buffer.pop_ready()).map(|m| m.seq).collect();
        assert_eq!(released, vec![1, 2, 3]);
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.gap(), None);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut buffer = InboundBuffer::starting_after(5);
        assert_eq!(buffer.push(msg(5)), Err(OrderingViolation::Duplicate { seq: 5 }));

        buffer.push(msg(7)).unwrap();
        assert_eq!(
            buffer.push(msg(7)),
            Err(OrderingViolation::AlreadyBuffered { seq: 7 })
        );
    }
}
