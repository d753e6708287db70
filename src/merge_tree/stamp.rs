//! Sequence stamps: the ordering keys of inserts and removals
//!
//! Every segment remembers the sequence number of the op that inserted it and
//! the client that issued it. Local ops that have not yet come back from the
//! ordering service carry a pending stamp that sorts after every acknowledged
//! one.

use crate::ClientId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Sequence number of an insert or removal
///
/// # Ordering
///
/// Acknowledged numbers order numerically. Pending stamps (keyed by the local
/// client sequence number) sort after every acknowledged one, in issue order.
///
/// # Example
///
/// ```rust
/// use mergetree_core::merge_tree::Seq;
///
/// assert!(Seq::Acked(1) < Seq::Acked(2));
/// assert!(Seq::Acked(u64::MAX) < Seq::Pending(1));
/// assert!(Seq::Pending(1) < Seq::Pending(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Seq {
    /// Stamped by the ordering service
    Acked(u64),
    /// Local op awaiting acknowledgement, keyed by its client sequence number
    Pending(u64),
}

impl Seq {
    /// Check if the ordering service has stamped this event
    pub fn is_acked(&self) -> bool {
        matches!(self, Seq::Acked(_))
    }

    /// The acknowledged sequence number, if any
    pub fn acked(&self) -> Option<u64> {
        match self {
            Seq::Acked(seq) => Some(*seq),
            Seq::Pending(_) => None,
        }
    }

    /// The local client sequence number, if still pending
    pub fn pending(&self) -> Option<u64> {
        match self {
            Seq::Acked(_) => None,
            Seq::Pending(client_seq) => Some(*client_seq),
        }
    }
}

impl Ord for Seq {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Seq::Acked(a), Seq::Acked(b)) => a.cmp(b),
            (Seq::Pending(a), Seq::Pending(b)) => a.cmp(b),
            (Seq::Acked(_), Seq::Pending(_)) => Ordering::Less,
            (Seq::Pending(_), Seq::Acked(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seq::Acked(seq) => write!(f, "{}", seq),
            Seq::Pending(client_seq) => write!(f, "L{}", client_seq),
        }
    }
}

/// Insert key of a segment: `(seq, client)`
///
/// Concurrent inserts at the same anchor end up in ascending stamp order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stamp {
    pub seq: Seq,
    pub client_id: ClientId,
}

impl Stamp {
    pub fn new(seq: Seq, client_id: impl Into<ClientId>) -> Self {
        Self {
            seq,
            client_id: client_id.into(),
        }
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq
            .cmp(&other.seq)
            .then_with(|| self.client_id.cmp(&other.client_id))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.client_id, self.seq)
    }
}

/// The state an operation observed when it was issued
///
/// An op from `client_id` issued after applying `ref_seq` sees a segment iff
/// the segment was inserted at or below `ref_seq` or by `client_id`, and was
/// not removed at or below `ref_seq` or by `client_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Perspective {
    pub ref_seq: u64,
    pub client_id: ClientId,
}

impl Perspective {
    pub fn new(ref_seq: u64, client_id: impl Into<ClientId>) -> Self {
        Self {
            ref_seq,
            client_id: client_id.into(),
        }
    }

    /// Check if an event stamped `seq` by `client_id` happened in this view
    pub fn observed(&self, seq: Seq, client_id: &str) -> bool {
        client_id == self.client_id || seq.acked().is_some_and(|s| s <= self.ref_seq)
    }
}

/// Per-client operation counter
///
/// Hands out `client_seq` values for outbound ops, starting at 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCounter {
    value: u64,
}

impl OpCounter {
    pub fn new() -> Self {
        Self { value: 0 }
    }

    /// Last value handed out
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Increment and return the new value
    pub fn tick(&mut self) -> u64 {
        self.value += 1;
        self.value
    }
}
