//! MergeTree Core - replicated sequence with marker-derived overlay trees
//!
//! This crate implements a collaborative sequence of text runs and markers
//! that every replica converges on once it has applied the same totally
//! ordered stream of operations. It implements:
//! - Segment store with sequence-number stamped inserts and tombstones
//! - Optimistic local edits reconciled against the ordering service
//! - Reference positions anchored to markers instead of offsets
//! - Overlay trees encoded as begin/end marker pairs (feature `overlay`)
//!
//! # Examples
//!
//! ```rust
//! use mergetree_core::{InsertOp, Replica, Sequencer};
//!
//! let mut sequencer = Sequencer::new();
//! let mut alice = Replica::new("alice");
//! sequencer.join(alice.client_id());
//!
//! alice.apply_local(InsertOp::text(0, "hello").into()).unwrap();
//! for op in alice.take_outbound() {
//!     let msg = sequencer.submit(op);
//!     alice.apply_remote(msg);
//! }
//!
//! assert_eq!(alice.text(), "hello");
//! assert_eq!(alice.pending_count(), 0);
//! ```

pub mod config;
pub mod error;
pub mod merge_tree;
pub mod ops;
pub mod properties;
pub mod resolver;
pub mod sequencer;
pub mod snapshot;

#[cfg(feature = "overlay")]
pub mod overlay;

// Re-exports for convenience
pub use config::ReplicaConfig;
pub use error::{MergeTreeError, Result, ValidationError};
pub use merge_tree::{ChangeKind, LocalHandle, Replica, Segment, StoreChange};
pub use ops::{
    InsertOp, MarkerBehavior, MarkerPosition, Operation, OutboundOperation, ReferencePosition,
    RemoveOp, SequencedOperation,
};
pub use properties::PropertySet;
pub use resolver::{resolve, Fallback};
pub use sequencer::Sequencer;
pub use snapshot::{InMemorySnapshotStorage, Snapshot, SnapshotStorage};

/// Client identifier type
pub type ClientId = String;

/// Marker identifier type
pub type MarkerId = String;

/// Generate a random client identifier
pub fn random_client_id() -> ClientId {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_client_ids_are_unique() {
        let a = random_client_id();
        let b = random_client_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
