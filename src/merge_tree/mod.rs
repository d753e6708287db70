//! Merge tree: the replicated segment sequence
//!
//! This module implements the collaborative sequence at the core of the crate:
//! - Segments (text runs and markers) stamped with `(seq, client)` keys
//! - Tombstones that stay visible to ops issued before the removal
//! - An arena B-tree for sub-linear offset lookups from any perspective
//! - Optimistic local ops reconciled by rollback and replay
//! - A reorder buffer for sequenced messages
//!
//! # Convergence
//!
//! Every replica applies the same sequenced ops in the same order and each op
//! is interpreted from the perspective it was issued in, so replicas that
//! have applied the same prefix hold the same visible sequence.
//!
//! # Example
//!
//! ```rust
//! use mergetree_core::{InsertOp, Replica, Sequencer};
//!
//! let mut sequencer = Sequencer::new();
//! let mut a = Replica::new("A");
//! let mut b = Replica::new("B");
//! sequencer.join("A");
//! sequencer.join("B");
//!
//! // Concurrent inserts at the same offset
//! a.apply_local(InsertOp::text(0, "Hello").into()).unwrap();
//! b.apply_local(InsertOp::text(0, "World").into()).unwrap();
//!
//! let mut sequenced = Vec::new();
//! for op in a.take_outbound().into_iter().chain(b.take_outbound()) {
//!     sequenced.push(sequencer.submit(op));
//! }
//! for msg in sequenced {
//!     a.apply_remote(msg.clone());
//!     b.apply_remote(msg);
//! }
//!
//! // Both replicas converge, earlier sequence number first
//! assert_eq!(a.text(), "HelloWorld");
//! assert_eq!(a.text(), b.text());
//! ```

mod inbound;
mod replica;
mod segment;
mod stamp;
mod tree;

pub use replica::{ChangeKind, LocalHandle, MarkerLocation, Replica, StoreChange};
pub use segment::{Marker, Removal, Segment, SegmentContent};
pub use stamp::{OpCounter, Perspective, Seq, Stamp};
