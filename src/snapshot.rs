//! Snapshots of acknowledged replica state
//!
//! A snapshot captures the sequence as of a sequence number: only
//! acknowledged inserts and removals, tombstones included, so a replica
//! rehydrated from it interprets later ops exactly like the replicas that
//! never restarted.

use crate::config::ReplicaConfig;
use crate::error::{MergeTreeError, Result};
use crate::merge_tree::{Replica, Segment};
use crate::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Acknowledged state at `seq`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub seq: u64,
    pub min_seq: u64,
    pub segments: Vec<Segment>,
}

impl Snapshot {
    /// Encode as JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| MergeTreeError::Snapshot {
            reason: e.to_string(),
        })
    }

    /// Decode from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| MergeTreeError::Snapshot {
            reason: e.to_string(),
        })
    }

    /// Visible text as of the snapshot
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .filter(|segment| !segment.is_removed())
            .filter_map(Segment::as_text)
            .collect()
    }
}

impl Replica {
    /// Capture the acknowledged state
    ///
    /// Pending local ops are left out; they are still in flight and will come
    /// back through the ordering service.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            seq: self.current_seq(),
            min_seq: self.min_seq(),
            segments: self.acked_segments(),
        }
    }

    /// Rehydrate a replica from a snapshot
    ///
    /// The replica continues with the message after `snapshot.seq`.
    pub fn from_snapshot(
        client_id: impl Into<ClientId>,
        snapshot: Snapshot,
        config: ReplicaConfig,
    ) -> Result<Self> {
        if let Some(segment) = snapshot.segments.iter().find(|s| {
            s.is_pending() || s.removal().is_some_and(|r| !r.seq.is_acked())
        }) {
            return Err(MergeTreeError::Snapshot {
                reason: format!("segment stamped {} is not acknowledged", segment.stamp()),
            });
        }
        if snapshot.min_seq > snapshot.seq {
            return Err(MergeTreeError::Snapshot {
                reason: format!(
                    "min_seq {} is ahead of seq {}",
                    snapshot.min_seq, snapshot.seq
                ),
            });
        }

        Ok(Replica::from_acked_segments(
            client_id,
            config,
            snapshot.seq,
            snapshot.min_seq,
            snapshot.segments,
        ))
    }
}

/// Place to persist snapshots by document
pub trait SnapshotStorage {
    fn save(&mut self, document: &str, snapshot: &Snapshot) -> Result<()>;

    /// Latest saved snapshot, if any
    fn load(&self, document: &str) -> Result<Option<Snapshot>>;
}

/// Snapshot storage kept in memory as encoded bytes
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStorage {
    snapshots: HashMap<String, Vec<u8>>,
}

impl InMemorySnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl SnapshotStorage for InMemorySnapshotStorage {
    fn save(&mut self, document: &str, snapshot: &Snapshot) -> Result<()> {
        let bytes = snapshot.to_bytes()?;
        tracing::debug!(document, seq = snapshot.seq, bytes = bytes.len(), "Saved snapshot");
        self.snapshots.insert(document.to_string(), bytes);
        Ok(())
    }

    fn load(&self, document: &str) -> Result<Option<Snapshot>> {
        self.snapshots
            .get(document)
            .map(|bytes| Snapshot::from_bytes(bytes))
            .transpose()
    }
}
