//! Replica configuration

use serde::{Deserialize, Serialize};

/// Default range label recognised by overlay scans
pub const DEFAULT_OVERLAY_LABEL: &str = "onode";

/// Tunables for a [`Replica`](crate::Replica)
///
/// Every field has a default, so partial configs deserialize cleanly:
///
/// ```rust
/// use mergetree_core::ReplicaConfig;
///
/// let config: ReplicaConfig = serde_json::from_str(r#"{ "blockCapacity": 16 }"#).unwrap();
/// assert_eq!(config.block_capacity, 16);
/// assert!(config.collect_tombstones);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplicaConfig {
    /// Maximum number of children per segment-tree block (clamped to at least 4)
    pub block_capacity: usize,

    /// Physically drop tombstones once they fall below the minimum sequence number
    pub collect_tombstones: bool,

    /// Reorder-buffer size above which the replica logs a backlog warning
    pub max_buffered_ops: usize,

    /// Range label that marks overlay node markers
    pub overlay_label: String,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            block_capacity: 8,
            collect_tombstones: true,
            max_buffered_ops: 1024,
            overlay_label: DEFAULT_OVERLAY_LABEL.to_string(),
        }
    }
}
