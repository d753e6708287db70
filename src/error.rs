//! Error types for merge-tree operations
//!
//! Local, user-facing calls fail fast with a [`MergeTreeError`]. Anomalies in
//! the reconciliation layer (out-of-order delivery, remote ops that reference
//! markers which no longer exist) are absorbed by the replica and only logged.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, MergeTreeError>;

/// Errors surfaced to callers of the public API
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeTreeError {
    /// Malformed or unanchorable local operation; never transmitted
    #[error("invalid operation: {0}")]
    Validation(#[from] ValidationError),

    /// A reference could not be mapped to a live position
    #[error("reference not found: {reference}")]
    ReferenceNotFound { reference: String },

    /// Snapshot could not be encoded, decoded or rehydrated
    #[error("snapshot error: {reason}")]
    Snapshot { reason: String },
}

impl MergeTreeError {
    pub(crate) fn reference_not_found(reference: impl Into<String>) -> Self {
        MergeTreeError::ReferenceNotFound {
            reference: reference.into(),
        }
    }

    /// Check if this error is a validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, MergeTreeError::Validation(_))
    }

    /// Check if this error is an unresolvable reference
    pub fn is_reference_not_found(&self) -> bool {
        matches!(self, MergeTreeError::ReferenceNotFound { .. })
    }
}

/// Structural problems with an operation, detected before it is applied
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Neither a reference position nor an absolute position was given
    #[error("operation has no anchor")]
    MissingAnchor,

    /// Both a reference position and an absolute position were given
    #[error("operation has both a reference and an absolute position")]
    ConflictingAnchors,

    /// Insert carries neither text nor a marker, or carries both
    #[error("insert must carry exactly one of text or marker")]
    InvalidContent,

    /// Marker insert without a marker id property
    #[error("marker insert is missing its id")]
    MissingMarkerId,

    /// Groups may only contain inserts and removes
    #[error("groups cannot be nested")]
    NestedGroup,

    /// Group without any operation
    #[error("group is empty")]
    EmptyGroup,

    /// Anchor or remove target names a marker this replica has never seen
    #[error("unknown marker id: {0}")]
    UnknownMarker(String),

    /// A marker with this id already exists (or appears twice in one group)
    #[error("duplicate marker id: {0}")]
    DuplicateMarkerId(String),

    /// Offset beyond the end of the visible sequence
    #[error("position {position} out of bounds (length: {length})")]
    PositionOutOfBounds { position: usize, length: usize },

    /// Remove range with `end <= start`
    #[error("empty remove range {start}..{end}")]
    EmptyRange { start: usize, end: usize },

    /// Placement mode that needs a reference node was called without one
    #[error("placement {0} requires a reference node")]
    MissingReferenceNode(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_conversion() {
        let err: MergeTreeError = ValidationError::MissingAnchor.into();
        assert!(err.is_validation());
        assert!(!err.is_reference_not_found());
        assert_eq!(err.to_string(), "invalid operation: operation has no anchor");
    }

    #[test]
    fn test_reference_not_found_display() {
        let err = MergeTreeError::reference_not_found("marker A_Node0");
        assert!(err.is_reference_not_found());
        assert_eq!(err.to_string(), "reference not found: marker A_Node0");
    }
}
