//! Reference position resolution
//!
//! Turns a marker-relative or absolute reference into a current offset in the
//! local view. Nothing is cached; every call reads the live store.

use crate::error::{MergeTreeError, Result};
use crate::merge_tree::Replica;
use crate::ops::ReferencePosition;

/// What to do when the referenced marker is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fallback {
    /// Fail with `ReferenceNotFound`
    #[default]
    None,
    /// Resolve to the boundary where the tombstoned marker still sits
    NearestBoundary,
}

/// Resolve a reference position to an offset
///
/// `{id, before: true}` resolves to the marker's own offset, `{id, before:
/// false}` to the offset just after it. Absolute positions resolve to
/// themselves when they are within the sequence.
///
/// # Example
///
/// ```rust
/// use mergetree_core::{resolve, Fallback, InsertOp, MarkerBehavior, MarkerPosition, PropertySet, ReferencePosition, Replica};
/// use mergetree_core::properties::MARKER_ID;
///
/// let mut replica = Replica::new("A");
/// replica.apply_local(InsertOp::text(0, "abc").into()).unwrap();
///
/// let mut props = PropertySet::new();
/// props.set(MARKER_ID, &"m".to_string());
/// replica.apply_local(InsertOp::marker(ReferencePosition::Absolute(1), MarkerBehavior::Simple, props).into()).unwrap();
///
/// let before = ReferencePosition::Marker(MarkerPosition::before("m"));
/// let after = ReferencePosition::Marker(MarkerPosition::after("m"));
/// assert_eq!(resolve(&replica, &before, Fallback::None).unwrap(), 1);
/// assert_eq!(resolve(&replica, &after, Fallback::None).unwrap(), 2);
/// ```
pub fn resolve(replica: &Replica, reference: &ReferencePosition, fallback: Fallback) -> Result<usize> {
    match reference {
        ReferencePosition::Marker(position) => {
            let location = replica
                .locate_marker(&position.id)
                .ok_or_else(|| MergeTreeError::reference_not_found(reference.to_string()))?;

            if !location.removed {
                return Ok(if position.before {
                    location.offset
                } else {
                    location.offset + 1
                });
            }
            match fallback {
                Fallback::NearestBoundary => Ok(location.offset),
                Fallback::None => Err(MergeTreeError::reference_not_found(reference.to_string())),
            }
        }
        ReferencePosition::Absolute(offset) => {
            let len = replica.len();
            match fallback {
                _ if *offset <= len => Ok(*offset),
                Fallback::NearestBoundary => Ok(len),
                Fallback::None => Err(MergeTreeError::reference_not_found(reference.to_string())),
            }
        }
    }
}

/// Check whether a reference still resolves without a fallback
pub fn is_resolvable(replica: &Replica, reference: &ReferencePosition) -> bool {
    resolve(replica, reference, Fallback::None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{InsertOp, MarkerBehavior, MarkerPosition, RemoveOp};
    use crate::properties::{PropertySet, MARKER_ID};

    fn replica_with_marker() -> Replica {
        let mut replica = Replica::new("A");
        replica.apply_local(InsertOp::text(0, "hello").into()).unwrap();
        let mut props = PropertySet::new();
        props.set(MARKER_ID, &"m".to_string());
        replica
            .apply_local(
                InsertOp::marker(ReferencePosition::Absolute(2), MarkerBehavior::Simple, props)
                    .into(),
            )
            .unwrap();
        replica
    }

    #[test]
    fn test_resolve_before_and_after() {
        let replica = replica_with_marker();
        let before = ReferencePosition::Marker(MarkerPosition::before("m"));
        let after = ReferencePosition::Marker(MarkerPosition::after("m"));

        assert_eq!(resolve(&replica, &before, Fallback::None), Ok(2));
        assert_eq!(resolve(&replica, &after, Fallback::None), Ok(3));
    }

    #[test]
    fn test_resolve_follows_edits() {
        let mut replica = replica_with_marker();
        let before = ReferencePosition::Marker(MarkerPosition::before("m"));

        replica.apply_local(InsertOp::text(0, ">>").into()).unwrap();
        assert_eq!(resolve(&replica, &before, Fallback::None), Ok(4));

        replica.apply_local(RemoveOp::range(0, 3).into()).unwrap();
        assert_eq!(resolve(&replica, &before, Fallback::None), Ok(1));
    }

    #[test]
    fn test_removed_marker() {
        let mut replica = replica_with_marker();
        replica.apply_local(RemoveOp::marker("m").into()).unwrap();
        let after = ReferencePosition::Marker(MarkerPosition::after("m"));

        let err = resolve(&replica, &after, Fallback::None).unwrap_err();
        assert!(err.is_reference_not_found());
        assert!(!is_resolvable(&replica, &after));
        assert_eq!(resolve(&replica, &after, Fallback::NearestBoundary), Ok(2));
    }

    #[test]
    fn test_unknown_marker_has_no_fallback() {
        let replica = replica_with_marker();
        let missing = ReferencePosition::Marker(MarkerPosition::before("ghost"));
        assert!(resolve(&replica, &missing, Fallback::NearestBoundary).is_err());
    }

    #[test]
    fn test_absolute_positions() {
        let replica = replica_with_marker();
        assert_eq!(resolve(&replica, &ReferencePosition::Absolute(6), Fallback::None), Ok(6));
        assert!(resolve(&replica, &ReferencePosition::Absolute(7), Fallback::None).is_err());
        assert_eq!(
            resolve(&replica, &ReferencePosition::Absolute(7), Fallback::NearestBoundary),
            Ok(6)
        );
    }
}
