//! Helpers for testing [`ConsistentSampler`] implementations.
use crate::sampler::ConsistentSampler;
use crate::trace_state::{MAX_THRESHOLD, MIN_THRESHOLD};

/// Panics if `sampler` can break trace-wide consistency.
///
/// Checks, for every valid parent threshold, that a child threshold never
/// exceeds the parent's, that root thresholds do not depend on the parent
/// argument, and that every result is a valid threshold.
pub fn assert_consistent<S: ConsistentSampler + ?Sized>(sampler: &S) {
    let description = sampler.description();

    let root = sampler.compute_threshold(None, true);
    assert!(
        root <= MAX_THRESHOLD,
        "{} returned out of range root threshold {}",
        description,
        root
    );

    let without_parent = sampler.compute_threshold(None, false);
    assert!(
        without_parent <= MAX_THRESHOLD,
        "{} returned out of range threshold {} without a parent threshold",
        description,
        without_parent
    );

    for parent in MIN_THRESHOLD..=MAX_THRESHOLD {
        let child = sampler.compute_threshold(Some(parent), false);
        assert!(
            child <= parent,
            "{} widened the parent threshold: parent {}, child {}",
            description,
            parent,
            child
        );

        let root_with_parent = sampler.compute_threshold(Some(parent), true);
        assert_eq!(
            root_with_parent, root,
            "{} root threshold depends on the parent argument {}",
            description, parent
        );
    }
}
