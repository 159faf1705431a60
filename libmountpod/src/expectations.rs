//! Spawn-in-flight markers.
//!
//! Mount pod creation and its visibility through the list/watch path are not
//! atomic: a freshly created pod may not show up in a listing for a while.
//! [`Expectations`] records that a create for a given identity is already in
//! flight so rapid re-reconciliation does not spawn duplicates.
//!
//! Entries have no TTL; they are cleared only when the expected pod is next
//! observed. A permanently missing pod therefore leaks its entry, which is
//! acceptable: the entry only ever suppresses a duplicate spawn, and a
//! controller restart drops the whole set.

use dashmap::DashMap;

/// Concurrent set of outstanding spawn expectations, keyed by
/// [`crate::labels::PodLabelSelector::expectation_key`].
///
/// Owned by the reconciler instance that uses it; never process-global.
#[derive(Debug, Default)]
pub struct Expectations {
    pending: DashMap<String, ()>,
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a spawn for `key` as in flight.
    pub fn set_pending(&self, key: impl Into<String>) {
        self.pending.insert(key.into(), ());
    }

    /// Whether a spawn for `key` is still outstanding.
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Clear the marker for `key` once the pod has been observed.
    pub fn clear(&self, key: &str) {
        self.pending.remove(key);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_lifecycle() {
        let expectations = Expectations::new();
        assert!(!expectations.is_pending("k"));

        expectations.set_pending("k");
        assert!(expectations.is_pending("k"));
        assert_eq!(expectations.len(), 1);

        expectations.clear("k");
        assert!(!expectations.is_pending("k"));
        assert!(expectations.is_empty());
    }

    #[test]
    fn clear_unknown_key_is_noop() {
        let expectations = Expectations::new();
        expectations.clear("missing");
        assert!(expectations.is_empty());
    }
}
