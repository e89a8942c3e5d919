//! Toggle keys: the logical flags behind patch sites
//!
//! A key's logical state is an atomic reference count. `is_enabled` is a
//! plain atomic load - it never blocks and never takes the coordinator lock,
//! so the hot path that consults a flag costs one load even while a patch
//! pass is in flight. The physical code catches up under the coordinator
//! lock; until the pass commits, `is_enabled` reports the pre-transition
//! value.

use std::sync::{
    Arc,
    atomic::{AtomicI32, Ordering},
};

pub(crate) struct KeyInner {
    id: u64,
    /// Enable count. Logical state is count > 0; nested enables must be
    /// balanced by the same number of disables.
    count: AtomicI32,
}

/// Handle to a toggle key
///
/// Cloneable; all clones observe the same state. Keys are created by
/// [`Toggles::register_key`] and toggled through the coordinator, which
/// owns the patch side of the transition.
///
/// [`Toggles::register_key`]: crate::Toggles::register_key
#[derive(Clone)]
pub struct ToggleKey {
    inner: Arc<KeyInner>,
}

impl ToggleKey {
    pub(crate) fn new(id: u64, initial: bool) -> Self {
        Self {
            inner: Arc::new(KeyInner {
                id,
                count: AtomicI32::new(initial as i32),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(id: u64) -> Self {
        Self::new(id, false)
    }

    /// Numeric identity of this key, as stored in image key slots
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current logical state
    ///
    /// Lock-free: reads the enable count, not the physical code state.
    pub fn is_enabled(&self) -> bool {
        self.inner.count.load(Ordering::Acquire) > 0
    }

    /// Current enable count
    pub(crate) fn count(&self) -> i32 {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Publish a new enable count after the physical pass committed
    pub(crate) fn store_count(&self, count: i32) {
        self.inner.count.store(count, Ordering::Release);
    }
}

impl std::fmt::Debug for ToggleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToggleKey")
            .field("id", &self.inner.id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        assert!(!ToggleKey::new(0, false).is_enabled());
        assert!(ToggleKey::new(0, true).is_enabled());
    }

    #[test]
    fn test_clones_share_state() {
        let key = ToggleKey::new(1, false);
        let other = key.clone();
        key.store_count(2);
        assert!(other.is_enabled());
        assert_eq!(other.count(), 2);
    }
}
