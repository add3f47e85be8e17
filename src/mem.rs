//! Deferred reclamation contract
//!
//! Structures that republish internal storage (the hash set swaps whole
//! maps on growth) retire the old allocation through a caller-supplied
//! [`Reclaimer`]. The `deferred` flag tells the reclaimer whether
//! concurrent readers may still hold references into the block, in
//! which case disposal must wait for a grace period — typically by
//! handing the [`Retired`] block to an epoch record via
//! [`crate::epoch::Record::defer_retired`].

/// A type-erased retired allocation awaiting disposal.
pub struct Retired {
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
}

// SAFETY: a Retired block is exclusively owned; the disposal function
// is the only remaining way to touch the pointee.
unsafe impl Send for Retired {}

impl Retired {
    /// Erase a boxed allocation into a retired block.
    pub fn from_box<T>(value: Box<T>) -> Self {
        unsafe fn drop_box<T>(ptr: *mut ()) {
            drop(unsafe { Box::from_raw(ptr as *mut T) });
        }

        Self {
            ptr: Box::into_raw(value) as *mut (),
            drop_fn: drop_box::<T>,
        }
    }

    /// Run the disposal function now.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no thread can still observe the
    /// retired allocation (a grace period has elapsed, or the structure
    /// was never shared).
    pub unsafe fn dispose(self) {
        unsafe { (self.drop_fn)(self.ptr) };
    }
}

/// Disposal policy for retired allocations.
pub trait Reclaimer {
    /// Dispose of `retired`, immediately or after a grace period.
    ///
    /// # Safety
    ///
    /// When `deferred` is true, concurrent readers may still hold
    /// references into the block; the implementation must not free it
    /// before a grace period has elapsed. When `deferred` is false the
    /// block is already quiesced and may be freed inline.
    unsafe fn reclaim(&self, retired: Retired, deferred: bool);
}

/// Immediate disposal.
///
/// Correct only when the owning structure is not visible to concurrent
/// readers (single-threaded use, or the caller quiesces readers by
/// other means).
#[derive(Debug, Default, Clone, Copy)]
pub struct DropNow;

impl Reclaimer for DropNow {
    unsafe fn reclaim(&self, retired: Retired, _deferred: bool) {
        unsafe { retired.dispose() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_retired_disposes_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let retired = Retired::from_box(Box::new(Tracked(drops.clone())));
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        unsafe { retired.dispose() };
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drop_now_reclaims_inline() {
        let drops = Arc::new(AtomicUsize::new(0));
        let retired = Retired::from_box(Box::new(Tracked(drops.clone())));
        unsafe { DropNow.reclaim(retired, false) };
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
