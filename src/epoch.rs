//! Epoch-based memory reclamation
//!
//! Lets writers retire shared objects without coordinating per-object
//! with readers. Readers bracket their accesses with [`Record::begin`] /
//! [`Record::end`]; writers hand destructors to [`Record::defer`] and
//! periodically detect a grace period with [`Record::poll`] or block for
//! one with [`Record::synchronize`].
//!
//! ## Grace periods
//!
//! A reader section snapshots the global epoch and raises an active
//! flag. The global epoch only advances once every active record has
//! been observed at the current value, so active readers always sit at
//! the global epoch or one behind it. A destructor deferred while the
//! global epoch reads `e` therefore runs no earlier than `e + 2`: two
//! advances strand every reference that could have been taken at `e` or
//! `e + 1`. The blocking path drives three advances so that the
//! deferral-list index (epoch mod [`EPOCH_LENGTH`]) can also be reused
//! safely.
//!
//! ## Registry
//!
//! Records are pushed onto a lock-free registry stack and stay linked
//! for the lifetime of the [`Epoch`]. Dropping a [`Record`] flips it to
//! the free state; [`Epoch::recycle`] claims a free record instead of
//! allocating a new one.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use tracing::trace;

use crate::constants::{EPOCH_GRACE, EPOCH_LENGTH};
use crate::fence;
use crate::mem::Retired;

const STATE_USED: u32 = 0;
const STATE_FREE: u32 = 1;

type Deferred = Box<dyn FnOnce() + Send>;

struct RecordInner {
    state: AtomicU32,
    epoch: AtomicU32,
    active: AtomicU32,
    n_pending: AtomicU32,
    n_peak: AtomicU32,
    n_dispatch: AtomicU64,
    /// Deferral lists, indexed by epoch mod EPOCH_LENGTH. Touched only
    /// by the record's owning thread.
    pending: [UnsafeCell<Vec<Deferred>>; EPOCH_LENGTH],
    /// Registry link, written once before publication.
    next: AtomicPtr<RecordInner>,
}

// SAFETY: scanning threads only read the atomic fields; the deferral
// lists are accessed exclusively by the owning thread through Record.
unsafe impl Send for RecordInner {}
unsafe impl Sync for RecordInner {}

impl RecordInner {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(STATE_USED),
            epoch: AtomicU32::new(0),
            active: AtomicU32::new(0),
            n_pending: AtomicU32::new(0),
            n_peak: AtomicU32::new(0),
            n_dispatch: AtomicU64::new(0),
            pending: Default::default(),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn reset(&self) {
        self.active.store(0, Ordering::Relaxed);
        self.epoch.store(0, Ordering::Relaxed);
        self.n_dispatch.store(0, Ordering::Relaxed);
        self.n_peak.store(0, Ordering::Relaxed);
        self.n_pending.store(0, Ordering::Relaxed);
    }
}

/// Counters kept per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordStats {
    /// Deferred destructors not yet dispatched
    pub pending: u32,
    /// High-water mark of `pending`
    pub peak: u32,
    /// Total destructors dispatched through this record
    pub dispatched: u64,
}

/// Global epoch state. One per protected domain, owned by the caller.
pub struct Epoch {
    epoch: CachePadded<AtomicU32>,
    records: AtomicPtr<RecordInner>,
    n_free: AtomicU32,
}

impl Epoch {
    /// Create a new epoch domain with an empty registry.
    pub fn new() -> Self {
        Self {
            epoch: CachePadded::new(AtomicU32::new(1)),
            records: AtomicPtr::new(ptr::null_mut()),
            n_free: AtomicU32::new(0),
        }
    }

    /// Register a new participant record.
    ///
    /// The record is linked into the registry for the lifetime of the
    /// epoch domain; dropping the returned handle only marks it free
    /// for [`Epoch::recycle`].
    pub fn register(&self) -> Record<'_> {
        let inner = Box::into_raw(Box::new(RecordInner::new()));

        // Publish with release semantics so scanning threads observe an
        // initialized record.
        loop {
            let head = self.records.load(Ordering::Relaxed);
            unsafe { (*inner).next.store(head, Ordering::Relaxed) };
            if self
                .records
                .compare_exchange_weak(head, inner, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        Record {
            global: self,
            inner,
        }
    }

    /// Claim a previously unregistered record, if any.
    ///
    /// Avoids growing the registry when threads come and go. Uses an
    /// atomic swap plus re-check so two claimants cannot win the same
    /// record.
    pub fn recycle(&self) -> Option<Record<'_>> {
        if self.n_free.load(Ordering::Relaxed) == 0 {
            return None;
        }

        let mut cursor = self.records.load(Ordering::Acquire);
        while !cursor.is_null() {
            let record = unsafe { &*cursor };
            if record.state.load(Ordering::Relaxed) == STATE_FREE {
                // Serialize with respect to deferral list clean-up.
                fence::load();
                if record.state.swap(STATE_USED, Ordering::SeqCst) == STATE_FREE {
                    self.n_free.fetch_sub(1, Ordering::Relaxed);
                    return Some(Record {
                        global: self,
                        inner: cursor,
                    });
                }
            }
            cursor = record.next.load(Ordering::Relaxed);
        }

        None
    }

    /// Current value of the global epoch counter.
    pub fn current(&self) -> u32 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Scan the registry once for a used, active record whose snapshot
    /// lags `epoch`. Resumes from (and re-checks) `start` when given,
    /// so a stalled waiter keeps watching the same laggard. Reports
    /// whether any active record was seen at all.
    fn scan(
        &self,
        start: Option<&RecordInner>,
        epoch: u32,
        any_active: &mut bool,
    ) -> Option<&RecordInner> {
        *any_active = false;
        let mut cursor: *const RecordInner = match start {
            Some(record) => record,
            None => self.records.load(Ordering::Acquire),
        };

        while !cursor.is_null() {
            let record = unsafe { &*cursor };

            if record.state.load(Ordering::Relaxed) == STATE_FREE {
                cursor = record.next.load(Ordering::Relaxed);
                continue;
            }

            let active = record.active.load(Ordering::Relaxed);
            *any_active |= active != 0;

            if active != 0 && record.epoch.load(Ordering::Relaxed) != epoch {
                return Some(record);
            }

            cursor = record.next.load(Ordering::Relaxed);
        }

        None
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Epoch {
    fn drop(&mut self) {
        // Handles borrow the epoch, so none can be live here; reclaim
        // the registry allocations. Undispatched deferrals are dropped
        // without running.
        let mut cursor = *self.records.get_mut();
        while !cursor.is_null() {
            let record = unsafe { Box::from_raw(cursor) };
            cursor = record.next.load(Ordering::Relaxed);
        }
    }
}

/// A participant handle. One per thread; operations other than the
/// registry protocol must only be invoked by the owning thread.
pub struct Record<'e> {
    global: &'e Epoch,
    inner: *const RecordInner,
}

// SAFETY: ownership of a record may move between threads; the deferral
// lists only ever hold Send closures and everything else is atomic.
unsafe impl Send for Record<'_> {}

impl<'e> Record<'e> {
    #[inline(always)]
    fn inner(&self) -> &RecordInner {
        unsafe { &*self.inner }
    }

    /// Enter an epoch-protected section. Supports recursion; only the
    /// outermost entry observes a new epoch.
    #[inline]
    pub fn begin(&self) {
        let record = self.inner();

        if record.active.load(Ordering::Relaxed) == 0 {
            let epoch = self.global.epoch.load(Ordering::Relaxed);

            // Loads inside the section must not be reordered before the
            // active flag is committed, so publish it with a full
            // read-modify-write and serialize against subsequent loads.
            record.epoch.store(epoch, Ordering::Relaxed);
            record.active.swap(1, Ordering::SeqCst);
            fence::atomic_load();
            return;
        }

        let depth = record.active.load(Ordering::Relaxed);
        record.active.store(depth + 1, Ordering::Relaxed);
    }

    /// Leave an epoch-protected section.
    #[inline]
    pub fn end(&self) {
        let record = self.inner();
        fence::release();
        let depth = record.active.load(Ordering::Relaxed);
        record.active.store(depth - 1, Ordering::Relaxed);
    }

    /// True while the owning thread is inside a protected section.
    pub fn is_active(&self) -> bool {
        self.inner().active.load(Ordering::Relaxed) != 0
    }

    /// Defer `f` until a grace period has elapsed.
    ///
    /// The destructor runs on whichever thread later detects the grace
    /// period through this record. Destructors must not re-enter the
    /// epoch machinery (no nested deferral during dispatch).
    pub fn defer<F: FnOnce() + Send + 'static>(&self, f: F) {
        let record = self.inner();
        let epoch = self.global.epoch.load(Ordering::Relaxed);
        let offset = (epoch as usize) & (EPOCH_LENGTH - 1);

        record.n_pending.fetch_add(1, Ordering::Relaxed);
        unsafe { (*record.pending[offset].get()).push(Box::new(f)) };
    }

    /// Defer disposal of a retired allocation (see [`crate::mem`]).
    pub fn defer_retired(&self, retired: Retired) {
        self.defer(move || unsafe { retired.dispose() });
    }

    /// Dispatch the deferral list that epoch `e` indexes.
    fn dispatch(&self, e: u32) {
        let record = self.inner();
        let offset = (e as usize) & (EPOCH_LENGTH - 1);

        // Take the list first: a contract-violating re-entrant deferral
        // then lands in a fresh list instead of aliasing the drain.
        let batch = std::mem::take(unsafe { &mut *record.pending[offset].get() });
        let n = batch.len() as u32;

        for f in batch {
            f();
        }

        let pending = record.n_pending.load(Ordering::Relaxed);
        if pending > record.n_peak.load(Ordering::Relaxed) {
            record.n_peak.store(pending, Ordering::Relaxed);
        }

        if n > 0 {
            trace!(epoch = e, dispatched = n, "epoch dispatch");
            record.n_dispatch.fetch_add(u64::from(n), Ordering::Relaxed);
            record.n_pending.fetch_sub(n, Ordering::Relaxed);
        }
    }

    /// Dispatch every deferral list unconditionally.
    ///
    /// Only correct after a full grace period ([`Record::barrier`]) or
    /// at shutdown when no readers remain.
    pub fn reclaim(&self) {
        for e in 0..EPOCH_LENGTH as u32 {
            self.dispatch(e);
        }
    }

    /// Non-blocking grace-period detection.
    ///
    /// Scans the registry once. Returns `false` without progress when
    /// an active record lags the global epoch. Otherwise either every
    /// record was inactive — a full quiescence, all lists dispatch — or
    /// the global epoch is advanced by CAS and the newly safe list
    /// dispatches.
    pub fn poll(&self) -> bool {
        let record = self.inner();
        let epoch = self.global.epoch.load(Ordering::Relaxed);

        // Serialize record snapshots with respect to the epoch load.
        fence::memory();

        let mut any_active = false;
        if self.global.scan(None, epoch, &mut any_active).is_some() {
            record.epoch.store(epoch, Ordering::Relaxed);
            return false;
        }

        if !any_active {
            record.epoch.store(epoch, Ordering::Relaxed);
            for e in 0..EPOCH_LENGTH as u32 {
                self.dispatch(e);
            }
            return true;
        }

        let snapshot = match self.global.epoch.compare_exchange(
            epoch,
            epoch.wrapping_add(1),
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => epoch.wrapping_add(1),
            Err(observed) => observed,
        };
        record.epoch.store(snapshot, Ordering::Relaxed);

        self.dispatch(epoch.wrapping_add(1));
        true
    }

    /// Block until a grace period has elapsed.
    ///
    /// Must not be called from inside a protected section. Terminates
    /// after observing [`EPOCH_GRACE`] successful advances, or earlier
    /// when every record goes inactive.
    pub fn synchronize(&self) {
        let record = self.inner();
        let epoch = self.global.epoch.load(Ordering::Relaxed);
        let goal = epoch.wrapping_add(EPOCH_GRACE);
        let mut delta = epoch;

        // Make mutations before the barrier visible to the epoch
        // snapshots we are about to read.
        fence::memory();

        let mut i = 0;
        'grace: while i < EPOCH_GRACE - 1 {
            let mut reload = false;
            let mut any_active = false;
            let mut laggard: Option<&RecordInner> = None;

            loop {
                laggard = self.global.scan(laggard, delta, &mut any_active);
                if laggard.is_none() {
                    break;
                }

                fence::pause();

                // Another writer may have already observed a grace period.
                let observed = self.global.epoch.load(Ordering::Relaxed);
                if observed != delta {
                    delta = observed;
                    reload = true;
                    break;
                }
            }

            if !reload {
                if !any_active {
                    break 'grace;
                }

                // CAS rather than increment so concurrent writers
                // synchronizing against the same snapshot share one tick.
                match self.global.epoch.compare_exchange(
                    delta,
                    delta.wrapping_add(1),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        delta = delta.wrapping_add(1);
                        i += 1;
                        continue 'grace;
                    }
                    Err(observed) => delta = observed,
                }
            }

            // A generation we were waiting on has already been observed
            // elsewhere; no references to it can remain.
            if goal > epoch && delta >= goal {
                break 'grace;
            }

            i += 1;
        }

        record.epoch.store(delta, Ordering::Relaxed);
    }

    /// Blocking grace period followed by full reclamation.
    pub fn barrier(&self) {
        self.synchronize();
        self.reclaim();
    }

    /// Snapshot of this record's counters.
    pub fn stats(&self) -> RecordStats {
        let record = self.inner();
        RecordStats {
            pending: record.n_pending.load(Ordering::Relaxed),
            peak: record.n_peak.load(Ordering::Relaxed),
            dispatched: record.n_dispatch.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Record<'_> {
    fn drop(&mut self) {
        let record = self.inner();

        // Undispatched deferrals are dropped without running; callers
        // that need them executed run barrier() first.
        record.reset();
        for list in &record.pending {
            unsafe { (*list.get()).clear() };
        }

        fence::store();
        record.state.store(STATE_FREE, Ordering::Relaxed);
        self.global.n_free.fetch_add(1, Ordering::Relaxed);
    }
}
