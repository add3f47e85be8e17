//! Writer-preferred reader/writer spin lock
//!
//! Two words: a writer flag and a reader word. A writer announces
//! itself with a fetch-and-set, then waits for active readers to drain;
//! a reader increments the reader word, re-checks the writer flag, and
//! withdraws if a writer slipped in. Writers therefore take priority as
//! soon as they announce.
//!
//! The high half of the reader word carries a latch generation:
//! [`RwLock::write_latch`] is a writer-side acquisition whose presence
//! is visible to readers that enter through
//! [`RwLock::read_latchlock`], which spin while any latch is held
//! before running the normal reader protocol.
//!
//! All waiting is bounded-contention spinning with a pipeline hint per
//! iteration; the non-blocking `try` variants never spin.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam::utils::Backoff;

use crate::constants::RWLOCK_LATCH_SHIFT;
use crate::fence;

const LATCH_ONE: u32 = 1 << RWLOCK_LATCH_SHIFT;
const LATCH_WRITE_MASK: u32 = (u16::MAX as u32) << RWLOCK_LATCH_SHIFT;
const LATCH_READ_MASK: u32 = u16::MAX as u32;

/// Writer-preferred reader/writer lock.
pub struct RwLock {
    writer: AtomicU32,
    n_readers: AtomicU32,
}

impl RwLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        Self {
            writer: AtomicU32::new(0),
            n_readers: AtomicU32::new(0),
        }
    }

    /// True if a writer or any reader holds the lock.
    pub fn locked(&self) -> bool {
        fence::load();
        let writer = self.writer.load(Ordering::Relaxed);
        fence::load();
        self.n_readers.load(Ordering::Relaxed) | writer != 0
    }

    /// True if a writer holds (or is acquiring) the lock.
    pub fn locked_writer(&self) -> bool {
        fence::load();
        self.writer.load(Ordering::Relaxed) != 0
    }

    /// True if any reader holds the lock.
    pub fn locked_reader(&self) -> bool {
        fence::load();
        self.n_readers.load(Ordering::Relaxed) & LATCH_READ_MASK != 0
    }

    /// Acquire the lock exclusively.
    pub fn write_lock(&self) {
        let backoff = Backoff::new();
        while self.writer.swap(1, Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
        fence::atomic_load();

        let backoff = Backoff::new();
        while self.n_readers.load(Ordering::Relaxed) & LATCH_READ_MASK != 0 {
            backoff.snooze();
        }
    }

    /// Attempt to acquire the lock exclusively without spinning.
    pub fn write_trylock(&self) -> bool {
        if self.writer.swap(1, Ordering::SeqCst) != 0 {
            return false;
        }
        fence::atomic_load();

        if self.n_readers.load(Ordering::Relaxed) != 0 {
            self.write_unlock();
            return false;
        }

        true
    }

    /// Release an exclusive acquisition.
    pub fn write_unlock(&self) {
        fence::release();
        self.writer.store(0, Ordering::Relaxed);
    }

    /// Trade an exclusive acquisition for a read-side one without a
    /// window where neither is held.
    pub fn write_downgrade(&self) {
        self.n_readers.fetch_add(1, Ordering::SeqCst);
        self.write_unlock();
    }

    /// Raise a latch generation in the reader word. Pair with
    /// [`RwLock::write_unlatch`]; readers entering through
    /// [`RwLock::read_latchlock`] wait the latch out.
    pub fn write_latch(&self) {
        let mut snapshot = self.n_readers.load(Ordering::Relaxed);
        loop {
            let delta = snapshot.wrapping_add(LATCH_ONE);
            match self.n_readers.compare_exchange(
                snapshot,
                delta,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => {
                    snapshot = observed;
                    fence::pause();
                }
            }
        }
    }

    /// Drop the latch generation, discarding reader-count noise that
    /// accumulated while it was up.
    pub fn write_unlatch(&self) {
        let mut snapshot = self.n_readers.load(Ordering::Relaxed);
        loop {
            let delta = (snapshot & LATCH_WRITE_MASK).wrapping_sub(LATCH_ONE);
            match self.n_readers.compare_exchange(
                snapshot,
                delta,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => {
                    snapshot = observed;
                    fence::pause();
                }
            }
        }
    }

    /// Acquire the lock shared.
    pub fn read_lock(&self) {
        let backoff = Backoff::new();
        loop {
            while self.writer.load(Ordering::Relaxed) != 0 {
                backoff.snooze();
            }

            self.n_readers.fetch_add(1, Ordering::SeqCst);

            // Serialize with respect to a concurrent writer acquisition.
            fence::atomic_load();

            if self.writer.load(Ordering::Relaxed) == 0 {
                break;
            }

            self.n_readers.fetch_sub(1, Ordering::SeqCst);
        }

        fence::load();
    }

    /// Attempt to acquire the lock shared without spinning.
    pub fn read_trylock(&self) -> bool {
        if self.writer.load(Ordering::Relaxed) != 0 {
            return false;
        }

        self.n_readers.fetch_add(1, Ordering::SeqCst);
        fence::atomic_load();

        if self.writer.load(Ordering::Relaxed) == 0 {
            fence::load();
            return true;
        }

        self.n_readers.fetch_sub(1, Ordering::SeqCst);
        false
    }

    /// Reader acquisition that also waits out any pending latch.
    pub fn read_latchlock(&self) {
        let backoff = Backoff::new();
        loop {
            while self.writer.load(Ordering::Relaxed) != 0 {
                backoff.snooze();
            }

            let snapshot = self.n_readers.fetch_add(1, Ordering::SeqCst);
            if snapshot >> RWLOCK_LATCH_SHIFT != 0 {
                // A latch is up; withdraw and wait for it to clear.
                let mut observed = snapshot;
                loop {
                    fence::pause();
                    observed = self.n_readers.load(Ordering::Relaxed);
                    if observed >> RWLOCK_LATCH_SHIFT == 0 {
                        break;
                    }
                }
                let _ = self.n_readers.compare_exchange(
                    observed.wrapping_add(1),
                    observed,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                );
                continue;
            }

            fence::atomic_load();

            if self.writer.load(Ordering::Relaxed) == 0 {
                // A latch raised across a writer section is guaranteed
                // visible once the writer flag reads clear.
                fence::load();
                if self.n_readers.load(Ordering::Relaxed) >> RWLOCK_LATCH_SHIFT != 0 {
                    continue;
                }
                break;
            }

            self.n_readers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Release a shared acquisition.
    pub fn read_unlock(&self) {
        fence::load();
        self.n_readers.fetch_sub(1, Ordering::SeqCst);
    }

    /// RAII exclusive acquisition.
    pub fn write(&self) -> WriteGuard<'_> {
        self.write_lock();
        WriteGuard { lock: self }
    }

    /// RAII shared acquisition.
    pub fn read(&self) -> ReadGuard<'_> {
        self.read_lock();
        ReadGuard { lock: self }
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the exclusive acquisition on drop.
pub struct WriteGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}

/// Releases the shared acquisition on drop.
pub struct ReadGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// Reader/writer lock with writer re-entry.
///
/// The writer word stores a caller-supplied non-zero id; the same id
/// may re-acquire without deadlocking. Reader semantics match
/// [`RwLock`].
pub struct RecursiveRwLock {
    rw: RwLock,
    wc: AtomicU32,
}

impl RecursiveRwLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        Self {
            rw: RwLock::new(),
            wc: AtomicU32::new(0),
        }
    }

    /// Acquire exclusively as `id` (non-zero), recursively if already
    /// held by `id`.
    pub fn write_lock(&self, id: u32) {
        debug_assert!(id != 0, "writer id 0 means unlocked");

        if self.rw.writer.load(Ordering::Relaxed) != id {
            let backoff = Backoff::new();
            while self
                .rw
                .writer
                .compare_exchange(0, id, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                backoff.snooze();
            }
            fence::atomic_load();

            let backoff = Backoff::new();
            while self.rw.n_readers.load(Ordering::Relaxed) != 0 {
                backoff.snooze();
            }
        }

        self.wc.fetch_add(1, Ordering::Relaxed);
    }

    /// Attempt an exclusive acquisition as `id` without spinning.
    pub fn write_trylock(&self, id: u32) -> bool {
        debug_assert!(id != 0, "writer id 0 means unlocked");

        if self.rw.writer.load(Ordering::Relaxed) != id {
            if self
                .rw
                .writer
                .compare_exchange(0, id, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                return false;
            }
            fence::atomic_load();

            if self.rw.n_readers.load(Ordering::Relaxed) != 0 {
                self.rw.writer.store(0, Ordering::Release);
                return false;
            }
        }

        self.wc.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release one level of exclusive acquisition.
    pub fn write_unlock(&self) {
        if self.wc.fetch_sub(1, Ordering::Relaxed) == 1 {
            fence::release();
            self.rw.writer.store(0, Ordering::Relaxed);
        }
    }

    /// Acquire shared.
    pub fn read_lock(&self) {
        self.rw.read_lock();
    }

    /// Attempt a shared acquisition without spinning.
    pub fn read_trylock(&self) -> bool {
        self.rw.read_trylock()
    }

    /// Release a shared acquisition.
    pub fn read_unlock(&self) {
        self.rw.read_unlock();
    }
}

impl Default for RecursiveRwLock {
    fn default() -> Self {
        Self::new()
    }
}
