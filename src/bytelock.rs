//! Byte-slotted reader/writer lock
//!
//! Replaces the shared reader counter with one byte per known reader,
//! so slotted readers announce themselves without contending on a
//! single cache line word. The byte array fills the remainder of a
//! cache line next to the owner and overflow-counter words; readers
//! that have no slot (or more readers than slots) fall back to the
//! counter path.
//!
//! Slot ids are caller-chosen, start at 1, and must be unique among
//! concurrent readers; [`ByteLock::UNSLOTTED`] selects the counter
//! path. A slotted reader holding the owner word may downgrade to its
//! byte without a window where it holds neither.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crossbeam::utils::Backoff;

use crate::constants::BYTELOCK_SLOTS;
use crate::fence;

/// Reader/writer lock with per-reader byte slots.
pub struct ByteLock {
    owner: AtomicU32,
    n_readers: AtomicU32,
    readers: [AtomicU8; BYTELOCK_SLOTS],
}

impl ByteLock {
    /// Slot id for readers without a dedicated byte.
    pub const UNSLOTTED: u32 = u32::MAX;

    /// Number of dedicated reader slots.
    pub const SLOTS: usize = BYTELOCK_SLOTS;

    /// Create an unlocked lock.
    pub fn new() -> Self {
        Self {
            owner: AtomicU32::new(0),
            n_readers: AtomicU32::new(0),
            readers: std::array::from_fn(|_| AtomicU8::new(0)),
        }
    }

    /// Acquire exclusively as `slot` (non-zero).
    pub fn write_lock(&self, slot: u32) {
        debug_assert!(slot != 0, "slot 0 means unowned");

        // Announce the upcoming writer acquisition.
        let backoff = Backoff::new();
        while self
            .owner
            .compare_exchange(0, slot, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }

        // If we are slotted, we might be upgrading from a read lock.
        if slot as usize <= BYTELOCK_SLOTS {
            self.readers[(slot - 1) as usize].store(0, Ordering::Relaxed);
        }

        // Wait for slotted readers to drain out, a cache line at a time.
        fence::store_load();
        for byte in &self.readers {
            let backoff = Backoff::new();
            while byte.load(Ordering::Relaxed) != 0 {
                backoff.snooze();
            }
        }

        // Wait for unslotted readers to drain out.
        let backoff = Backoff::new();
        while self.n_readers.load(Ordering::Relaxed) != 0 {
            backoff.snooze();
        }
    }

    /// Release an exclusive acquisition.
    pub fn write_unlock(&self) {
        fence::release();
        self.owner.store(0, Ordering::Relaxed);
    }

    /// Acquire shared as `slot` (1-based dedicated slot, or
    /// [`ByteLock::UNSLOTTED`]).
    pub fn read_lock(&self, slot: u32) {
        // A writer that owns the lock under our slot id downgrades to a
        // read-side acquisition with no unheld window.
        if self.owner.load(Ordering::Relaxed) == slot {
            self.readers[(slot - 1) as usize].store(1, Ordering::Relaxed);
            fence::store_load();
            self.owner.store(0, Ordering::Relaxed);
            return;
        }

        // Unslotted threads use the readers counter.
        if slot as usize > BYTELOCK_SLOTS {
            let backoff = Backoff::new();
            loop {
                self.n_readers.fetch_add(1, Ordering::SeqCst);
                fence::atomic_load();
                if self.owner.load(Ordering::Relaxed) == 0 {
                    break;
                }
                self.n_readers.fetch_sub(1, Ordering::SeqCst);

                while self.owner.load(Ordering::Relaxed) != 0 {
                    backoff.snooze();
                }
            }

            fence::load();
            return;
        }

        let byte = &self.readers[(slot - 1) as usize];
        let backoff = Backoff::new();
        loop {
            byte.store(1, Ordering::Relaxed);
            fence::store_load();

            // With no owner at this point our byte is published, and no
            // writer acquisition can succeed until we drain out.
            if self.owner.load(Ordering::Relaxed) == 0 {
                break;
            }

            byte.store(0, Ordering::Relaxed);
            while self.owner.load(Ordering::Relaxed) != 0 {
                backoff.snooze();
            }
        }

        fence::load();
    }

    /// Release a shared acquisition taken with `slot`.
    pub fn read_unlock(&self, slot: u32) {
        fence::release();

        if slot as usize > BYTELOCK_SLOTS {
            self.n_readers.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.readers[(slot - 1) as usize].store(0, Ordering::Relaxed);
        }
    }

    /// True if a writer owns the lock.
    pub fn locked_writer(&self) -> bool {
        fence::load();
        self.owner.load(Ordering::Relaxed) != 0
    }
}

impl Default for ByteLock {
    fn default() -> Self {
        Self::new()
    }
}
