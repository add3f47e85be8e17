//! Snoopers: consumers invisible to flow control
//!
//! A snooper keeps a consumer block of its own but never publishes a
//! cursor the producers can see, so it exerts no back-pressure and may
//! lose values to reuse at any time. Its reads sandwich the value load
//! between two generation checks; a mismatch means the cell was
//! recycled underneath it. A lagging snooper re-synchronises by
//! adopting the generation of whatever currently occupies its cell.

use std::ops::Range;
use std::sync::atomic::Ordering;

use super::{ConsumerBlock, Ring};
use crate::error::{QuiesceError, Result};
use crate::fence;

/// A consumer that never blocks producers.
pub struct Snooper {
    cons: ConsumerBlock,
}

impl Snooper {
    /// Attach a snooper to `ring`. `deps` is a range of consumer ids
    /// the snooper must not overtake; pass an empty range for a free
    /// snooper.
    pub fn new(ring: &Ring, deps: Range<u32>) -> Result<Self> {
        if deps.end as usize > ring.consumer_count() {
            return Err(QuiesceError::config(
                "Snooper dependencies must reference configured consumers",
            ));
        }

        let snooper = Self {
            cons: ConsumerBlock::new(0, deps.start, deps.end),
        };
        snooper.update_cursor(ring, true);
        Ok(snooper)
    }

    /// Approximately how many entries are available for snooping. Only
    /// interesting with dependencies.
    pub fn capacity(&self, ring: &Ring) -> usize {
        let cursor = self.cons.cursor.load(Ordering::Relaxed);
        let limit = self.cons.read_limit.load(Ordering::Relaxed);

        if (cursor.wrapping_sub(limit) as i64) >= 0 {
            return ring.update_read_limit(&self.cons) as usize;
        }

        limit.wrapping_sub(cursor) as usize
    }

    /// Snoop the next value.
    pub fn snoop(&mut self, ring: &Ring) -> Option<u64> {
        let mask = ring.mask;
        let cursor = self.cons.cursor.load(Ordering::Relaxed);

        if (cursor.wrapping_sub(self.cons.read_limit.load(Ordering::Relaxed)) as i64) >= 0 {
            return self.snoop_slow(ring);
        }

        let (gen, value) = ring.buf[(cursor & mask) as usize].load();
        let ret = gen.wrapping_sub(cursor) as i64;
        if ret < 0 {
            // Generation too old; the ring is still empty here.
            return None;
        }
        if ret > 0 {
            // Our cursor is out of date; resynchronise off the fast path.
            return self.snoop_slow(ring);
        }

        self.cons.cursor.store(cursor.wrapping_add(1), Ordering::Relaxed);
        Some(value)
    }

    #[cold]
    fn snoop_slow(&mut self, ring: &Ring) -> Option<u64> {
        let mut dst = [0u64; 1];
        if self.snoop_n(ring, &mut dst) == 1 {
            Some(dst[0])
        } else {
            None
        }
    }

    /// Snoop up to `dst.len()` values. Returns the number written.
    pub fn snoop_n(&mut self, ring: &Ring, dst: &mut [u64]) -> usize {
        if dst.is_empty() {
            return 0;
        }

        let mut n = dst.len().min(ring.capacity());

        loop {
            let cursor = self.cons.cursor.load(Ordering::Relaxed);
            let read_limit = self.cons.read_limit.load(Ordering::Relaxed);
            let mut remaining = read_limit.wrapping_sub(cursor);

            if (cursor.wrapping_sub(read_limit) as i64) >= 0 {
                remaining = ring.update_read_limit(&self.cons);
                if remaining == 0 {
                    return 0;
                }
            }

            n = n.min(remaining as usize);
            match self.snoop_n_inner(ring, &mut dst[..n]) {
                Some(read) => {
                    let cursor = self.cons.cursor.load(Ordering::Relaxed);
                    self.cons
                        .cursor
                        .store(cursor.wrapping_add(read as u64), Ordering::Relaxed);
                    return read;
                }
                None => {
                    // Lost the race over the whole batch; shrink and
                    // resynchronise or give up if we cannot move forward.
                    n = (n + 1) / 2;
                    if !self.update_cursor(ring, false) {
                        return 0;
                    }
                }
            }
        }
    }

    /// One batched attempt. `None` means the base cell was recycled
    /// mid-read and nothing can be salvaged.
    fn snoop_n_inner(&self, ring: &Ring, dst: &mut [u64]) -> Option<usize> {
        let mask = ring.mask;
        let base_cursor = self.cons.cursor.load(Ordering::Relaxed);
        let base_loc = (base_cursor & mask) as usize;

        let (base_gen, _) = ring.buf[base_loc].load();
        if (base_gen.wrapping_sub(base_cursor) as i64) < 0 {
            // The ring is empty at our cursor.
            return Some(0);
        }

        let mut consumed = 0usize;
        while consumed < dst.len() {
            let cursor = base_cursor.wrapping_add(consumed as u64);
            let (gen, value) = ring.buf[(cursor & mask) as usize].load();
            if gen != cursor {
                break;
            }

            dst[consumed] = value;
            consumed += 1;
        }

        fence::load();
        // Everything matched up to here; make sure the base cell
        // survived the whole pass.
        let (base_gen, _) = ring.buf[base_loc].load();
        if base_gen == base_cursor {
            Some(consumed)
        } else {
            None
        }
    }

    /// Jump the cursor to the freshest safe position. With dependencies
    /// that is one before the read limit; without, the generation of
    /// the cell the cursor points into.
    fn update_cursor(&self, ring: &Ring, init: bool) -> bool {
        let cursor = self.cons.cursor.load(Ordering::Relaxed);

        let new_cursor = if self.cons.dep_begin < self.cons.dep_end {
            ring.update_read_limit(&self.cons);
            self.cons.read_limit.load(Ordering::Relaxed).wrapping_sub(1)
        } else {
            ring.buf[(cursor & ring.mask) as usize].load().0
        };

        if !init && (cursor.wrapping_sub(new_cursor) as i64) >= 0 {
            return false;
        }

        self.cons.cursor.store(new_cursor, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snoop_sees_values_without_consuming() {
        let ring = Ring::with_capacity(8, 1).unwrap();
        let mut snooper = Snooper::new(&ring, 0..0).unwrap();

        for v in 1..=3u64 {
            ring.senqueue(v);
        }

        // A fresh snooper synchronises to the current cell's generation.
        assert_eq!(snooper.snoop(&ring), Some(1));
        assert_eq!(snooper.snoop(&ring), Some(2));

        // Snooping left the real consumer untouched.
        assert_eq!(ring.sdequeue(0), Some(1));
    }

    #[test]
    fn test_snoop_n_batch() {
        let ring = Ring::with_capacity(8, 1).unwrap();
        let mut snooper = Snooper::new(&ring, 0..0).unwrap();

        for v in 1..=5u64 {
            ring.senqueue(v);
        }

        let mut dst = [0u64; 4];
        assert_eq!(snooper.snoop_n(&ring, &mut dst), 4);
        assert_eq!(dst, [1, 2, 3, 4]);
        assert_eq!(snooper.snoop(&ring), Some(5));
        assert_eq!(snooper.snoop(&ring), None);
    }

    #[test]
    fn test_lagging_snooper_resynchronises() {
        let ring = Ring::with_capacity(4, 1).unwrap();
        let mut snooper = Snooper::new(&ring, 0..0).unwrap();

        // Run the ring a full revolution past the snooper.
        for v in 1..=4u64 {
            ring.senqueue(v);
        }
        for _ in 0..4 {
            ring.sdequeue(0);
        }
        for v in 5..=8u64 {
            ring.senqueue(v);
        }

        // The snooper lost values 1..=4 but picks up at the cell its
        // cursor points into.
        let value = snooper.snoop(&ring).unwrap();
        assert!(value >= 5);
    }

    #[test]
    fn test_dependent_snooper_respects_parent() {
        let ring = Ring::with_capacity(8, 1).unwrap();
        let mut snooper = Snooper::new(&ring, 0..1).unwrap();

        // Fill a full revolution; the parent has consumed nothing, so
        // the snooper may not move past it.
        for v in 1..=8u64 {
            ring.senqueue(v);
        }
        assert_eq!(snooper.snoop(&ring), None);

        // Once the parent advances, the snooper resynchronises to the
        // freshest value the parent has released.
        for _ in 0..3 {
            ring.sdequeue(0);
        }
        assert_eq!(snooper.snoop(&ring), Some(3));
    }

    #[test]
    fn test_snooper_rejects_unknown_dependency() {
        let ring = Ring::with_capacity(8, 1).unwrap();
        assert!(Snooper::new(&ring, 0..5).is_err());
    }
}
