//! Consumer paths
//!
//! A consumer knows exactly where its next element lives; it only has
//! to wait until the cell's generation matches its cursor. Because the
//! consumer cursor bounds the largest generation a producer may write,
//! a matching generation guarantees the paired value is the one the
//! cursor refers to.
//!
//! Single-consumer blocks own their cursor and publish it with plain
//! stores; multi-consumer blocks race on it with CAS and re-validate
//! reads against the base cell's generation. Batched reads check the
//! last cell first, then fall back to element-wise scanning, halving
//! the batch on lost races.

use std::sync::atomic::Ordering;

use super::{Ring, Sequence};
use crate::fence;

impl Ring {
    /// Dequeue one value from single-threaded consumer `index`.
    #[inline]
    pub fn sdequeue(&self, index: usize) -> Option<u64> {
        let cons = self.consumer(index);
        let mask = self.mask;
        // Only writer to the cursor is us.
        let cursor = cons.cursor.load(Ordering::Relaxed);

        if (cursor.wrapping_sub(cons.read_limit.load(Ordering::Relaxed)) as i64) >= 0 {
            // Only happens with dependencies, when we catch up to a
            // parent; consumers going too fast can take the slow path.
            return self.sdequeue_slow(index);
        }

        let (gen, value) = self.buf[(cursor & mask) as usize].load();
        debug_assert!(
            (gen.wrapping_sub(cursor) as i64) <= 0,
            "concurrent dequeue on a single-consumer block"
        );
        if gen != cursor {
            return None;
        }

        // Producers read the cursor to reclaim cells: consume the value
        // before releasing it.
        fence::load_store();
        cons.cursor.store(cursor.wrapping_add(1), Ordering::Relaxed);
        Some(value)
    }

    #[cold]
    fn sdequeue_slow(&self, index: usize) -> Option<u64> {
        let mut dst = [0u64; 1];
        if self.sdequeue_n(index, &mut dst) == 1 {
            Some(dst[0])
        } else {
            None
        }
    }

    /// Read one value from single-threaded consumer `index` without
    /// consuming it.
    #[inline]
    pub fn sread(&self, index: usize) -> Option<u64> {
        let cons = self.consumer(index);
        let mask = self.mask;
        let cursor = cons.cursor.load(Ordering::Relaxed);

        if (cursor.wrapping_sub(cons.read_limit.load(Ordering::Relaxed)) as i64) >= 0 {
            return self.sread_slow(index);
        }

        let (gen, value) = self.buf[(cursor & mask) as usize].load();
        debug_assert!(
            (gen.wrapping_sub(cursor) as i64) <= 0,
            "concurrent dequeue on a single-consumer block"
        );
        if gen == cursor {
            Some(value)
        } else {
            None
        }
    }

    #[cold]
    fn sread_slow(&self, index: usize) -> Option<u64> {
        let mut dst = [0u64; 1];
        if self.sread_n(index, &mut dst) == 1 {
            Some(dst[0])
        } else {
            None
        }
    }

    /// Consume the last value returned by [`Ring::sread`].
    #[inline]
    pub fn sconsume(&self, index: usize) {
        self.sconsume_n(index, 1);
    }

    /// Consume the last `n` values returned by [`Ring::sread_n`].
    #[inline]
    pub fn sconsume_n(&self, index: usize, n: usize) {
        let cons = self.consumer(index);
        let cursor = cons.cursor.load(Ordering::Relaxed);

        fence::load_store();
        cons.cursor.store(cursor.wrapping_add(n as u64), Ordering::Relaxed);
    }

    /// Dequeue up to `dst.len()` values from single-threaded consumer
    /// `index`. Returns the number written to `dst`.
    pub fn sdequeue_n(&self, index: usize, dst: &mut [u64]) -> usize {
        let read = self.sread_n(index, dst);
        self.sconsume_n(index, read);
        read
    }

    /// Read up to `dst.len()` values without consuming them. Returns
    /// the number written to `dst`.
    pub fn sread_n(&self, index: usize, dst: &mut [u64]) -> usize {
        let cons = self.consumer(index);
        let mask = self.mask;
        let base_cursor = cons.cursor.load(Ordering::Relaxed);
        let read_limit = cons.read_limit.load(Ordering::Relaxed);
        let mut capacity = read_limit.wrapping_sub(base_cursor);

        if (base_cursor.wrapping_sub(read_limit) as i64) >= 0 {
            capacity = self.update_read_limit(cons);
            if capacity == 0 {
                return 0;
            }
        }

        let n = (dst.len() as u64).min(capacity);

        // See whether the whole batch is already produced: cells from
        // the cursor onward cannot be overwritten, so checking the last
        // one covers the range.
        let last_cursor = base_cursor.wrapping_add(n).wrapping_sub(1);
        let (last_gen, _) = self.buf[(last_cursor & mask) as usize].load();
        if last_gen == last_cursor {
            for i in 0..n {
                let cursor = base_cursor.wrapping_add(i);
                dst[i as usize] = self.buf[(cursor & mask) as usize].load().1;
            }
            return n as usize;
        }

        // Element-wise fallback: stop at the first unproduced cell.
        let mut consumed = 0u64;
        while consumed < n {
            let cursor = base_cursor.wrapping_add(consumed);
            let (gen, value) = self.buf[(cursor & mask) as usize].load();
            if gen != cursor {
                debug_assert!(
                    (gen.wrapping_sub(cursor) as i64) <= 0,
                    "concurrent dequeue on a single-consumer block"
                );
                break;
            }

            dst[consumed as usize] = value;
            consumed += 1;
        }

        consumed as usize
    }

    /// Dequeue one value from multi-threaded consumer `index`, retrying
    /// on contention until the ring is empty.
    #[inline]
    pub fn mdequeue(&self, index: usize) -> Option<u64> {
        self.mdequeue_generic(index, true)
    }

    /// Dequeue one value from multi-threaded consumer `index`, giving
    /// up after one contention loss.
    #[inline]
    pub fn mtrydequeue(&self, index: usize) -> Option<u64> {
        self.mdequeue_generic(index, false)
    }

    fn mdequeue_generic(&self, index: usize, hard: bool) -> Option<u64> {
        let cons = self.consumer(index);
        let mask = self.mask;
        let cursor = cons.cursor.load(Ordering::Relaxed);
        let read_limit = cons.read_limit.load(Ordering::Relaxed);

        if (cursor.wrapping_sub(read_limit) as i64) >= 0 {
            if self.update_read_limit(cons) == 0 {
                return None;
            }
        }

        // Fast path, assuming our cursor view is up to date.
        let (gen, value) = self.buf[(cursor & mask) as usize].load();
        let ret = gen.wrapping_sub(cursor) as i64;
        if ret == 0 {
            // The cell is up to date; acquire it.
            if cons
                .cursor
                .compare_exchange(cursor, cursor.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(value);
            }
        } else if ret < 0 {
            // Still empty; fail immediately.
            return None;
        }

        let mut dst = [0u64; 1];
        if self.mdequeue_n_generic(index, &mut dst, hard) == 1 {
            Some(dst[0])
        } else {
            None
        }
    }

    /// Dequeue up to `dst.len()` values from multi-threaded consumer
    /// `index`, halving the batch on contention.
    pub fn mdequeue_n(&self, index: usize, dst: &mut [u64]) -> usize {
        self.mdequeue_n_generic(index, dst, true)
    }

    /// Non-retrying variant of [`Ring::mdequeue_n`].
    pub fn mtrydequeue_n(&self, index: usize, dst: &mut [u64]) -> usize {
        self.mdequeue_n_generic(index, dst, false)
    }

    fn mdequeue_n_generic(&self, index: usize, dst: &mut [u64], hard: bool) -> usize {
        let mut n = dst.len();

        loop {
            let (read, gen) = self.mread_n_generic(index, &mut dst[..n], hard);
            if read == 0 || self.mconsume_n(index, gen, read) {
                return read;
            }

            if !hard {
                return 0;
            }

            n = (n + 1) / 2;
        }
    }

    /// Read one value from multi-threaded consumer `index` without
    /// consuming it. Returns the value and the generation to pass to
    /// [`Ring::mconsume`].
    #[inline]
    pub fn mread(&self, index: usize) -> Option<(u64, Sequence)> {
        self.mread_generic(index, true)
    }

    /// Non-retrying variant of [`Ring::mread`].
    #[inline]
    pub fn mtryread(&self, index: usize) -> Option<(u64, Sequence)> {
        self.mread_generic(index, false)
    }

    fn mread_generic(&self, index: usize, hard: bool) -> Option<(u64, Sequence)> {
        let cons = self.consumer(index);
        let mask = self.mask;
        let cursor = cons.cursor.load(Ordering::Relaxed);
        let read_limit = cons.read_limit.load(Ordering::Relaxed);

        if (cursor.wrapping_sub(read_limit) as i64) < 0 {
            let (gen, value) = self.buf[(cursor & mask) as usize].load();
            let ret = gen.wrapping_sub(cursor) as i64;
            if ret < 0 {
                return None;
            }
            if ret == 0 {
                // The pair snapshot is consistent; no re-check needed.
                return Some((value, cursor));
            }
            // Fell behind a reuse; resolve through the slow path.
        }

        let mut dst = [0u64; 1];
        match self.mread_n_generic(index, &mut dst, hard) {
            (1, gen) => Some((dst[0], gen)),
            _ => None,
        }
    }

    /// Consume the value read at `gen` by [`Ring::mread`].
    #[inline]
    pub fn mconsume(&self, index: usize, gen: Sequence) -> bool {
        self.mconsume_n(index, gen, 1)
    }

    /// Consume `n` values read at `gen` by [`Ring::mread_n`].
    #[inline]
    pub fn mconsume_n(&self, index: usize, gen: Sequence, n: usize) -> bool {
        let cons = self.consumer(index);

        fence::load_store();
        cons.cursor
            .compare_exchange(gen, gen.wrapping_add(n as u64), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Read up to `dst.len()` values from multi-threaded consumer
    /// `index`. Returns the count and the base generation for
    /// [`Ring::mconsume_n`].
    pub fn mread_n(&self, index: usize, dst: &mut [u64]) -> (usize, Sequence) {
        self.mread_n_generic(index, dst, true)
    }

    /// Non-retrying variant of [`Ring::mread_n`].
    pub fn mtryread_n(&self, index: usize, dst: &mut [u64]) -> (usize, Sequence) {
        self.mread_n_generic(index, dst, false)
    }

    fn mread_n_generic(&self, index: usize, dst: &mut [u64], hard: bool) -> (usize, Sequence) {
        let cons = self.consumer(index);
        let mask = self.mask;
        let mut n = dst.len() as u64;

        loop {
            let base_cursor = cons.cursor.load(Ordering::Relaxed);
            let read_limit = cons.read_limit.load(Ordering::Relaxed);
            let base_loc = (base_cursor & mask) as usize;
            let mut capacity = read_limit.wrapping_sub(base_cursor);

            if (base_cursor.wrapping_sub(read_limit) as i64) >= 0 {
                capacity = self.update_read_limit(cons);
                if capacity == 0 {
                    return (0, base_cursor);
                }
            }

            n = n.min(capacity);

            let last_cursor = base_cursor.wrapping_add(n).wrapping_sub(1);
            let (last_gen, _) = self.buf[(last_cursor & mask) as usize].load();
            if last_gen == last_cursor {
                for i in 0..n {
                    let cursor = base_cursor.wrapping_add(i);
                    dst[i as usize] = self.buf[(cursor & mask) as usize].load().1;
                }

                fence::load();
                if n <= 1 || self.buf[base_loc].load().0 == base_cursor {
                    return (n as usize, base_cursor);
                }

                if !hard {
                    return (0, base_cursor);
                }

                // The last cell matched when we started, so we lost a
                // race on the base; retry minimally.
                n = 1;
                continue;
            }

            if n == 0 {
                return (0, base_cursor);
            }

            let mut consumed = 0u64;
            while consumed < n {
                let cursor = base_cursor.wrapping_add(consumed);
                let (gen, value) = self.buf[(cursor & mask) as usize].load();
                if gen != cursor {
                    break;
                }

                dst[consumed as usize] = value;
                consumed += 1;
            }

            if consumed == 0 && hard {
                let (gen, _) = self.buf[base_loc].load();
                // Only retry if we lost a race, not if the ring is empty.
                if (gen.wrapping_sub(base_cursor) as i64) > 0 {
                    n = 1;
                    continue;
                }
            }

            return (consumed as usize, base_cursor);
        }
    }
}
