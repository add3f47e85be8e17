//! Producer paths
//!
//! Single-producer enqueue is a pair publish plus two release points:
//! the cell's generation must be visible before the producer cursor
//! moves. Multi-producer enqueue claims cells with the double-wide CAS;
//! the producer cursor and consumer snapshot are racy caches that hint
//! where the search for an empty cell should start and stop.

use std::sync::atomic::Ordering;

use tracing::trace;

use super::{Ring, Sequence};
use crate::fence;

/// Outcome of one claim attempt on a cell.
enum Claim {
    /// Cell acquired; carries the value previously stored there.
    Won(u64),
    /// Lost the race for exactly this generation.
    Lost,
    /// Lost by at least a full revolution.
    Late,
}

/// Private producer snapshot used by the multi-producer search.
struct ProducerSnap {
    consumer_snap: Sequence,
    cursor: Sequence,
}

impl Ring {
    /// Approximate remaining enqueue capacity. Exact for a single
    /// producer.
    pub fn enqueue_capacity(&self) -> usize {
        let mask = self.mask;
        let consumer_snap = self.prod.consumer_snap.load(Ordering::Relaxed);
        let cursor = self.prod.cursor.load(Ordering::Relaxed);

        if cursor.wrapping_sub(consumer_snap) > mask {
            return self.enqueue_capacity_slow();
        }

        (consumer_snap + mask + 1).wrapping_sub(cursor) as usize
    }

    fn enqueue_capacity_slow(&self) -> usize {
        let mask = self.mask;
        let cursor = self.prod.cursor.load(Ordering::Relaxed);
        let consumer_snap = self.oldest_consumer_snap(cursor);

        self.prod.consumer_snap.store(consumer_snap, Ordering::Relaxed);
        if cursor.wrapping_sub(consumer_snap) > mask {
            return 0;
        }

        (consumer_snap + mask + 1).wrapping_sub(cursor) as usize
    }

    /// Attempt to enqueue one value. Single producer only.
    ///
    /// Returns true iff the value was stored.
    #[inline]
    pub fn senqueue(&self, value: u64) -> bool {
        self.senqueue_val(value).is_some()
    }

    /// Attempt to enqueue one value, returning the value previously in
    /// the claimed cell. Single producer only.
    #[inline]
    pub fn senqueue_val(&self, value: u64) -> Option<u64> {
        debug_assert!(value != 0, "0 is the reserved empty sentinel");

        let mask = self.mask;
        // Only writer to the producer block is us.
        let consumer_snap = self.prod.consumer_snap.load(Ordering::Relaxed);
        let cursor = self.prod.cursor.load(Ordering::Relaxed);

        if cursor.wrapping_sub(consumer_snap) > mask {
            return self.senqueue_val_slow(value);
        }

        let slot = &self.buf[(cursor & mask) as usize];
        let (_, previous) = slot.load();

        // Publish the pair, then the cursor; consumers must never
        // observe the cursor ahead of the generation it covers.
        slot.publish(cursor, value);
        fence::store();
        self.prod.cursor.store(cursor.wrapping_add(1), Ordering::Relaxed);
        Some(previous)
    }

    #[cold]
    fn senqueue_val_slow(&self, value: u64) -> Option<u64> {
        let mask = self.mask;
        let cursor = self.prod.cursor.load(Ordering::Relaxed);
        let consumer_snap = self.oldest_consumer_snap(cursor);

        self.prod.consumer_snap.store(consumer_snap, Ordering::Relaxed);
        if cursor.wrapping_sub(consumer_snap) > mask {
            return None;
        }

        self.senqueue_val(value)
    }

    /// Enqueue up to `values.len()` values. Single producer only.
    ///
    /// Returns the number of values enqueued; `values[..n]` is rewritten
    /// with the values previously stored in the claimed cells.
    pub fn senqueue_n(&self, values: &mut [u64]) -> usize {
        let mask = self.mask;
        let base_cursor = self.prod.cursor.load(Ordering::Relaxed);

        let capacity = self.enqueue_capacity();
        let n = values.len().min(capacity);

        for (produced, value) in values.iter_mut().enumerate().take(n) {
            debug_assert!(*value != 0, "0 is the reserved empty sentinel");
            let cursor = base_cursor.wrapping_add(produced as u64);
            let slot = &self.buf[(cursor & mask) as usize];

            let (_, previous) = slot.load();
            slot.publish(cursor, *value);
            *value = previous;
        }

        fence::store();
        self.prod
            .cursor
            .store(base_cursor.wrapping_add(n as u64), Ordering::Relaxed);
        n
    }

    /// Attempt to enqueue one value from any producer thread.
    #[inline]
    pub fn menqueue(&self, value: u64) -> bool {
        self.menqueue_val(value).is_some()
    }

    /// Attempt to enqueue one value from any producer thread, returning
    /// the value previously in the claimed cell.
    pub fn menqueue_val(&self, value: u64) -> Option<u64> {
        debug_assert!(value != 0, "0 is the reserved empty sentinel");

        let mask = self.mask;
        let mut snap = ProducerSnap {
            consumer_snap: self.prod.consumer_snap.load(Ordering::Relaxed),
            cursor: self.prod.cursor.load(Ordering::Relaxed),
        };

        // Fast path: the cursor hint is not too far ahead; immediately
        // try to write there, touching only producer state and the cell.
        if snap.cursor.wrapping_sub(snap.consumer_snap) <= mask {
            let cursor = snap.cursor;
            if let Claim::Won(previous) = self.try_claim_cell(value, cursor, &mut snap.cursor) {
                self.prod.cursor.store(cursor.wrapping_add(1), Ordering::Relaxed);
                return Some(previous);
            }
        }

        // Slow path: refresh the private snapshot from the shared
        // producer and consumer state until the consumers' cursor stops
        // moving. No movement means the ring is genuinely full.
        loop {
            if let Some(previous) = self.try_menqueue(value, &mut snap) {
                return Some(previous);
            }

            let prod_cursor = self.prod.cursor.load(Ordering::Relaxed);
            if (prod_cursor.wrapping_sub(snap.cursor) as i64) > 0 {
                snap.cursor = prod_cursor;
            } else {
                self.prod.cursor.store(snap.cursor, Ordering::Relaxed);
            }

            let consumer_snap = self.oldest_consumer_snap(snap.cursor);
            if consumer_snap == snap.consumer_snap {
                // Update the shared snapshot if ours is fresher.
                let current = self.prod.consumer_snap.load(Ordering::Relaxed);
                if (consumer_snap.wrapping_sub(current) as i64) < 0 {
                    self.prod.consumer_snap.store(consumer_snap, Ordering::Relaxed);
                }

                trace!(cursor = snap.cursor, "ring full with no consumer progress");
                return None;
            }

            snap.consumer_snap = consumer_snap;
        }
    }

    /// Enqueue up to `values.len()` values from any producer thread.
    ///
    /// Returns the number enqueued; `values[..n]` is rewritten with the
    /// previously stored values.
    pub fn menqueue_n(&self, values: &mut [u64]) -> usize {
        for (i, value) in values.iter_mut().enumerate() {
            match self.menqueue_val(*value) {
                Some(previous) => *value = previous,
                None => return i,
            }
        }

        values.len()
    }

    /// Bounded linear search for an empty cell between the consumer
    /// snapshot and one revolution ahead of it. Updates the shared
    /// producer cache on success, the private snapshot on failure.
    fn try_menqueue(&self, value: u64, snap: &mut ProducerSnap) -> Option<u64> {
        let mask = self.mask;
        let mut cursor = snap.cursor;

        if (cursor.wrapping_sub(snap.consumer_snap) as i64) < 0 {
            cursor = snap.consumer_snap;
        }

        while cursor.wrapping_sub(snap.consumer_snap) <= mask {
            match self.try_claim_cell(value, cursor, &mut snap.cursor) {
                Claim::Won(previous) => {
                    self.prod.cursor.store(cursor.wrapping_add(1), Ordering::Relaxed);
                    self.prod
                        .consumer_snap
                        .store(snap.consumer_snap, Ordering::Relaxed);
                    return Some(previous);
                }
                Claim::Lost => {
                    cursor = cursor.wrapping_add(1);
                }
                Claim::Late => {
                    // Way off; the claim attempt already advanced the
                    // private cursor past the observed generation.
                    return None;
                }
            }
        }

        snap.cursor = cursor;
        None
    }

    /// Attempt to overwrite an older record at `cursor` with `value`.
    /// The caller must have established that `cursor` is at most one
    /// revolution ahead of the consumers.
    fn try_claim_cell(&self, value: u64, cursor: Sequence, hint: &mut Sequence) -> Claim {
        let slot = &self.buf[(cursor & self.mask) as usize];
        let (gen, prev) = slot.load();
        let mut actual_gen = gen;
        let mut ret = actual_gen.wrapping_sub(cursor) as i64;

        'late: {
            if ret >= 0 {
                // A record at least as fresh is already there.
                break 'late;
            }

            match slot.claim((gen, prev), cursor, value) {
                Ok(()) => return Claim::Won(prev),
                Err((gen2, prev2)) => {
                    actual_gen = gen2;
                    ret = actual_gen.wrapping_sub(cursor) as i64;
                    if ret >= 0 {
                        break 'late;
                    }

                    // The failed CAS read is consistent, so one more
                    // attempt settles who owns this generation.
                    match slot.claim((gen2, prev2), cursor, value) {
                        Ok(()) => return Claim::Won(prev2),
                        Err((gen3, _)) => {
                            actual_gen = gen3;
                            ret = 0;
                        }
                    }
                }
            }
        }

        // The next free generation is at least one past the observed one.
        *hint = actual_gen.wrapping_add(1);
        if ret > 0 {
            Claim::Late
        } else {
            Claim::Lost
        }
    }

    /// Lower bound on the oldest consumer cursor, skipping consumers
    /// whose cursors are already covered by a dependent child's range.
    pub(crate) fn oldest_consumer_snap(&self, cursor: Sequence) -> Sequence {
        let mut ret = cursor;
        let mut i = self.cons.len();

        while i > 0 {
            i -= 1;
            let current = &self.cons[i];
            let current_cursor = current.cursor.load(Ordering::Relaxed);

            if (current_cursor.wrapping_sub(ret) as i64) < 0 {
                ret = current_cursor;
            }

            // current bounds every parent in [begin, end); if end
            // reaches us, all ids down to begin are already covered.
            if current.dep_end as usize >= i {
                let skip = current.dep_begin as usize;
                if skip < i {
                    i = skip;
                }
            }
        }

        ret
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Ring, RingConfig};

    #[test]
    fn test_senqueue_until_full() {
        let ring = Ring::with_capacity(4, 1).unwrap();
        for v in 1..=4 {
            assert!(ring.senqueue(v));
        }
        assert!(!ring.senqueue(5));
        assert_eq!(ring.enqueue_capacity(), 0);
    }

    #[test]
    fn test_senqueue_val_reports_previous_cell_value() {
        let ring = Ring::with_capacity(2, 1).unwrap();
        assert_eq!(ring.senqueue_val(10), Some(0));
        assert_eq!(ring.senqueue_val(20), Some(0));
        assert_eq!(ring.sdequeue(0), Some(10));
        assert_eq!(ring.sdequeue(0), Some(20));
        // Second revolution sees the first revolution's values.
        assert_eq!(ring.senqueue_val(30), Some(10));
    }

    #[test]
    fn test_senqueue_n_partial_on_backpressure() {
        let ring = Ring::with_capacity(4, 1).unwrap();
        let mut values = [1, 2, 3, 4, 5, 6];
        assert_eq!(ring.senqueue_n(&mut values), 4);
        assert_eq!(ring.sdequeue(0), Some(1));
        let mut more = [7u64];
        assert_eq!(ring.senqueue_n(&mut more), 1);
    }

    #[test]
    fn test_menqueue_until_full() {
        let ring = Ring::with_capacity(4, 1).unwrap();
        for v in 1..=4 {
            assert!(ring.menqueue(v));
        }
        assert!(!ring.menqueue(5));
        assert_eq!(ring.mdequeue(0), Some(1));
        assert!(ring.menqueue(5));
    }

    #[test]
    fn test_menqueue_interleaves_with_senqueue_semantics() {
        let ring = Ring::with_capacity(8, 1).unwrap();
        assert!(ring.menqueue(1));
        assert!(ring.menqueue(2));
        assert_eq!(ring.sdequeue(0), Some(1));
        assert_eq!(ring.sdequeue(0), Some(2));
        assert_eq!(ring.sdequeue(0), None);
    }

    #[test]
    fn test_enqueue_capacity_tracks_consumption() {
        let ring = Ring::new(RingConfig::new(8).unwrap()).unwrap();
        assert_eq!(ring.enqueue_capacity(), 8);
        ring.senqueue(1);
        ring.senqueue(2);
        assert_eq!(ring.enqueue_capacity(), 6);
        ring.sdequeue(0);
        // Capacity is refreshed from the consumer cursor only when the
        // cached snapshot runs out.
        assert!(ring.enqueue_capacity() >= 6);
    }
}
