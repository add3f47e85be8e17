//! Generation-tagged ring cell
//!
//! Each cell pairs a 64-bit generation counter with a 64-bit value word
//! in a single 128-bit atomic. The generation is the sequence number of
//! the value currently stored; a cell whose generation is strictly below
//! the sequence a producer wants to claim is free, strictly above means
//! the claimant lost a full revolution. Keeping the pair in one atomic
//! gives multi-producer claims their single-compare, double-wide-set
//! CAS and gives readers a consistent `{generation, value}` snapshot in
//! one load.

use portable_atomic::AtomicU128;
use static_assertions::const_assert_eq;
use std::sync::atomic::Ordering;

#[repr(C, align(16))]
pub(crate) struct Slot {
    pair: AtomicU128,
}

const_assert_eq!(std::mem::size_of::<Slot>(), 16);
const_assert_eq!(std::mem::align_of::<Slot>(), 16);

#[inline(always)]
fn pack(generation: u64, value: u64) -> u128 {
    (u128::from(value) << 64) | u128::from(generation)
}

#[inline(always)]
fn unpack(pair: u128) -> (u64, u64) {
    (pair as u64, (pair >> 64) as u64)
}

impl Slot {
    pub(crate) fn empty() -> Self {
        Self {
            pair: AtomicU128::new(0),
        }
    }

    /// Consistent `(generation, value)` snapshot.
    #[inline(always)]
    pub(crate) fn load(&self) -> (u64, u64) {
        unpack(self.pair.load(Ordering::Acquire))
    }

    /// Publish a new pair. Producer-exclusive cells only (single
    /// producer, or a cell already claimed through [`Slot::claim`]).
    #[inline(always)]
    pub(crate) fn publish(&self, generation: u64, value: u64) {
        self.pair.store(pack(generation, value), Ordering::Release);
    }

    /// Single-compare, double-wide-set claim. On failure returns the
    /// observed `(generation, value)` pair; the read is consistent, so
    /// the caller can retry without a spurious-failure loop.
    #[inline(always)]
    pub(crate) fn claim(
        &self,
        expected: (u64, u64),
        generation: u64,
        value: u64,
    ) -> Result<(), (u64, u64)> {
        self.pair
            .compare_exchange(
                pack(expected.0, expected.1),
                pack(generation, value),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(unpack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_round_trip() {
        let pair = pack(0x1122_3344_5566_7788, 0x99aa_bbcc_ddee_ff00);
        assert_eq!(unpack(pair), (0x1122_3344_5566_7788, 0x99aa_bbcc_ddee_ff00));
    }

    #[test]
    fn test_claim_succeeds_on_expected_pair() {
        let slot = Slot::empty();
        assert!(slot.claim((0, 0), 7, 42).is_ok());
        assert_eq!(slot.load(), (7, 42));
    }

    #[test]
    fn test_claim_reports_observed_pair() {
        let slot = Slot::empty();
        slot.publish(9, 1);
        let err = slot.claim((0, 0), 10, 2).unwrap_err();
        assert_eq!(err, (9, 1));
    }
}
