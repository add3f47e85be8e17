//! Quiesce tunables
//!
//! Core constants shared by the concurrency engines.

/// Cache line size for alignment (64 bytes on most CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

/// Number of deferral lists per epoch record (must be power of 2)
///
/// Deferral list selection is `epoch mod EPOCH_LENGTH`; the advancement
/// rule guarantees a full revolution of the index only after enough
/// grace periods have passed.
pub const EPOCH_LENGTH: usize = 4;

/// Number of successful epoch advances that constitute a grace period
/// for the blocking synchronize path
pub const EPOCH_GRACE: u32 = 3;

/// Number of generation counters in a hash set map (must be power of 2)
///
/// Mutations hash into this array; readers snapshot the counter for
/// their bucket before probing and reprobe on mismatch.
pub const SET_GENERATION_SLOTS: usize = 1024;

/// Slots probed within one cache line run before stepping to the next
/// line (must be power of 2)
pub const SET_PROBE_L1: usize = 8;

/// Floor for a map's probe limit, independent of capacity
pub const SET_PROBE_LIMIT_FLOOR: usize = CACHE_LINE_SIZE;

/// Upper bound on in-flight Robin Hood displacements for one insertion;
/// past this the writer falls back to plain open addressing
pub const SET_MAX_DISPLACEMENTS: usize = 512;

/// Saturation value for a descriptor's `wanted` chain counter
pub const SET_MAX_WANTED: u16 = 0xffff;

/// Bit position of the latch generation in a reader/writer lock's
/// reader word; the low half counts active readers
pub const RWLOCK_LATCH_SHIFT: u32 = 16;

/// Number of dedicated reader slots in a byte lock (cache line minus
/// the owner and counter words)
pub const BYTELOCK_SLOTS: usize = CACHE_LINE_SIZE - 2 * std::mem::size_of::<u32>();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_line_size_is_power_of_two() {
        assert!(CACHE_LINE_SIZE.is_power_of_two());
    }

    #[test]
    fn test_epoch_length_is_power_of_two() {
        assert!(EPOCH_LENGTH.is_power_of_two());
    }

    #[test]
    fn test_set_tunables_are_powers_of_two() {
        assert!(SET_GENERATION_SLOTS.is_power_of_two());
        assert!(SET_PROBE_L1.is_power_of_two());
    }

    #[test]
    fn test_bytelock_slots_fill_cache_line() {
        assert_eq!(BYTELOCK_SLOTS, 56);
    }
}
