//! SPMC Robin Hood open-addressed hash set
//!
//! One writer, any number of lock-free readers. Entries are raw
//! pointers to caller-owned objects; the set never frees them. Robin
//! Hood insertion keeps probe-length variance low: a candidate that has
//! probed further than an incumbent displaces it, and the incumbent
//! re-inserts from the next slot. Deletion shifts subsequent displaced
//! entries back toward their ideal buckets, so no tombstones are needed
//! and probe chains stay dense.
//!
//! ## Reader protocol
//!
//! Readers snapshot a per-bucket generation counter, probe up to the
//! bucket's cached probe bound, and re-check the counter afterwards. A
//! writer bumps the counter before publishing any mutation that could
//! shift an entry a reader might be probing for — Robin Hood
//! displacement, backward shift, duplicate removal — which forces the
//! reader to restart against a consistent view.
//!
//! ## Probe geometry
//!
//! Probing walks a cache-line-sized run of descriptors, then steps to
//! another line by the current probe count. Each bucket caches the
//! longest probe sequence of the entries that hash to it
//! (`probe_bound`, saturating into a global `probe_maximum` fallback).
//!
//! ## Storage lifecycle
//!
//! Growth doubles the capacity, Robin-Hood-inserts every entry into the
//! fresh map, publishes the map pointer (the sole linearization point
//! for readers), and retires the old map through the caller-supplied
//! [`Reclaimer`] with `deferred = true`.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use tracing::debug;

use crate::constants::{
    CACHE_LINE_SIZE, SET_GENERATION_SLOTS, SET_MAX_DISPLACEMENTS, SET_MAX_WANTED, SET_PROBE_L1,
    SET_PROBE_LIMIT_FLOOR,
};
use crate::error::{QuiesceError, Result};
use crate::fence;
use crate::mem::{DropNow, Reclaimer, Retired};

const GENERATION_MASK: u64 = (SET_GENERATION_SLOTS - 1) as u64;
const PROBE_BOUND_MAX: u8 = u8::MAX;

/// Per-slot descriptor. `entry` and `probe_bound` are read by
/// concurrent readers; the remaining fields are writer-private.
struct Desc<K> {
    entry: AtomicPtr<K>,
    probes: AtomicU32,
    wanted: AtomicU16,
    probe_bound: AtomicU8,
    in_rh: AtomicBool,
}

impl<K> Desc<K> {
    fn empty() -> Self {
        Self {
            entry: AtomicPtr::new(ptr::null_mut()),
            probes: AtomicU32::new(0),
            wanted: AtomicU16::new(0),
            probe_bound: AtomicU8::new(0),
            in_rh: AtomicBool::new(false),
        }
    }
}

/// How a probe walk should treat occupied and displaceable slots.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Behavior {
    /// Match or walk to the probe limit.
    Probe,
    /// Short-circuit as soon as a Robin Hood slot is found.
    ProbeRh,
    /// Short-circuit on the bucket's probe bound, falling back to the
    /// full limit if no slot was found by then.
    ProbeInsert,
    /// Restart from a displaced slot, looking for the displaced
    /// entry's new home.
    ProbeRobinHood,
    /// Plain walk, no Robin Hood bookkeeping (readers, removal).
    ProbeNoRh,
}

/// Result of one probe walk.
struct Probe<K> {
    /// Terminal slot index; `None` when the walk exceeded its limit.
    slot: Option<usize>,
    /// Matched entry, null if none.
    object: *mut K,
    n_probes: u64,
    /// First displaceable slot seen along the walk.
    priority: Option<usize>,
}

struct Map<K> {
    generation: [AtomicU32; SET_GENERATION_SLOTS],
    probe_maximum: AtomicU32,
    mask: u64,
    offset_mask: u64,
    probe_limit: u64,
    n_entries: AtomicUsize,
    capacity: usize,
    descs: Box<[Desc<K>]>,
}

impl<K> Map<K> {
    fn create(capacity: usize) -> Option<Box<Self>> {
        let n_slots = capacity.checked_next_power_of_two()?;
        if n_slots < SET_PROBE_L1 {
            return None;
        }
        n_slots.checked_mul(std::mem::size_of::<Desc<K>>())?;

        let descs = (0..n_slots).map(|_| Desc::empty()).collect::<Vec<_>>();
        let probe_limit = std::cmp::max(n_slots >> (SET_PROBE_L1.trailing_zeros() + 2), SET_PROBE_LIMIT_FLOOR);

        Some(Box::new(Self {
            generation: std::array::from_fn(|_| AtomicU32::new(0)),
            probe_maximum: AtomicU32::new(0),
            mask: (n_slots - 1) as u64,
            offset_mask: (CACHE_LINE_SIZE / std::mem::size_of::<Desc<K>>()) as u64 - 1,
            probe_limit: probe_limit as u64,
            n_entries: AtomicUsize::new(0),
            capacity: n_slots,
            descs: descs.into_boxed_slice(),
        }))
    }

    /// Next slot along the probe sequence: wrap within the current
    /// cache-line run first, then step lines by the probe count.
    #[inline(always)]
    fn probe_next(&self, offset: u64, probes: u64) -> u64 {
        if probes & self.offset_mask != 0 {
            (offset & !self.offset_mask) + ((offset + 1) & self.offset_mask)
        } else {
            (offset + probes) & self.mask
        }
    }

    #[inline(always)]
    fn probe_prev(&self, offset: u64, probes: u64) -> u64 {
        if probes & self.offset_mask != 0 {
            (offset & !self.offset_mask) + (offset.wrapping_sub(1) & self.offset_mask)
        } else {
            offset.wrapping_sub(probes) & self.mask
        }
    }

    fn bound_set(&self, h: u64, n_probes: u64) {
        let offset = (h & self.mask) as usize;

        if n_probes > u64::from(self.probe_maximum.load(Ordering::Relaxed)) {
            self.probe_maximum.store(n_probes as u32, Ordering::Relaxed);
        }

        if u64::from(self.descs[offset].probe_bound.load(Ordering::Relaxed)) < n_probes {
            let bound = n_probes.min(u64::from(PROBE_BOUND_MAX)) as u8;
            self.descs[offset].probe_bound.store(bound, Ordering::Relaxed);
            fence::store();
        }
    }

    fn bound_get(&self, h: u64) -> u64 {
        let offset = (h & self.mask) as usize;
        let bound = self.descs[offset].probe_bound.load(Ordering::Relaxed);

        if bound == PROBE_BOUND_MAX {
            u64::from(self.probe_maximum.load(Ordering::Relaxed))
        } else {
            u64::from(bound)
        }
    }

    fn bump_generation(&self, bucket: u64) {
        self.generation[(bucket & GENERATION_MASK) as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// The central probe walk shared by every operation.
    ///
    /// `key` is compared (by identity, then by value) for behaviors
    /// that look something up; the Robin Hood restart behavior only
    /// walks geometry. `restart` carries `(slot, probes)` to resume a
    /// displaced entry's walk from its old position.
    fn probe(
        &self,
        h: u64,
        key: Option<&K>,
        probe_limit: u64,
        behavior: Behavior,
        restart: Option<(usize, u64)>,
    ) -> Probe<K>
    where
        K: Eq,
    {
        let mut probes;
        let mut offset;

        match restart {
            Some((slot, n_probes)) if behavior == Behavior::ProbeRobinHood => {
                probes = n_probes;
                offset = self.probe_next(slot as u64, probes);
            }
            _ => {
                probes = 0;
                offset = h & self.mask;
            }
        }

        let original_limit = probe_limit;
        let mut limit = if behavior == Behavior::ProbeInsert {
            self.bound_get(h)
        } else {
            probe_limit
        };

        let mut priority: Option<usize> = None;
        let mut n_probes_out = 0u64;
        let object;

        loop {
            if probes == limit {
                probes += 1;
                if limit == original_limit || priority.is_some() {
                    object = ptr::null_mut();
                    break;
                }
                // No eligible slot by the cached bound; continue the
                // walk with the full limit.
                limit = original_limit;
            } else {
                probes += 1;
            }

            let cursor = &self.descs[offset as usize];
            let k = cursor.entry.load(Ordering::Acquire);
            if k.is_null() {
                object = k;
                break;
            }

            if behavior != Behavior::ProbeNoRh
                && !cursor.in_rh.load(Ordering::Relaxed)
                && u64::from(cursor.probes.load(Ordering::Relaxed)) < probes
            {
                if priority.is_none() {
                    priority = Some(offset as usize);
                    n_probes_out = probes;

                    if behavior == Behavior::ProbeRh || behavior == Behavior::ProbeRobinHood {
                        object = ptr::null_mut();
                        break;
                    }
                }
                offset = self.probe_next(offset, probes);
                continue;
            }

            if behavior != Behavior::ProbeRobinHood {
                if let Some(key) = key {
                    if k as *const K == key as *const K || unsafe { &*k } == key {
                        object = k;
                        break;
                    }
                }
            }

            offset = self.probe_next(offset, probes);
        }

        let slot = if probes > limit { None } else { Some(offset as usize) };
        if priority.is_none() {
            n_probes_out = probes;
        }

        Probe {
            slot,
            object,
            n_probes: n_probes_out,
            priority,
        }
    }

    /// Walk back from `slot` to the ideal bucket of its occupant.
    fn first_offset(&self, slot: usize, probes: u64) -> u64 {
        let mut offset = slot as u64;
        let mut probes = probes;

        while probes > 1 {
            probes -= 1;
            offset = self.probe_prev(offset, probes);
        }

        offset
    }
}

/// Statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetStats {
    /// Number of stored entries
    pub n_entries: usize,
    /// Longest probe sequence in the map
    pub probe_maximum: u32,
}

/// SPMC Robin Hood hash set of caller-owned pointers.
pub struct RobinHoodSet<K, R = DropNow, S = RandomState> {
    map: AtomicPtr<Map<K>>,
    hasher: S,
    reclaimer: R,
    _marker: PhantomData<K>,
}

// SAFETY: entries are shared across threads as raw pointers; readers
// dereference them, so the pointee must be Sync and the pointer Send.
unsafe impl<K: Send + Sync, R: Send, S: Send> Send for RobinHoodSet<K, R, S> {}
unsafe impl<K: Send + Sync, R: Sync, S: Sync> Sync for RobinHoodSet<K, R, S> {}

impl<K: Hash + Eq> RobinHoodSet<K, DropNow, RandomState> {
    /// Create a set able to hold `capacity` entries before growing,
    /// with immediate map disposal and the default hasher.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::with_capacity_and(capacity, DropNow, RandomState::new())
    }
}

impl<K: Hash + Eq, R: Reclaimer, S: BuildHasher> RobinHoodSet<K, R, S> {
    /// Create a set with an explicit reclaimer and hash builder.
    ///
    /// Capacity is rounded up to a power of two, with a floor of one
    /// cache-line run of descriptors.
    pub fn with_capacity_and(capacity: usize, reclaimer: R, hasher: S) -> Result<Self> {
        let map = Map::create(capacity.max(SET_PROBE_L1))
            .ok_or_else(|| QuiesceError::capacity("set capacity is not representable"))?;

        Ok(Self {
            map: AtomicPtr::new(Box::into_raw(map)),
            hasher,
            reclaimer,
            _marker: PhantomData,
        })
    }

    #[inline(always)]
    fn hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline(always)]
    fn map(&self) -> &Map<K> {
        // The writer is the only thread that swaps the pointer; readers
        // go through get() which re-loads per retry.
        unsafe { &*self.map.load(Ordering::Acquire) }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.map().n_entries.load(Ordering::Relaxed)
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current slot capacity.
    pub fn capacity(&self) -> usize {
        self.map().capacity
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> SetStats {
        let map = self.map();
        SetStats {
            n_entries: map.n_entries.load(Ordering::Relaxed),
            probe_maximum: map.probe_maximum.load(Ordering::Relaxed),
        }
    }

    /// Lock-free lookup. May run concurrently with the writer.
    pub fn get(&self, key: &K) -> Option<&K> {
        let h = self.hash(key);

        loop {
            let map = unsafe { &*self.map.load(Ordering::Acquire) };
            let generation = &map.generation[(h & GENERATION_MASK) as usize];
            let snapshot = generation.load(Ordering::Relaxed);
            let bound = map.bound_get(h);
            fence::load();

            let probe = map.probe(h, Some(key), bound, Behavior::ProbeNoRh, None);

            fence::load();
            if generation.load(Ordering::Relaxed) == snapshot {
                return if probe.object.is_null() {
                    None
                } else {
                    Some(unsafe { &*probe.object })
                };
            }
            // A writer shifted entries we may have probed past; retry.
        }
    }

    /// Insert `key` if no equal entry exists.
    ///
    /// Returns false if an equal entry is present (or the map could not
    /// grow). # Safety: single writer; `key` must stay valid while in
    /// the set.
    pub unsafe fn put(&self, key: *const K) -> bool {
        unsafe { self.put_internal(key, Behavior::ProbeInsert) }
    }

    /// Insert `key`, asserting no equal entry exists.
    ///
    /// Skips the duplicate scan: the walk short-circuits at the first
    /// displaceable slot. # Safety: as [`RobinHoodSet::put`], and an
    /// equal entry must genuinely be absent.
    pub unsafe fn put_unique(&self, key: *const K) -> bool {
        unsafe { self.put_internal(key, Behavior::ProbeRh) }
    }

    unsafe fn put_internal(&self, key: *const K, behavior: Behavior) -> bool {
        loop {
            let map = self.map();
            let h = self.hash(unsafe { &*key });
            let probe = map.probe(h, Some(unsafe { &*key }), map.probe_limit, behavior, None);

            if probe.slot.is_none() && probe.priority.is_none() {
                if !unsafe { self.grow(map.capacity << 1) } {
                    return false;
                }
                continue;
            }

            // Fail the operation if a match was found.
            if !probe.object.is_null() {
                return false;
            }

            map.bound_set(h, probe.n_probes);

            let desc = if let Some(first) = probe.priority {
                match self.put_robin_hood(first) {
                    1 => continue,
                    -1 => return false,
                    _ => {}
                }
                // Insert into the earlier bucket freed by the rotation.
                let map = self.map();
                map.descs[first].entry.store(key as *mut K, Ordering::Release);
                self.add_wanted(first, None, h);
                first
            } else {
                let slot = probe.slot.expect("probe returned neither slot nor priority");
                map.descs[slot].entry.store(key as *mut K, Ordering::Release);
                self.add_wanted(slot, None, h);
                slot
            };

            let map = self.map();
            map.descs[desc].probes.store(probe.n_probes as u32, Ordering::Relaxed);

            let n = map.n_entries.fetch_add(1, Ordering::Relaxed) + 1;
            if n << 1 > map.capacity {
                unsafe { self.grow(map.capacity << 1) };
            }

            return true;
        }
    }

    /// Insert or replace, returning the previous entry.
    ///
    /// `Ok(None)` means a fresh insert. # Safety: as
    /// [`RobinHoodSet::put`].
    pub unsafe fn set(&self, key: *const K) -> Result<Option<*const K>> {
        loop {
            let map = self.map();
            let h = self.hash(unsafe { &*key });
            let probe = map.probe(
                h,
                Some(unsafe { &*key }),
                map.probe_limit,
                Behavior::ProbeInsert,
                None,
            );

            if probe.slot.is_none() && probe.priority.is_none() {
                if !unsafe { self.grow(map.capacity << 1) } {
                    return Err(QuiesceError::capacity("set could not grow"));
                }
                continue;
            }

            map.bound_set(h, probe.n_probes);
            let object = probe.object;

            if let Some(first) = probe.priority {
                if let Some(slot) = probe.slot {
                    map.descs[slot].in_rh.store(true, Ordering::Relaxed);
                }
                let ret = self.put_robin_hood(first);
                if let Some(slot) = probe.slot {
                    map.descs[slot].in_rh.store(false, Ordering::Relaxed);
                }
                match ret {
                    1 => continue,
                    -1 => return Err(QuiesceError::capacity("set could not grow")),
                    _ => {}
                }

                let map = self.map();
                map.descs[first].entry.store(key as *mut K, Ordering::Release);
                map.descs[first].probes.store(probe.n_probes as u32, Ordering::Relaxed);
                self.add_wanted(first, None, h);

                // A duplicate found further along the chain is removed
                // after signalling concurrent probes to restart.
                if !object.is_null() {
                    map.bump_generation(h);
                    fence::store();
                    self.backward_shift_delete(probe.slot.expect("duplicate without a slot"));
                }
            } else {
                // Storing into the same slot: an atomic store suffices
                // for replacement.
                let slot = probe.slot.expect("probe returned neither slot nor priority");
                map.descs[slot].entry.store(key as *mut K, Ordering::Release);
                map.descs[slot].probes.store(probe.n_probes as u32, Ordering::Relaxed);
                if object.is_null() {
                    self.add_wanted(slot, None, h);
                }
            }

            if object.is_null() {
                let map = self.map();
                let n = map.n_entries.fetch_add(1, Ordering::Relaxed) + 1;
                if n << 1 > map.capacity {
                    unsafe { self.grow(map.capacity << 1) };
                }
            }

            return Ok(if object.is_null() {
                None
            } else {
                Some(object as *const K)
            });
        }
    }

    /// Replace an existing entry, returning it. `None` if absent.
    ///
    /// # Safety: as [`RobinHoodSet::put`].
    pub unsafe fn fas(&self, key: *const K) -> Option<*const K> {
        loop {
            let map = self.map();
            let h = self.hash(unsafe { &*key });
            let probe = map.probe(
                h,
                Some(unsafe { &*key }),
                map.bound_get(h),
                Behavior::Probe,
                None,
            );

            // Replacement semantics presume existence.
            if probe.object.is_null() {
                return None;
            }
            let object = probe.object;

            if let Some(first) = probe.priority {
                let slot = probe.slot.expect("match without a slot");
                map.descs[slot].in_rh.store(true, Ordering::Relaxed);
                let ret = self.put_robin_hood(first);
                map.descs[slot].in_rh.store(false, Ordering::Relaxed);
                match ret {
                    1 => continue,
                    -1 => return None,
                    _ => {}
                }

                let map = self.map();
                map.descs[first].entry.store(key as *mut K, Ordering::Release);
                map.bump_generation(h);
                fence::store();
                map.descs[first].probes.store(probe.n_probes as u32, Ordering::Relaxed);
                self.add_wanted(first, None, h);
                self.backward_shift_delete(slot);
            } else {
                let slot = probe.slot.expect("match without a slot");
                map.descs[slot].entry.store(key as *mut K, Ordering::Release);
                map.descs[slot].probes.store(probe.n_probes as u32, Ordering::Relaxed);
            }

            return Some(object as *const K);
        }
    }

    /// Remove the entry equal to `key`, returning it.
    ///
    /// # Safety: single writer.
    pub unsafe fn remove(&self, key: &K) -> Option<*const K> {
        let map = self.map();
        let h = self.hash(key);
        let probe = map.probe(h, Some(key), map.bound_get(h), Behavior::ProbeNoRh, None);

        if probe.object.is_null() {
            return None;
        }

        map.n_entries.fetch_sub(1, Ordering::Relaxed);
        self.backward_shift_delete(probe.slot.expect("match without a slot"));
        Some(probe.object as *const K)
    }

    /// Apply `f` to the entry equal to `key` (or `None` if absent) and
    /// act on the result: same pointer leaves the set unchanged, a new
    /// pointer replaces/inserts, `None` removes.
    ///
    /// `f` may be invoked again if the map reorganizes mid-operation.
    /// # Safety: as [`RobinHoodSet::put`]; returned pointers must stay
    /// valid while in the set.
    pub unsafe fn apply<F>(&self, key: &K, mut f: F) -> bool
    where
        F: FnMut(Option<*const K>) -> Option<*const K>,
    {
        loop {
            let map = self.map();
            let h = self.hash(key);
            let probe = map.probe(h, Some(key), map.bound_get(h), Behavior::ProbeNoRh, None);

            let object = if probe.object.is_null() {
                None
            } else {
                Some(probe.object as *const K)
            };

            match f(object) {
                None => {
                    if let Some(slot) = probe.slot.filter(|_| object.is_some()) {
                        map.n_entries.fetch_sub(1, Ordering::Relaxed);
                        self.backward_shift_delete(slot);
                    }
                    return true;
                }
                Some(insert) if object == Some(insert) => return true,
                Some(insert) => match object {
                    Some(_) => {
                        // In-place replacement of an equal key.
                        let slot = probe.slot.expect("match without a slot");
                        map.descs[slot].entry.store(insert as *mut K, Ordering::Release);
                        return true;
                    }
                    None => {
                        if unsafe { self.put(insert) } {
                            return true;
                        }
                        // The map grew underneath us; re-apply.
                        continue;
                    }
                },
            }
        }
    }

    /// Grow to at least `capacity` slots, rebuilding every probe chain.
    ///
    /// Leaves the set unchanged on failure.
    ///
    /// # Safety
    ///
    /// Single writer. The old map is retired through the reclaimer with
    /// `deferred = true`; the reclaimer must keep it alive past any
    /// concurrent reader (e.g. by routing through an epoch record), or
    /// the caller must guarantee no reader is active.
    pub unsafe fn grow(&self, capacity: usize) -> bool {
        let mut capacity = capacity;

        'restart: loop {
            let map = self.map();
            if map.capacity > capacity {
                return false;
            }

            let Some(update) = Map::<K>::create(capacity) else {
                return false;
            };
            debug!(from = map.capacity, to = update.capacity, "set grow");

            for k in 0..map.capacity {
                let prev_saved = map.descs[k].entry.load(Ordering::Relaxed);
                if prev_saved.is_null() {
                    continue;
                }

                let mut prev_saved = prev_saved;
                let mut h = self.hash(unsafe { &*prev_saved });
                let mut offset = h & update.mask;
                let mut probes = 0u64;

                loop {
                    probes += 1;
                    if probes > update.probe_limit {
                        // Probe limit hit: the new map needs to be even
                        // larger.
                        capacity <<= 1;
                        continue 'restart;
                    }

                    let cursor = &update.descs[offset as usize];
                    let incumbent = cursor.entry.load(Ordering::Relaxed);

                    if incumbent.is_null() {
                        cursor.entry.store(prev_saved, Ordering::Relaxed);
                        update.n_entries.fetch_add(1, Ordering::Relaxed);
                        cursor.probes.store(probes as u32, Ordering::Relaxed);
                        update.bound_set(h, probes);
                        break;
                    }

                    if u64::from(cursor.probes.load(Ordering::Relaxed)) < probes {
                        // Robin Hood displacement within the new map.
                        cursor.entry.store(prev_saved, Ordering::Relaxed);
                        update.bound_set(h, probes);
                        prev_saved = incumbent;
                        h = self.hash(unsafe { &*prev_saved });

                        let old_probes = u64::from(cursor.probes.load(Ordering::Relaxed));
                        cursor.probes.store(probes as u32, Ordering::Relaxed);
                        probes = old_probes - 1;
                        continue;
                    }

                    let wanted = cursor.wanted.load(Ordering::Relaxed);
                    cursor.wanted.store(wanted.saturating_add(1), Ordering::Relaxed);
                    offset = update.probe_next(offset, probes);
                }
            }

            // Commit the rebuilt entries with respect to map publication.
            fence::store();
            let previous = self.map.swap(Box::into_raw(update), Ordering::Release);
            unsafe {
                self.reclaimer
                    .reclaim(Retired::from_box(Box::from_raw(previous)), true);
            }
            return true;
        }
    }

    /// Rebuild the map at its current capacity, tightening probe
    /// chains.
    ///
    /// # Safety
    ///
    /// As [`RobinHoodSet::grow`].
    pub unsafe fn rebuild(&self) -> bool {
        unsafe { self.grow(self.map().capacity) }
    }

    /// Recompute the global probe maximum from the live descriptors.
    pub fn gc(&self) -> bool {
        let map = self.map();
        let mut max_probes = 0;

        for desc in map.descs.iter() {
            max_probes = max_probes.max(desc.probes.load(Ordering::Relaxed));
        }

        map.probe_maximum.store(max_probes, Ordering::Relaxed);
        true
    }

    /// Replace the map with an empty one of the same capacity.
    ///
    /// # Safety
    ///
    /// As [`RobinHoodSet::grow`].
    pub unsafe fn reset(&self) -> bool {
        unsafe { self.reset_size(self.map().capacity) }
    }

    /// Replace the map with an empty one of at least `capacity` slots.
    ///
    /// # Safety
    ///
    /// As [`RobinHoodSet::grow`].
    pub unsafe fn reset_size(&self, capacity: usize) -> bool {
        let Some(map) = Map::<K>::create(capacity) else {
            return false;
        };

        let previous = self.map.swap(Box::into_raw(map), Ordering::Release);
        unsafe {
            self.reclaimer
                .reclaim(Retired::from_box(Box::from_raw(previous)), true);
        }
        true
    }

    /// Transplant `source`'s storage into a set with a new reclaimer.
    ///
    /// The analogue of handing a map to fresh callbacks; the hash
    /// builder moves over so hashes stay compatible.
    pub fn adopt<R2: Reclaimer>(source: RobinHoodSet<K, R2, S>, reclaimer: R) -> Self {
        let source = std::mem::ManuallyDrop::new(source);
        Self {
            map: AtomicPtr::new(source.map.load(Ordering::Relaxed)),
            hasher: unsafe { ptr::read(&source.hasher) },
            reclaimer,
            _marker: PhantomData,
        }
    }

    /// Iterate over the stored entries.
    ///
    /// Not safe under concurrent writer activity; the caller must
    /// ensure stability (or protect the walk with an epoch section and
    /// tolerate a torn view).
    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            map: self.map(),
            offset: 0,
        }
    }

    /// Book-keep the `wanted` chain from `h`'s ideal bucket up to (and
    /// excluding) `slot`, starting at `old_slot` when given.
    fn add_wanted(&self, slot: usize, old_slot: Option<usize>, h: u64) {
        let map = self.map();
        let mut offset = h & map.mask;
        let end_offset = slot as u64;
        let mut probes = 1u64;
        let mut found_slot = old_slot.is_none();

        while offset != end_offset {
            if Some(offset as usize) == old_slot {
                found_slot = true;
            }
            if found_slot {
                let desc = &map.descs[offset as usize];
                let wanted = desc.wanted.load(Ordering::Relaxed);
                if wanted < SET_MAX_WANTED {
                    desc.wanted.store(wanted + 1, Ordering::Relaxed);
                }
            }
            offset = map.probe_next(offset, probes);
            probes += 1;
        }
    }

    /// Walk the chain back from `slot` decrementing `wanted`, stopping
    /// the decrements at `limit`. Returns the ideal bucket.
    fn remove_wanted(&self, slot: usize, limit: Option<usize>) -> u64 {
        let map = self.map();
        let mut probes = u64::from(map.descs[slot].probes.load(Ordering::Relaxed));
        let mut offset = slot as u64;
        let mut do_remove = true;

        while probes > 1 {
            probes -= 1;
            offset = map.probe_prev(offset, probes);
            if Some(offset as usize) == limit {
                do_remove = false;
            }
            let desc = &map.descs[offset as usize];
            let wanted = desc.wanted.load(Ordering::Relaxed);
            if wanted != SET_MAX_WANTED && do_remove {
                desc.wanted.store(wanted.wrapping_sub(1), Ordering::Relaxed);
            }
        }

        offset
    }

    /// Rotate displaced entries toward their ideal buckets starting
    /// from `orig_slot`, using a bounded stack of pending rotations.
    ///
    /// Returns 0 on success, 1 if the map grew (caller restarts), -1 on
    /// growth failure.
    fn put_robin_hood(&self, orig_slot: usize) -> i32 {
        let mut prevs = [0usize; SET_MAX_DISPLACEMENTS];
        let mut prevs_nb = 0usize;

        let map = self.map();
        let mut first = orig_slot;
        let mut n_probes = u64::from(map.descs[orig_slot].probes.load(Ordering::Relaxed));
        let mut h = 0u64;
        let mut orig_slot = orig_slot;

        loop {
            let key = map.descs[first].entry.load(Ordering::Relaxed);
            orig_slot = first;
            map.descs[orig_slot].in_rh.store(true, Ordering::Relaxed);

            let behavior = if prevs_nb == SET_MAX_DISPLACEMENTS {
                Behavior::ProbeNoRh
            } else {
                Behavior::ProbeRobinHood
            };
            let probe = map.probe(
                h,
                Some(unsafe { &*key }),
                map.probe_limit,
                behavior,
                Some((orig_slot, n_probes)),
            );

            if probe.slot.is_none() && probe.priority.is_none() {
                if !unsafe { self.grow(map.capacity << 1) } {
                    map.descs[orig_slot].in_rh.store(false, Ordering::Relaxed);
                    for &prev in &prevs[..prevs_nb] {
                        map.descs[prev].in_rh.store(false, Ordering::Relaxed);
                    }
                    return -1;
                }
                return 1;
            }

            if let Some(next) = probe.priority {
                // The walk found a slot whose occupant probes less than
                // the displaced entry would; rotate through it.
                let old_probes = u64::from(map.descs[next].probes.load(Ordering::Relaxed));

                map.descs[next].probes.store(probe.n_probes as u32, Ordering::Relaxed);
                h = map.first_offset(next, probe.n_probes);
                map.bound_set(h, probe.n_probes);
                prevs[prevs_nb] = orig_slot;
                prevs_nb += 1;
                n_probes = old_probes;
                first = next;
                continue;
            }

            // An empty slot was found.
            let slot = probe.slot.expect("empty slot expected");
            let n = probe.n_probes;
            h = map.first_offset(slot, n);
            map.bound_set(h, n);
            map.descs[slot].entry.store(key, Ordering::Release);
            map.bump_generation(h);
            fence::store();
            map.descs[slot].probes.store(n as u32, Ordering::Relaxed);
            map.descs[orig_slot].in_rh.store(false, Ordering::Relaxed);
            self.add_wanted(slot, Some(orig_slot), h);
            break;
        }

        // Unwind the rotation stack, pulling each displaced entry into
        // the slot freed by its successor.
        let mut cursor = orig_slot;
        while prevs_nb > 0 {
            prevs_nb -= 1;
            let prev = prevs[prevs_nb];

            let moved = map.descs[prev].entry.load(Ordering::Relaxed);
            map.descs[cursor].entry.store(moved, Ordering::Release);
            let probes = u64::from(map.descs[cursor].probes.load(Ordering::Relaxed));
            let bucket = map.first_offset(cursor, probes);
            self.add_wanted(cursor, Some(prev), bucket);
            map.bump_generation(bucket);
            fence::store();

            cursor = prev;
            map.descs[cursor].in_rh.store(false, Ordering::Relaxed);
        }

        0
    }

    /// Backward-shift deletion: refill the vacated slot from successor
    /// entries that want an earlier position, preserving the
    /// non-increasing probe-count invariant without tombstones.
    fn backward_shift_delete(&self, slot: usize) {
        let map = self.map();
        let mut slot = slot;
        let mut bucket = self.remove_wanted(slot, None);

        while map.descs[slot].wanted.load(Ordering::Relaxed) > 0 {
            let probe_maximum = u64::from(map.probe_maximum.load(Ordering::Relaxed));
            let mut wanted_probes = 1u64;
            let mut offset = 0u64;
            let mut probe = 0u64;

            // Find a successor able to move back into this slot.
            while wanted_probes < probe_maximum {
                probe = wanted_probes;
                offset = map.probe_next(slot as u64, probe);
                while probe < probe_maximum {
                    if u64::from(map.descs[offset as usize].probes.load(Ordering::Relaxed))
                        == probe + 1
                    {
                        break;
                    }
                    probe += 1;
                    offset = map.probe_next(offset, probe);
                }
                if probe < probe_maximum {
                    break;
                }
                wanted_probes += 1;
            }

            if wanted_probes == probe_maximum {
                map.descs[slot].wanted.store(0, Ordering::Relaxed);
                break;
            }

            let desc = &map.descs[slot];
            let wanted = desc.wanted.load(Ordering::Relaxed);
            if wanted < SET_MAX_WANTED {
                desc.wanted.store(wanted.wrapping_sub(1), Ordering::Relaxed);
            }
            desc.probes.store(wanted_probes as u32, Ordering::Relaxed);

            bucket = self.remove_wanted(offset as usize, Some(slot));
            let moved = map.descs[offset as usize].entry.load(Ordering::Relaxed);
            // Signal in-flight readers before the shifted pointer lands.
            map.bump_generation(bucket);
            fence::store();
            map.descs[slot].entry.store(moved, Ordering::Release);
            slot = offset as usize;
        }

        map.descs[slot].entry.store(ptr::null_mut(), Ordering::Release);
        let probes = map.descs[slot].probes.load(Ordering::Relaxed);
        if probes.wrapping_sub(1) < u32::from(PROBE_BOUND_MAX) {
            map.descs[bucket as usize]
                .probe_bound
                .store((probes - 1) as u8, Ordering::Relaxed);
        }
        map.descs[slot].probes.store(0, Ordering::Relaxed);
    }
}

impl<K, R, S> Drop for RobinHoodSet<K, R, S> {
    fn drop(&mut self) {
        // Entries are caller-owned; only the map storage goes.
        let map = *self.map.get_mut();
        if !map.is_null() {
            drop(unsafe { Box::from_raw(map) });
        }
    }
}

/// Entry iterator. See [`RobinHoodSet::iter`] for the stability
/// contract.
pub struct Iter<'a, K> {
    map: &'a Map<K>,
    offset: usize,
}

impl<'a, K> Iterator for Iter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<&'a K> {
        while self.offset < self.map.capacity {
            let entry = self.map.descs[self.offset].entry.load(Ordering::Acquire);
            self.offset += 1;
            if !entry.is_null() {
                return Some(unsafe { &*entry });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests;
