use super::*;
use std::collections::HashSet;
use std::hash::Hasher;

/// Hash builder that sends every key to bucket 0, degenerating the set
/// into a single probe chain.
#[derive(Default, Clone)]
struct Colliding;

struct CollidingHasher;

impl Hasher for CollidingHasher {
    fn finish(&self) -> u64 {
        0
    }

    fn write(&mut self, _bytes: &[u8]) {}
}

impl BuildHasher for Colliding {
    type Hasher = CollidingHasher;

    fn build_hasher(&self) -> CollidingHasher {
        CollidingHasher
    }
}

/// Backing storage for test keys; the set stores raw pointers into it.
fn keys(values: impl IntoIterator<Item = u64>) -> Vec<Box<u64>> {
    values.into_iter().map(Box::new).collect()
}

#[test]
fn test_put_get_remove_round_trip() {
    let set = RobinHoodSet::<u64>::with_capacity(16).unwrap();
    let storage = keys(1..=8);

    for key in &storage {
        assert!(unsafe { set.put(&**key) });
    }
    assert_eq!(set.len(), 8);

    for key in 1..=8u64 {
        assert_eq!(set.get(&key), Some(&key));
    }
    assert_eq!(set.get(&99), None);

    let removed = unsafe { set.remove(&3) }.unwrap();
    assert_eq!(unsafe { *removed }, 3);
    assert_eq!(set.get(&3), None);
    assert_eq!(set.len(), 7);

    // Every other entry stays reachable.
    for key in [1, 2, 4, 5, 6, 7, 8u64] {
        assert_eq!(set.get(&key), Some(&key));
    }
}

#[test]
fn test_put_rejects_duplicate() {
    let set = RobinHoodSet::<u64>::with_capacity(16).unwrap();
    let storage = keys([7, 7]);

    assert!(unsafe { set.put(&*storage[0]) });
    assert!(!unsafe { set.put(&*storage[1]) });
    assert_eq!(set.len(), 1);
}

#[test]
fn test_put_unique_skips_duplicate_scan() {
    let set = RobinHoodSet::<u64>::with_capacity(16).unwrap();
    let storage = keys(1..=4);

    for key in &storage {
        assert!(unsafe { set.put_unique(&**key) });
    }
    assert_eq!(set.len(), 4);
    for key in 1..=4u64 {
        assert_eq!(set.get(&key), Some(&key));
    }
}

#[test]
fn test_set_returns_previous() {
    let set = RobinHoodSet::<u64>::with_capacity(16).unwrap();
    let first = Box::new(5u64);
    let second = Box::new(5u64);

    assert_eq!(unsafe { set.set(&*first) }.unwrap(), None);
    let previous = unsafe { set.set(&*second) }.unwrap().unwrap();
    assert!(std::ptr::eq(previous, &*first));
    assert_eq!(set.len(), 1);
}

#[test]
fn test_fas_replaces_only_existing() {
    let set = RobinHoodSet::<u64>::with_capacity(16).unwrap();
    let first = Box::new(5u64);
    let second = Box::new(5u64);

    assert_eq!(unsafe { set.fas(&*second) }, None);

    unsafe { set.put(&*first) };
    let previous = unsafe { set.fas(&*second) }.unwrap();
    assert!(std::ptr::eq(previous, &*first));
    assert_eq!(set.len(), 1);
}

#[test]
fn test_apply_insert_replace_remove() {
    let set = RobinHoodSet::<u64>::with_capacity(16).unwrap();
    let first = Box::new(9u64);
    let second = Box::new(9u64);

    // Absent + Some(new) inserts.
    assert!(unsafe { set.apply(&9, |current| {
        assert_eq!(current, None);
        Some(&*first as *const u64)
    }) });
    assert_eq!(set.len(), 1);

    // Present + same pointer is a no-op.
    assert!(unsafe { set.apply(&9, |current| current) });
    assert_eq!(set.len(), 1);

    // Present + different pointer replaces.
    assert!(unsafe { set.apply(&9, |current| {
        assert!(std::ptr::eq(current.unwrap(), &*first));
        Some(&*second as *const u64)
    }) });
    assert!(std::ptr::eq(set.get(&9).unwrap(), &*second));

    // Present + None removes.
    assert!(unsafe { set.apply(&9, |_| None) });
    assert_eq!(set.get(&9), None);
    assert_eq!(set.len(), 0);
}

#[test]
fn test_degenerate_chain_probes_are_dense() {
    let set =
        RobinHoodSet::<u64, DropNow, Colliding>::with_capacity_and(32, DropNow, Colliding).unwrap();
    let storage = keys(1..=10);

    for key in &storage {
        assert!(unsafe { set.put(&**key) });
    }

    // All ten keys hash to bucket 0: the probe counts along the chain
    // are exactly 1..=10 and the bucket's bound covers the longest.
    let map = set.map();
    let mut probes: Vec<u32> = map
        .descs
        .iter()
        .filter(|d| !d.entry.load(Ordering::Relaxed).is_null())
        .map(|d| d.probes.load(Ordering::Relaxed))
        .collect();
    probes.sort_unstable();
    assert_eq!(probes, (1..=10).collect::<Vec<_>>());
    assert_eq!(map.descs[0].probe_bound.load(Ordering::Relaxed), 10);

    // Backward shift after removing the middle entry re-densifies the
    // chain and tightens the bound.
    assert!(unsafe { set.remove(&5) }.is_some());

    let map = set.map();
    let mut probes: Vec<u32> = map
        .descs
        .iter()
        .filter(|d| !d.entry.load(Ordering::Relaxed).is_null())
        .map(|d| d.probes.load(Ordering::Relaxed))
        .collect();
    probes.sort_unstable();
    assert_eq!(probes, (1..=9).collect::<Vec<_>>());
    assert_eq!(map.descs[0].probe_bound.load(Ordering::Relaxed), 9);

    for key in [1, 2, 3, 4, 6, 7, 8, 9, 10u64] {
        assert_eq!(set.get(&key), Some(&key));
    }
}

#[test]
fn test_load_factor_stays_under_half() {
    let set = RobinHoodSet::<u64>::with_capacity(8).unwrap();
    let storage = keys(1..=200);

    for key in &storage {
        assert!(unsafe { set.put(&**key) });
        assert!(set.len() * 2 < set.capacity() + 1, "load factor invariant");
    }

    assert!(set.capacity() >= 400 / 2);
    for key in 1..=200u64 {
        assert_eq!(set.get(&key), Some(&key));
    }
}

#[test]
fn test_probe_bound_covers_every_entry() {
    let set =
        RobinHoodSet::<u64, DropNow, Colliding>::with_capacity_and(64, DropNow, Colliding).unwrap();
    let storage = keys(1..=20);

    for key in &storage {
        unsafe { set.put(&**key) };
    }
    unsafe { set.remove(&7) };
    unsafe { set.remove(&13) };

    let map = set.map();
    let bound = map.bound_get(0);
    for desc in map.descs.iter() {
        if !desc.entry.load(Ordering::Relaxed).is_null() {
            assert!(u64::from(desc.probes.load(Ordering::Relaxed)) <= bound);
        }
    }
}

#[test]
fn test_grow_preserves_entries() {
    let set = RobinHoodSet::<u64>::with_capacity(16).unwrap();
    let storage = keys(1..=6);

    for key in &storage {
        unsafe { set.put(&**key) };
    }
    assert!(unsafe { set.grow(256) });
    assert_eq!(set.capacity(), 256);
    assert_eq!(set.len(), 6);
    for key in 1..=6u64 {
        assert_eq!(set.get(&key), Some(&key));
    }
}

#[test]
fn test_rebuild_and_gc_tighten_probe_maximum() {
    let set =
        RobinHoodSet::<u64, DropNow, Colliding>::with_capacity_and(64, DropNow, Colliding).unwrap();
    let storage = keys(1..=16);

    for key in &storage {
        unsafe { set.put(&**key) };
    }
    for key in 2..=16u64 {
        unsafe { set.remove(&key) };
    }

    assert!(set.stats().probe_maximum >= 1);
    assert!(set.gc());
    assert_eq!(set.stats().probe_maximum, 1);

    assert!(unsafe { set.rebuild() });
    assert_eq!(set.get(&1), Some(&1));
    assert_eq!(set.len(), 1);
}

#[test]
fn test_reset_empties_the_set() {
    let set = RobinHoodSet::<u64>::with_capacity(16).unwrap();
    let storage = keys(1..=4);

    for key in &storage {
        unsafe { set.put(&**key) };
    }
    assert!(unsafe { set.reset() });
    assert_eq!(set.len(), 0);
    assert_eq!(set.get(&1), None);

    // The set stays usable after the swap.
    assert!(unsafe { set.put(&*storage[0]) });
    assert_eq!(set.get(&1), Some(&1));
}

#[test]
fn test_iterator_sees_all_entries() {
    let set = RobinHoodSet::<u64>::with_capacity(32).unwrap();
    let storage = keys(1..=12);

    for key in &storage {
        unsafe { set.put(&**key) };
    }

    let seen: HashSet<u64> = set.iter().copied().collect();
    assert_eq!(seen, (1..=12).collect::<HashSet<_>>());
}

#[test]
fn test_adopt_transplants_storage() {
    let source = RobinHoodSet::<u64>::with_capacity(16).unwrap();
    let storage = keys(1..=3);

    for key in &storage {
        unsafe { source.put(&**key) };
    }

    let adopted = RobinHoodSet::adopt(source, DropNow);
    assert_eq!(adopted.len(), 3);
    for key in 1..=3u64 {
        assert_eq!(adopted.get(&key), Some(&key));
    }
}

#[test]
fn test_matches_reference_model() {
    let set = RobinHoodSet::<u64>::with_capacity(8).unwrap();
    let storage = keys(0..512);
    let mut model: HashSet<u64> = HashSet::new();

    // Deterministic pseudo-random op sequence.
    let mut state = 0x9e3779b97f4a7c15u64;
    for _ in 0..4096 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let key = (state >> 33) % 512;
        if state & 1 == 0 {
            assert_eq!(unsafe { set.put(&*storage[key as usize]) }, model.insert(key));
        } else {
            assert_eq!(unsafe { set.remove(&key) }.is_some(), model.remove(&key));
        }
    }

    assert_eq!(set.len(), model.len());
    for key in 0..512u64 {
        assert_eq!(set.get(&key).is_some(), model.contains(&key));
    }
}
