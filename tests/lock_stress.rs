//! Mutual-exclusion stress for the reader/writer lock family.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

use quiesce::{ByteLock, RwLock};

#[test]
fn test_rwlock_mutual_exclusion() {
    let lock = Arc::new(RwLock::new());
    let shared = Arc::new(AtomicI64::new(0));
    const ITERATIONS: usize = 50_000;

    let mut handles = Vec::new();

    for _ in 0..4 {
        let lock = lock.clone();
        let shared = shared.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..ITERATIONS {
                lock.read_lock();
                // Readers see the counter balanced while any writer is
                // excluded.
                shared.fetch_add(1, Ordering::Relaxed);
                shared.fetch_sub(1, Ordering::Relaxed);
                lock.read_unlock();
            }
        }));
    }

    for _ in 0..2 {
        let lock = lock.clone();
        let shared = shared.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..ITERATIONS {
                lock.write_lock();
                let observed = shared.load(Ordering::Relaxed);
                assert_eq!(observed, 0, "reader active inside writer section");
                lock.write_unlock();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_rwlock_latch_readers_wait_out_writer() {
    let lock = Arc::new(RwLock::new());
    let shared = Arc::new(AtomicI64::new(0));
    const ITERATIONS: usize = 20_000;

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let lock = lock.clone();
            let shared = shared.clone();
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    lock.read_latchlock();
                    shared.fetch_add(1, Ordering::Relaxed);
                    shared.fetch_sub(1, Ordering::Relaxed);
                    lock.read_unlock();
                }
            })
        })
        .collect();

    let latcher = {
        let lock = lock.clone();
        let shared = shared.clone();
        thread::spawn(move || {
            for _ in 0..ITERATIONS / 10 {
                lock.write_latch();
                lock.write_lock();
                assert_eq!(shared.load(Ordering::Relaxed), 0);
                lock.write_unlock();
                lock.write_unlatch();
            }
        })
    };

    for reader in readers {
        reader.join().unwrap();
    }
    latcher.join().unwrap();
}

#[test]
fn test_bytelock_slotted_exclusion() {
    // 8 slotted readers (slots 1..=8) and one writer (slot 9): the
    // writer must observe the shared counter balanced in its section.
    let lock = Arc::new(ByteLock::new());
    let shared = Arc::new(AtomicI64::new(0));
    const ITERATIONS: usize = 100_000;

    let mut handles = Vec::new();

    for slot in 1..=8u32 {
        let lock = lock.clone();
        let shared = shared.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..ITERATIONS {
                lock.read_lock(slot);
                shared.fetch_add(1, Ordering::Relaxed);
                shared.fetch_sub(1, Ordering::Relaxed);
                lock.read_unlock(slot);
            }
        }));
    }

    {
        let lock = lock.clone();
        let shared = shared.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..ITERATIONS / 10 {
                lock.write_lock(9);
                assert_eq!(
                    shared.load(Ordering::Relaxed),
                    0,
                    "slotted reader active inside writer section"
                );
                lock.write_unlock();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_bytelock_unslotted_exclusion() {
    let lock = Arc::new(ByteLock::new());
    let shared = Arc::new(AtomicI64::new(0));
    const ITERATIONS: usize = 50_000;

    let mut handles = Vec::new();

    for _ in 0..4 {
        let lock = lock.clone();
        let shared = shared.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..ITERATIONS {
                lock.read_lock(ByteLock::UNSLOTTED);
                shared.fetch_add(1, Ordering::Relaxed);
                shared.fetch_sub(1, Ordering::Relaxed);
                lock.read_unlock(ByteLock::UNSLOTTED);
            }
        }));
    }

    {
        let lock = lock.clone();
        let shared = shared.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..ITERATIONS / 10 {
                lock.write_lock(1);
                assert_eq!(shared.load(Ordering::Relaxed), 0);
                lock.write_unlock();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_recursive_writer_under_reader_pressure() {
    use quiesce::RecursiveRwLock;

    let lock = Arc::new(RecursiveRwLock::new());
    let shared = Arc::new(AtomicI64::new(0));
    const ITERATIONS: usize = 20_000;

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let lock = lock.clone();
            let shared = shared.clone();
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    lock.read_lock();
                    shared.fetch_add(1, Ordering::Relaxed);
                    shared.fetch_sub(1, Ordering::Relaxed);
                    lock.read_unlock();
                }
            })
        })
        .collect();

    let writer = {
        let lock = lock.clone();
        let shared = shared.clone();
        thread::spawn(move || {
            for _ in 0..ITERATIONS / 10 {
                lock.write_lock(1);
                lock.write_lock(1);
                assert_eq!(shared.load(Ordering::Relaxed), 0);
                lock.write_unlock();
                assert_eq!(shared.load(Ordering::Relaxed), 0);
                lock.write_unlock();
            }
        })
    };

    for reader in readers {
        reader.join().unwrap();
    }
    writer.join().unwrap();
}
