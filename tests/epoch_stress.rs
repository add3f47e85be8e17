//! Epoch reclamation safety under reader/writer churn: no reader ever
//! observes a freed object, every deferred destructor runs exactly
//! once.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use quiesce::Epoch;

/// A published object with a liveness canary readers can check.
struct Node {
    canary: AtomicUsize,
    value: usize,
}

const CANARY_LIVE: usize = 0x5eed;
const CANARY_DEAD: usize = 0xdead;

/// Raw pointer wrapper so deferred destructors can move across the
/// dispatching thread.
struct SendPtr(*mut Node);
unsafe impl Send for SendPtr {}

#[test]
fn test_readers_never_observe_freed_objects() {
    let epoch = Arc::new(Epoch::new());
    let slot = Arc::new(AtomicPtr::new(Box::into_raw(Box::new(Node {
        canary: AtomicUsize::new(CANARY_LIVE),
        value: 0,
    }))));
    let stop = Arc::new(AtomicBool::new(false));
    let freed = Arc::new(AtomicUsize::new(0));

    let n_readers = num_cpus::get().clamp(2, 4);
    let readers: Vec<_> = (0..n_readers)
        .map(|_| {
            let epoch = epoch.clone();
            let slot = slot.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let record = epoch.register();
                while !stop.load(Ordering::Relaxed) {
                    record.begin();
                    let node = unsafe { &*slot.load(Ordering::Acquire) };
                    assert_eq!(
                        node.canary.load(Ordering::Relaxed),
                        CANARY_LIVE,
                        "reader observed a reclaimed object"
                    );
                    std::hint::black_box(node.value);
                    record.end();
                }
            })
        })
        .collect();

    let writer = {
        let epoch = epoch.clone();
        let slot = slot.clone();
        let freed = freed.clone();
        thread::spawn(move || {
            let record = epoch.register();
            for i in 1..=2_000usize {
                let fresh = Box::into_raw(Box::new(Node {
                    canary: AtomicUsize::new(CANARY_LIVE),
                    value: i,
                }));
                let old = SendPtr(slot.swap(fresh, Ordering::Release));

                let freed = freed.clone();
                record.defer(move || {
                    let old = old;
                    let node = unsafe { Box::from_raw(old.0) };
                    node.canary.store(CANARY_DEAD, Ordering::Relaxed);
                    freed.fetch_add(1, Ordering::Relaxed);
                });

                if i % 64 == 0 {
                    record.poll();
                }
            }

            record.barrier();
        })
    };

    writer.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(freed.load(Ordering::Relaxed), 2_000);

    // The final node is still live.
    let last = unsafe { Box::from_raw(slot.load(Ordering::Relaxed)) };
    assert_eq!(last.canary.load(Ordering::Relaxed), CANARY_LIVE);
}

#[test]
fn test_barrier_with_active_reader_on_other_thread() {
    let epoch = Arc::new(Epoch::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    // A reader that repeatedly enters and leaves short sections.
    let reader = {
        let epoch = epoch.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let record = epoch.register();
            while !stop.load(Ordering::Relaxed) {
                record.begin();
                std::hint::spin_loop();
                record.end();
            }
        })
    };

    let writer_record = epoch.register();
    for _ in 0..3 {
        let counter = counter.clone();
        writer_record.defer(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    // The barrier must make progress past the churning reader.
    writer_record.barrier();
    assert_eq!(counter.load(Ordering::Relaxed), 3);

    stop.store(true, Ordering::Relaxed);
    reader.join().unwrap();
}

#[test]
fn test_concurrent_writers_share_grace_periods() {
    let epoch = Arc::new(Epoch::new());
    let dispatched = Arc::new(AtomicUsize::new(0));
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 500;

    let writers: Vec<_> = (0..WRITERS)
        .map(|_| {
            let epoch = epoch.clone();
            let dispatched = dispatched.clone();
            thread::spawn(move || {
                let record = epoch.register();
                for i in 0..PER_WRITER {
                    let dispatched = dispatched.clone();
                    record.defer(move || {
                        dispatched.fetch_add(1, Ordering::Relaxed);
                    });
                    if i % 32 == 0 {
                        record.synchronize();
                    }
                }
                record.barrier();
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(dispatched.load(Ordering::Relaxed), WRITERS * PER_WRITER);
}

#[test]
fn test_recycled_records_across_threads() {
    let epoch = Arc::new(Epoch::new());

    // Register and drop on one thread.
    {
        let record = epoch.register();
        record.begin();
        record.end();
    }

    // Claim the freed slot from another thread.
    let epoch2 = epoch.clone();
    thread::spawn(move || {
        let record = epoch2.recycle().expect("record should be recyclable");
        record.begin();
        record.end();
        assert!(record.poll());
    })
    .join()
    .unwrap();
}
